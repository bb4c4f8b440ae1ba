use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use nugget_core::config::{EmbeddingDefaults, EmbeddingProviderKind};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

use crate::errors::{RetrievalError, RetrievalResult};
use crate::fts::tokenize;

/// Turns text into vectors. Implementations must be deterministic per model.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;

    /// Output dimension, when known ahead of the first call.
    fn dims(&self) -> Option<usize>;

    async fn embed_many(&self, texts: &[String]) -> RetrievalResult<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        self.embed_many(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| RetrievalError::Embedding("provider returned no vector".to_string()))
    }
}

/// Build the provider named in settings.
pub fn embedder_from_settings(settings: &EmbeddingDefaults) -> Arc<dyn EmbeddingProvider> {
    match settings.provider {
        EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedder::new(settings)),
        EmbeddingProviderKind::Hashing => Arc::new(HashingEmbedder::new(
            settings.dim.unwrap_or(HashingEmbedder::DEFAULT_DIMS),
        )),
    }
}

/// Ollama `/api/embed` client.
#[derive(Debug)]
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    declared_dims: Option<usize>,
    learned_dims: OnceLock<usize>,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(settings: &EmbeddingDefaults) -> Self {
        Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            declared_dims: settings.dim,
            learned_dims: OnceLock::new(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> Option<usize> {
        self.declared_dims.or_else(|| self.learned_dims.get().copied())
    }

    async fn embed_many(&self, inputs: &[String]) -> RetrievalResult<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/embed", self.base_url);
        let body = EmbedRequest {
            model: &self.model,
            input: inputs,
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Embedding(format!(
                "embedding request failed: {status} {text}"
            )));
        }

        let payload: EmbedResponse = response.json().await?;
        let vectors = match (payload.embeddings, payload.embedding) {
            (Some(embeddings), _) => embeddings,
            (None, Some(embedding)) => vec![embedding],
            (None, None) => {
                return Err(RetrievalError::Embedding(
                    "embedding response missing vectors".to_string(),
                ));
            }
        };
        if let Some(first) = vectors.first() {
            let _ = self.learned_dims.set(first.len());
        }
        Ok(vectors)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedResponse {
    embeddings: Option<Vec<Vec<f32>>>,
    embedding: Option<Vec<f32>>,
}

/// Local embedder: signed feature hashing of normalized terms.
///
/// No semantic generalization, but deterministic, offline and cheap, which
/// makes it the embedder for tests and for brains without a model server.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMS: usize = 384;

    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model_id: format!("hashing-v1-{dims}"),
        }
    }

    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for term in tokenize(text) {
            let digest = Sha256::digest(term.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> Option<usize> {
        Some(self.dims)
    }

    async fn embed_many(&self, texts: &[String]) -> RetrievalResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.vectorize(text)).collect())
    }
}

/// Per-call timeout plus jittered exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: usize,
    pub timeout: Duration,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &EmbeddingDefaults) -> Self {
        Self {
            retries: settings.retries,
            timeout: Duration::from_millis(settings.timeout_ms),
            base_delay: Duration::from_millis(100),
        }
    }

    fn strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&EmbeddingDefaults::default())
    }
}

/// Embed `texts`, retrying transient failures. Vectors are checked for count
/// and (when declared) dimension.
pub async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    policy: &RetryPolicy,
) -> RetrievalResult<Vec<Vec<f32>>> {
    let timeout = policy.timeout;
    Retry::spawn(policy.strategy(), move || async move {
        let vectors = tokio::time::timeout(timeout, provider.embed_many(texts))
            .await
            .map_err(|_| RetrievalError::Timeout {
                operation: "embedding",
                millis: timeout.as_millis() as u64,
            })??;
        check_vectors(&vectors, texts.len(), provider.dims())?;
        Ok(vectors)
    })
    .await
}

fn check_vectors(vectors: &[Vec<f32>], expected: usize, dims: Option<usize>) -> RetrievalResult<()> {
    if vectors.len() != expected {
        return Err(RetrievalError::Embedding(format!(
            "provider returned {} vectors for {expected} inputs",
            vectors.len()
        )));
    }
    let dims = dims.or_else(|| vectors.first().map(Vec::len));
    if let Some(expected) = dims
        && let Some(bad) = vectors.iter().find(|v| v.len() != expected)
    {
        return Err(RetrievalError::EmbeddingDimMismatch {
            expected,
            actual: bad.len(),
        });
    }
    Ok(())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyEmbedder {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        fn model_id(&self) -> &str {
            "flaky"
        }

        fn dims(&self) -> Option<usize> {
            Some(2)
        }

        async fn embed_many(&self, texts: &[String]) -> RetrievalResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RetrievalError::Embedding("transient".to_string()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn fast_policy(retries: usize) -> RetryPolicy {
        RetryPolicy {
            retries,
            timeout: Duration::from_millis(500),
            base_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Evict stale cache entries").await.expect("embed");
        let b = embedder.embed("evict STALE cache entries!").await.expect("embed");

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(embedder.model_id(), "hashing-v1-64");
    }

    #[tokio::test]
    async fn hashing_embedder_separates_unrelated_text() {
        let embedder = HashingEmbedder::default();
        let query = embedder.vectorize("evict stale cache entries");
        let related = embedder.vectorize("cache invalidation evicts stale entries");
        let unrelated = embedder.vectorize("capsule wardrobe with versatile garments");

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let provider = FlakyEmbedder {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        };
        let texts = vec!["a".to_string(), "b".to_string()];

        let vectors = embed_with_retry(&provider, &texts, &fast_policy(3))
            .await
            .expect("eventually succeeds");

        assert_eq!(vectors.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retries() {
        let provider = FlakyEmbedder {
            failures_left: AtomicUsize::new(10),
            calls: AtomicUsize::new(0),
        };
        let texts = vec!["a".to_string()];

        let err = embed_with_retry(&provider, &texts, &fast_policy(1))
            .await
            .unwrap_err();

        assert!(err.is_provider_failure());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejects_wrong_vector_shapes() {
        assert!(check_vectors(&[vec![1.0]], 2, None).is_err());
        assert!(matches!(
            check_vectors(&[vec![1.0, 2.0], vec![1.0]], 2, None),
            Err(RetrievalError::EmbeddingDimMismatch { expected: 2, actual: 1 })
        ));
        assert!(check_vectors(&[vec![1.0, 2.0]], 1, Some(2)).is_ok());
    }
}
