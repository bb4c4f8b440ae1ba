//! Layer 1: hybrid vector + full-text search fused with reciprocal rank fusion.

use std::collections::HashMap;
use std::sync::Arc;

use nugget_core::config::SearchDefaults;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embeddings::{EmbeddingProvider, RetryPolicy, embed_with_retry};
use crate::errors::{RetrievalError, RetrievalResult};
use crate::index::IndexSnapshot;
use crate::models::ChunkKey;

/// One chunk after fusion. Ranks are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedHit {
    pub chunk: ChunkKey,
    pub score: f64,
    pub vector_rank: Option<usize>,
    pub text_rank: Option<usize>,
}

/// Best chunk of a document plus pointers to its other matching chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentHit {
    pub document_id: String,
    pub best: FusedHit,
    pub other_chunks: Vec<ChunkKey>,
}

impl DocumentHit {
    pub fn score(&self) -> f64 {
        self.best.score
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub hits: Vec<DocumentHit>,
    /// The query could not be embedded; only full-text results were used.
    pub text_only: bool,
}

/// Reciprocal rank fusion of two ranked lists: each list contributes
/// `1 / (k + rank)` for every chunk it contains. Output is ordered by score,
/// then chunk key.
pub fn rrf_fuse(k: usize, vector: &[ChunkKey], text: &[ChunkKey]) -> Vec<FusedHit> {
    let mut fused: HashMap<&ChunkKey, FusedHit> = HashMap::new();
    for (index, key) in vector.iter().enumerate() {
        let rank = index + 1;
        let hit = fused.entry(key).or_insert_with(|| empty_hit(key));
        hit.score += 1.0 / (k + rank) as f64;
        hit.vector_rank.get_or_insert(rank);
    }
    for (index, key) in text.iter().enumerate() {
        let rank = index + 1;
        let hit = fused.entry(key).or_insert_with(|| empty_hit(key));
        hit.score += 1.0 / (k + rank) as f64;
        hit.text_rank.get_or_insert(rank);
    }

    let mut hits: Vec<FusedHit> = fused.into_values().collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk.cmp(&b.chunk)));
    hits
}

fn empty_hit(key: &ChunkKey) -> FusedHit {
    FusedHit {
        chunk: key.clone(),
        score: 0.0,
        vector_rank: None,
        text_rank: None,
    }
}

/// Equal scores go to the most recently modified document, then the lower
/// chunk key.
fn order_by_recency(hits: &mut [FusedHit], snapshot: &IndexSnapshot) {
    let modified = |key: &ChunkKey| {
        snapshot
            .document(&key.document_id)
            .map(|doc| doc.modified)
    };
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| modified(&b.chunk).cmp(&modified(&a.chunk)))
            .then_with(|| a.chunk.cmp(&b.chunk))
    });
}

/// Collapse ordered chunk hits to one entry per document, keeping order.
pub fn group_by_document(hits: Vec<FusedHit>) -> Vec<DocumentHit> {
    let mut grouped: Vec<DocumentHit> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for hit in hits {
        match positions.get(&hit.chunk.document_id) {
            Some(&position) => grouped[position].other_chunks.push(hit.chunk),
            None => {
                positions.insert(hit.chunk.document_id.clone(), grouped.len());
                grouped.push(DocumentHit {
                    document_id: hit.chunk.document_id.clone(),
                    best: hit,
                    other_chunks: Vec::new(),
                });
            }
        }
    }
    grouped
}

#[derive(Debug, Clone)]
pub struct HybridSearch {
    settings: SearchDefaults,
    retry: RetryPolicy,
}

impl HybridSearch {
    pub fn new(settings: SearchDefaults, retry: RetryPolicy) -> Self {
        Self { settings, retry }
    }

    pub fn settings(&self) -> &SearchDefaults {
        &self.settings
    }

    /// Embed the query with the snapshot's model.
    ///
    /// A different model is fatal. A provider that keeps failing yields
    /// `None` so the caller can continue with full-text search alone.
    pub async fn embed_query(
        &self,
        snapshot: &IndexSnapshot,
        embedder: &dyn EmbeddingProvider,
        query: &str,
    ) -> RetrievalResult<Option<Vec<f32>>> {
        if embedder.model_id() != snapshot.model_id() {
            return Err(RetrievalError::ModelMismatch {
                index_model: snapshot.model_id().to_string(),
                query_model: embedder.model_id().to_string(),
            });
        }

        match embed_with_retry(embedder, &[query.to_string()], &self.retry).await {
            Ok(mut vectors) => {
                let vector = vectors.pop().unwrap_or_default();
                if let Some(dims) = snapshot.dims()
                    && dims != vector.len()
                {
                    warn!(
                        expected = dims,
                        actual = vector.len(),
                        "query vector has the wrong dimension, using full-text search only"
                    );
                    return Ok(None);
                }
                Ok(Some(vector))
            }
            Err(err) if err.is_provider_failure() => {
                warn!(model = %embedder.model_id(), "query embedding failed, using full-text search only: {err}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Run both sub-searches concurrently and fuse them per document.
    pub async fn fuse(
        &self,
        snapshot: Arc<IndexSnapshot>,
        query_vector: Option<Vec<f32>>,
        query: &str,
    ) -> RetrievalResult<Vec<DocumentHit>> {
        let vector_task = {
            let snapshot = Arc::clone(&snapshot);
            let limit = self.settings.vector_limit;
            tokio::task::spawn_blocking(move || match query_vector {
                Some(vector) => snapshot.query_vectors(&vector, limit),
                None => Vec::new(),
            })
        };
        let text_task = {
            let snapshot = Arc::clone(&snapshot);
            let limit = self.settings.text_limit;
            let query = query.to_string();
            tokio::task::spawn_blocking(move || snapshot.query_text(&query, limit))
        };

        let (vector_hits, text_hits) = tokio::join!(vector_task, text_task);
        let vector_hits =
            vector_hits.map_err(|err| RetrievalError::Io(std::io::Error::other(err)))?;
        let text_hits =
            text_hits.map_err(|err| RetrievalError::Io(std::io::Error::other(err)))??;
        debug!(
            vector = vector_hits.len(),
            text = text_hits.len(),
            "layer 1 sub-searches finished"
        );

        let vector_keys: Vec<ChunkKey> = vector_hits.into_iter().map(|(key, _)| key).collect();
        let text_keys: Vec<ChunkKey> = text_hits.into_iter().map(|(key, _)| key).collect();
        let mut fused = rrf_fuse(self.settings.rrf_k, &vector_keys, &text_keys);
        order_by_recency(&mut fused, &snapshot);
        Ok(group_by_document(fused))
    }

    pub async fn search(
        &self,
        snapshot: Arc<IndexSnapshot>,
        embedder: &dyn EmbeddingProvider,
        query: &str,
    ) -> RetrievalResult<SearchOutcome> {
        let query_vector = self.embed_query(&snapshot, embedder, query).await?;
        let text_only = query_vector.is_none();
        let hits = self.fuse(snapshot, query_vector, query).await?;
        Ok(SearchOutcome { hits, text_only })
    }
}
