//! Retrieval engine configuration types.
//!
//! These types define the resolved (non-optional) settings used by
//! `nugget-retrieval`. They are created from the user-facing
//! [`RetrievalToolsSettings`] TOML structs via `From`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::settings::{
    ChunkingOverrides, EmbeddingOverrides, IndexOverrides, RankerOverrides,
    RetrievalToolsSettings, SearchOverrides,
};

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// Ollama-compatible `/api/embed` endpoint
    #[default]
    Ollama,
    /// Local deterministic feature hashing, no network
    Hashing,
}

impl EmbeddingProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Hashing => "hashing",
        }
    }
}

/// Which relevance ranker to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankerProviderKind {
    /// Keep the fused order
    #[default]
    Passthrough,
    /// OpenAI-compatible chat completions endpoint
    OpenAiCompatible,
}

impl RankerProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::OpenAiCompatible => "openai_compatible",
        }
    }
}

/// Resolved retrieval settings (all values filled with defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default)]
    pub embedding: EmbeddingDefaults,
    #[serde(default)]
    pub chunking: ChunkingDefaults,
    #[serde(default)]
    pub search: SearchDefaults,
    #[serde(default)]
    pub ranker: RankerDefaults,
    /// Brain directory; usually filled from `[brain].root` or the CLI.
    #[serde(default)]
    pub brain_root: Option<PathBuf>,
    /// Embedding cache path (defaults to `<brain>/.nugget/index.sqlite3`).
    #[serde(default)]
    pub cache_path_override: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub persist_embeddings: bool,
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            embedding: EmbeddingDefaults::default(),
            chunking: ChunkingDefaults::default(),
            search: SearchDefaults::default(),
            ranker: RankerDefaults::default(),
            brain_root: None,
            cache_path_override: None,
            persist_embeddings: default_true(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

/// Resolved embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingDefaults {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub dim: Option<usize>,
    #[serde(default = "default_embedding_batch")]
    pub batch: usize,
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_embedding_retries")]
    pub retries: usize,
}

impl Default for EmbeddingDefaults {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            url: default_embedding_url(),
            model: default_embedding_model(),
            dim: None,
            batch: default_embedding_batch(),
            timeout_ms: default_embedding_timeout_ms(),
            retries: default_embedding_retries(),
        }
    }
}

/// Resolved chunker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingDefaults {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f32,
}

impl Default for ChunkingDefaults {
    fn default() -> Self {
        Self {
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            overlap_ratio: default_overlap_ratio(),
        }
    }
}

/// Resolved search tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDefaults {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: usize,
    #[serde(default = "default_vector_limit")]
    pub vector_limit: usize,
    #[serde(default = "default_text_limit")]
    pub text_limit: usize,
    #[serde(default = "default_graph_depth")]
    pub graph_depth: u8,
    /// How many fused documents seed graph expansion.
    #[serde(default = "default_graph_seeds")]
    pub graph_seeds: usize,
    /// Score multiplier applied per hop to graph-reached documents.
    #[serde(default = "default_graph_decay")]
    pub graph_decay: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            vector_limit: default_vector_limit(),
            text_limit: default_text_limit(),
            graph_depth: default_graph_depth(),
            graph_seeds: default_graph_seeds(),
            graph_decay: default_graph_decay(),
            max_results: default_max_results(),
        }
    }
}

/// Resolved ranker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankerDefaults {
    #[serde(default)]
    pub provider: RankerProviderKind,
    #[serde(default = "default_ranker_base_url")]
    pub base_url: String,
    #[serde(default = "default_ranker_model")]
    pub model: String,
    #[serde(default = "default_ranker_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_ranker_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_candidate_budget")]
    pub candidate_budget: usize,
    #[serde(default)]
    pub pruning: PruningDefaults,
}

impl Default for RankerDefaults {
    fn default() -> Self {
        Self {
            provider: RankerProviderKind::default(),
            base_url: default_ranker_base_url(),
            model: default_ranker_model(),
            api_key_env: default_ranker_api_key_env(),
            timeout_ms: default_ranker_timeout_ms(),
            candidate_budget: default_candidate_budget(),
            pruning: PruningDefaults::default(),
        }
    }
}

/// Weights of the candidate pruning score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningDefaults {
    #[serde(default = "default_hop_penalty")]
    pub hop_penalty: f64,
    #[serde(default = "default_confidence_weight")]
    pub confidence_weight: f64,
    #[serde(default = "default_domain_boost")]
    pub domain_boost: f64,
}

impl Default for PruningDefaults {
    fn default() -> Self {
        Self {
            hop_penalty: default_hop_penalty(),
            confidence_weight: default_confidence_weight(),
            domain_boost: default_domain_boost(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_watch_debounce_ms() -> u64 {
    2000
}

fn default_embedding_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_embedding_model() -> String {
    "qwen3-embedding:8b".to_string()
}

fn default_embedding_batch() -> usize {
    32
}

fn default_embedding_timeout_ms() -> u64 {
    30_000
}

fn default_embedding_retries() -> usize {
    3
}

fn default_min_tokens() -> usize {
    64
}

fn default_max_tokens() -> usize {
    512
}

fn default_overlap_ratio() -> f32 {
    0.12
}

fn default_rrf_k() -> usize {
    60
}

fn default_vector_limit() -> usize {
    50
}

fn default_text_limit() -> usize {
    50
}

fn default_graph_depth() -> u8 {
    2
}

fn default_graph_seeds() -> usize {
    10
}

fn default_graph_decay() -> f64 {
    0.5
}

fn default_max_results() -> usize {
    8
}

fn default_ranker_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ranker_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_ranker_api_key_env() -> Option<String> {
    Some("OPENAI_API_KEY".to_string())
}

fn default_ranker_timeout_ms() -> u64 {
    20_000
}

fn default_candidate_budget() -> usize {
    40
}

fn default_hop_penalty() -> f64 {
    0.25
}

fn default_confidence_weight() -> f64 {
    0.5
}

fn default_domain_boost() -> f64 {
    0.25
}

impl From<&RetrievalToolsSettings> for RetrievalSettings {
    fn from(value: &RetrievalToolsSettings) -> Self {
        let mut settings = RetrievalSettings::default();
        apply_embedding_overrides(&mut settings.embedding, &value.embedding);
        apply_chunking_overrides(&mut settings.chunking, &value.chunking);
        apply_search_overrides(&mut settings.search, &value.search);
        apply_ranker_overrides(&mut settings.ranker, &value.ranker);
        apply_index_overrides(&mut settings, &value.index);
        settings
    }
}

fn apply_embedding_overrides(embedding: &mut EmbeddingDefaults, overrides: &EmbeddingOverrides) {
    if let Some(provider) = overrides.provider {
        embedding.provider = provider;
    }
    if let Some(url) = &overrides.url {
        embedding.url = url.clone();
    }
    if let Some(model) = &overrides.model {
        embedding.model = model.clone();
    }
    if let Some(dim) = overrides.dim {
        embedding.dim = Some(dim);
    }
    if let Some(batch) = overrides.batch {
        embedding.batch = batch.max(1);
    }
    if let Some(timeout_ms) = overrides.timeout_ms {
        embedding.timeout_ms = timeout_ms;
    }
    if let Some(retries) = overrides.retries {
        embedding.retries = retries;
    }
}

fn apply_chunking_overrides(chunking: &mut ChunkingDefaults, overrides: &ChunkingOverrides) {
    if let Some(min_tokens) = overrides.min_tokens {
        chunking.min_tokens = min_tokens;
    }
    if let Some(max_tokens) = overrides.max_tokens {
        chunking.max_tokens = max_tokens;
    }
    if let Some(overlap_ratio) = overrides.overlap_ratio {
        chunking.overlap_ratio = overlap_ratio;
    }
}

fn apply_search_overrides(search: &mut SearchDefaults, overrides: &SearchOverrides) {
    if let Some(rrf_k) = overrides.rrf_k {
        search.rrf_k = rrf_k;
    }
    if let Some(vector_limit) = overrides.vector_limit {
        search.vector_limit = vector_limit;
    }
    if let Some(text_limit) = overrides.text_limit {
        search.text_limit = text_limit;
    }
    if let Some(graph_depth) = overrides.graph_depth {
        search.graph_depth = graph_depth;
    }
    if let Some(graph_seeds) = overrides.graph_seeds {
        search.graph_seeds = graph_seeds;
    }
    if let Some(graph_decay) = overrides.graph_decay {
        search.graph_decay = graph_decay;
    }
    if let Some(max_results) = overrides.max_results {
        search.max_results = max_results;
    }
}

fn apply_ranker_overrides(ranker: &mut RankerDefaults, overrides: &RankerOverrides) {
    if let Some(provider) = overrides.provider {
        ranker.provider = provider;
    }
    if let Some(base_url) = &overrides.base_url {
        ranker.base_url = base_url.clone();
    }
    if let Some(model) = &overrides.model {
        ranker.model = model.clone();
    }
    if let Some(api_key_env) = &overrides.api_key_env {
        ranker.api_key_env = Some(api_key_env.clone()).filter(|name| !name.trim().is_empty());
    }
    if let Some(timeout_ms) = overrides.timeout_ms {
        ranker.timeout_ms = timeout_ms;
    }
    if let Some(budget) = overrides.candidate_budget {
        ranker.candidate_budget = budget;
    }
    if let Some(hop_penalty) = overrides.hop_penalty {
        ranker.pruning.hop_penalty = hop_penalty;
    }
    if let Some(confidence_weight) = overrides.confidence_weight {
        ranker.pruning.confidence_weight = confidence_weight;
    }
    if let Some(domain_boost) = overrides.domain_boost {
        ranker.pruning.domain_boost = domain_boost;
    }
}

fn apply_index_overrides(settings: &mut RetrievalSettings, overrides: &IndexOverrides) {
    if let Some(path) = &overrides.cache_path_override {
        settings.cache_path_override = Some(PathBuf::from(path));
    }
    if let Some(persist) = overrides.persist_embeddings {
        settings.persist_embeddings = persist;
    }
    if let Some(debounce) = overrides.watch_debounce_ms {
        settings.watch_debounce_ms = debounce;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_defaults_from_empty_overrides() {
        let resolved = RetrievalSettings::from(&RetrievalToolsSettings::default());

        assert_eq!(resolved.search.rrf_k, 60);
        assert_eq!(resolved.search.vector_limit, 50);
        assert_eq!(resolved.search.text_limit, 50);
        assert_eq!(resolved.search.graph_depth, 2);
        assert_eq!(resolved.chunking.min_tokens, 64);
        assert_eq!(resolved.chunking.max_tokens, 512);
        assert!(resolved.persist_embeddings);
        assert_eq!(resolved.watch_debounce_ms, 2000);
        assert_eq!(resolved.ranker.provider, RankerProviderKind::Passthrough);
        assert_eq!(resolved.ranker.api_key_env.as_deref(), Some("OPENAI_API_KEY"));
    }

    #[test]
    fn applies_overrides() {
        let mut tools = RetrievalToolsSettings::default();
        tools.embedding.provider = Some(EmbeddingProviderKind::Hashing);
        tools.embedding.batch = Some(0);
        tools.search.graph_depth = Some(3);
        tools.ranker.api_key_env = Some(String::new());
        tools.ranker.hop_penalty = Some(0.1);
        tools.index.cache_path_override = Some("/tmp/cache.sqlite3".to_string());

        let resolved = RetrievalSettings::from(&tools);

        assert_eq!(resolved.embedding.provider, EmbeddingProviderKind::Hashing);
        assert_eq!(resolved.embedding.batch, 1);
        assert_eq!(resolved.search.graph_depth, 3);
        assert!(resolved.ranker.api_key_env.is_none());
        assert_eq!(resolved.ranker.pruning.hop_penalty, 0.1);
        assert_eq!(
            resolved.cache_path_override,
            Some(PathBuf::from("/tmp/cache.sqlite3"))
        );
    }
}
