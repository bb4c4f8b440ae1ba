use std::path::PathBuf;

use crate::engine::RetrievalStage;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("brain root is not configured")]
    MissingBrainRoot,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("text index error: {0}")]
    Text(#[from] tantivy::TantivyError),
    #[error("missing front matter in {0}")]
    MissingFrontMatter(PathBuf),
    #[error("invalid front matter: {0}")]
    InvalidFrontMatter(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid chunk configuration: {0}")]
    InvalidChunkConfig(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimMismatch { expected: usize, actual: usize },
    #[error("embedding model mismatch: index built with '{index_model}', query uses '{query_model}'")]
    ModelMismatch {
        index_model: String,
        query_model: String,
    },
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("ranker error: {0}")]
    Ranker(String),
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u64 },
    #[error("index is empty")]
    EmptyIndex,
    #[error("retrieval cancelled")]
    Cancelled,
    #[error("unknown document: {0}")]
    UnknownDocument(String),
    #[error("invalid retrieval transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: RetrievalStage,
        to: RetrievalStage,
    },
}

impl RetrievalError {
    /// Provider failures degrade retrieval instead of failing it.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Embedding(_)
                | Self::Ranker(_)
                | Self::Timeout { .. }
                | Self::EmbeddingDimMismatch { .. }
        )
    }
}

pub type RetrievalResult<T> = Result<T, RetrievalError>;
