//! Retrieval core of a nugget knowledge brain.
//!
//! Documents are parsed from markdown with YAML front matter, chunked along
//! their heading tree and indexed three ways: dense vectors, BM25 full text
//! and a relation graph. A query runs hybrid search fused with reciprocal
//! rank fusion, expands along relations, prunes to a candidate budget and
//! hands the survivors to a pluggable ranker.

pub mod chunker;
pub mod embeddings;
pub mod engine;
pub mod errors;
pub mod expander;
pub mod fts;
pub mod graph;
pub mod index;
pub mod models;
pub mod parser;
pub mod paths;
pub mod ranker;
pub mod search;
pub mod sources;
pub mod storage;
pub mod watcher;

pub use chunker::{Chunk, ChunkConfig, chunk_document};
pub use embeddings::{EmbeddingProvider, HashingEmbedder, OllamaEmbedder, embedder_from_settings};
pub use engine::{RetrievalEngine, RetrievalOutcome, RetrievalRequest, RetrievalStage, RetrievalTrace};
pub use errors::{RetrievalError, RetrievalResult};
pub use index::{IndexOptions, IndexSnapshot, IndexStats, IndexStore};
pub use models::{
    Candidate, CandidateOrigin, ChunkKey, ContextFragment, Document, DocumentChange,
    DocumentType, Relation, RelationKind, SourceKind,
};
pub use nugget_core::config::RetrievalSettings;
pub use parser::parse_document;
pub use ranker::{LlmRanker, PassthroughRanker, PruningPolicy, RankerVerdict, RelevanceRanker};
pub use sources::{BrainSource, DocumentSource, InMemorySource};
pub use watcher::run_watcher;
