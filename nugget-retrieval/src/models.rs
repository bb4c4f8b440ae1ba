use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of knowledge a document captures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Concept,
    Pattern,
    Decision,
    Bug,
    Belief,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::Pattern => "pattern",
            Self::Decision => "decision",
            Self::Bug => "bug",
            Self::Belief => "belief",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a document's knowledge came from.
///
/// Unknown strings are kept so new capture agents don't break parsing. Like
/// [`RelationKind`], they are trimmed and lowercased first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceKind {
    DirectExperience,
    AiExtracted,
    Imported,
    PairingDerived,
    ObservationDerived,
    #[default]
    Unknown,
    Other(String),
}

impl SourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DirectExperience => "direct-experience",
            Self::AiExtracted => "ai-extracted",
            Self::Imported => "imported",
            Self::PairingDerived => "pairing-derived",
            Self::ObservationDerived => "observation-derived",
            Self::Unknown => "unknown",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for SourceKind {
    fn from(value: String) -> Self {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "direct-experience" => Self::DirectExperience,
            "ai-extracted" => Self::AiExtracted,
            "imported" => Self::Imported,
            "pairing-derived" => Self::PairingDerived,
            "observation-derived" => Self::ObservationDerived,
            "" | "unknown" => Self::Unknown,
            _ => Self::Other(normalized),
        }
    }
}

impl From<SourceKind> for String {
    fn from(value: SourceKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed relation kind between two documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationKind {
    Uses,
    Implements,
    RequiresUnderstandingOf,
    InformedBy,
    OftenCombinedWith,
    Other(String),
}

impl RelationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Uses => "uses",
            Self::Implements => "implements",
            Self::RequiresUnderstandingOf => "requires_understanding_of",
            Self::InformedBy => "informed_by",
            Self::OftenCombinedWith => "often_combined_with",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for RelationKind {
    fn from(value: String) -> Self {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "uses" => Self::Uses,
            "implements" => Self::Implements,
            "requires_understanding_of" => Self::RequiresUnderstandingOf,
            "informed_by" => Self::InformedBy,
            "often_combined_with" => Self::OftenCombinedWith,
            _ => Self::Other(normalized),
        }
    }
}

impl From<RelationKind> for String {
    fn from(value: RelationKind) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for RelationKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing typed edge declared in a document's frontmatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub relation: RelationKind,
}

/// A parsed knowledge document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub doc_type: DocumentType,
    /// `/`-separated hierarchy, e.g. `coding/rust`.
    pub domain: String,
    pub tags: Vec<String>,
    pub confidence: f32,
    pub source: SourceKind,
    pub relations: Vec<Relation>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Document {
    /// First heading of the body, falling back to the id.
    pub fn title(&self) -> String {
        self.body
            .lines()
            .map(str::trim)
            .find_map(|line| {
                let text = line.trim_start_matches('#');
                (line.starts_with('#') && text.starts_with(' ')).then(|| text.trim().to_string())
            })
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| self.id.clone())
    }

    /// Whether this document sits in `hint` or one of its subdomains.
    pub fn in_domain(&self, hint: &str) -> bool {
        domain_matches(&self.domain, hint)
    }
}

/// `domain` equals `hint` or is one of its subdomains.
pub fn domain_matches(domain: &str, hint: &str) -> bool {
    let hint = hint.trim().trim_matches('/');
    if hint.is_empty() {
        return false;
    }
    domain == hint
        || domain
            .strip_prefix(hint)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Stable identifier of a chunk: owning document plus position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub document_id: String,
    pub position: u32,
}

impl ChunkKey {
    pub fn new(document_id: impl Into<String>, position: u32) -> Self {
        Self {
            document_id: document_id.into(),
            position,
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.document_id, self.position)
    }
}

/// Direction an edge was walked during graph expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDirection {
    Outgoing,
    Incoming,
}

/// One step of a graph path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationStep {
    pub from: String,
    pub to: String,
    pub kind: RelationKind,
    pub direction: EdgeDirection,
}

impl fmt::Display for RelationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            EdgeDirection::Outgoing => write!(f, "{} -{}-> {}", self.from, self.kind, self.to),
            EdgeDirection::Incoming => write!(f, "{} <-{}- {}", self.from, self.kind, self.to),
        }
    }
}

/// How a candidate entered the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// Found by hybrid search.
    Search {
        vector_rank: Option<usize>,
        text_rank: Option<usize>,
    },
    /// Reached by walking relations from a search hit.
    Graph {
        seed: String,
        hops: u32,
        path: Vec<RelationStep>,
    },
}

impl CandidateOrigin {
    pub fn hops(&self) -> u32 {
        match self {
            Self::Search { .. } => 0,
            Self::Graph { hops, .. } => *hops,
        }
    }
}

/// A chunk that survived layer 1 or 2, with everything the ranker needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub chunk: ChunkKey,
    pub breadcrumb: Vec<String>,
    pub text: String,
    pub domain: String,
    pub confidence: f32,
    pub source: SourceKind,
    pub modified: DateTime<Utc>,
    pub fused_score: f64,
    pub origin: CandidateOrigin,
    /// Other matching chunks of the same document.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_chunks: Vec<ChunkKey>,
}

impl Candidate {
    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }
}

/// Final retrieval output unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFragment {
    pub document_id: String,
    pub chunk_id: String,
    pub breadcrumb: Vec<String>,
    pub excerpt: String,
    pub score: f64,
    pub justification: String,
}

/// Change notification for a single document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    Added(Document),
    Modified(Document),
    Removed(String),
}

impl DocumentChange {
    pub fn document_id(&self) -> &str {
        match self {
            Self::Added(doc) | Self::Modified(doc) => &doc.id,
            Self::Removed(id) => id,
        }
    }
}
