//! Where documents come from.
//!
//! The index never writes documents; it only enumerates them through a
//! [`DocumentSource`]. Parse failures are isolated per document and reported
//! next to the documents that did load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::warn;

use crate::errors::{RetrievalError, RetrievalResult};
use crate::models::Document;
use crate::parser::parse_document;
use crate::paths::walk_document_files;

/// A document that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub origin: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct SourceScan {
    pub documents: Vec<Document>,
    pub rejected: Vec<Rejected>,
}

impl SourceScan {
    /// Keep the first document per id, rejecting later duplicates.
    fn push(&mut self, seen: &mut BTreeMap<String, String>, doc: Document, origin: String) {
        if let Some(first) = seen.get(&doc.id) {
            warn!(id = %doc.id, origin = %origin, first = %first, "duplicate document id skipped");
            self.rejected.push(Rejected {
                reason: format!("duplicate id '{}' (first defined in {first})", doc.id),
                origin,
            });
            return;
        }
        seen.insert(doc.id.clone(), origin);
        self.documents.push(doc);
    }
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Every loadable document, in a stable order.
    async fn documents(&self) -> RetrievalResult<SourceScan>;

    /// One document by id; `None` when it no longer exists.
    async fn document(&self, id: &str) -> RetrievalResult<Option<Document>>;
}

/// Markdown files under `<root>/domains/`.
#[derive(Debug, Clone)]
pub struct BrainSource {
    root: PathBuf,
}

impl BrainSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn read_path(path: &Path) -> RetrievalResult<Document> {
        let raw = std::fs::read_to_string(path)?;
        parse_document(&raw, Some(path))
    }

    fn scan_blocking(root: &Path) -> SourceScan {
        let mut scan = SourceScan::default();
        let mut seen = BTreeMap::new();
        for path in walk_document_files(root) {
            let origin = path.display().to_string();
            match Self::read_path(&path) {
                Ok(doc) => scan.push(&mut seen, doc, origin),
                Err(err) => {
                    warn!(path = %origin, "skipping unparseable document: {err}");
                    scan.rejected.push(Rejected {
                        origin,
                        reason: err.to_string(),
                    });
                }
            }
        }
        scan
    }
}

#[async_trait]
impl DocumentSource for BrainSource {
    async fn documents(&self) -> RetrievalResult<SourceScan> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Self::scan_blocking(&root))
            .await
            .map_err(|err| RetrievalError::Io(std::io::Error::other(err)))
    }

    async fn document(&self, id: &str) -> RetrievalResult<Option<Document>> {
        let scan = self.documents().await?;
        Ok(scan.documents.into_iter().find(|doc| doc.id == id))
    }
}

/// Documents held in memory, for hosts that manage storage themselves.
#[derive(Debug, Default)]
pub struct InMemorySource {
    documents: RwLock<BTreeMap<String, Document>>,
}

impl InMemorySource {
    pub fn new(documents: impl IntoIterator<Item = Document>) -> Self {
        let source = Self::default();
        for doc in documents {
            source.upsert(doc);
        }
        source
    }

    pub fn upsert(&self, doc: Document) {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc.id.clone(), doc);
    }

    pub fn remove(&self, id: &str) -> Option<Document> {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }
}

#[async_trait]
impl DocumentSource for InMemorySource {
    async fn documents(&self) -> RetrievalResult<SourceScan> {
        let documents = self
            .documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        Ok(SourceScan {
            documents,
            rejected: Vec::new(),
        })
    }

    async fn document(&self, id: &str) -> RetrievalResult<Option<Document>> {
        Ok(self
            .documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::{domains_root, init_brain};
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = domains_root(root).join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn note(id: &str) -> String {
        format!("---\nid: {id}\ntype: concept\ndomain: test\ncreated: 2026-01-01\n---\n# {id}\n")
    }

    #[tokio::test]
    async fn scan_isolates_bad_documents() {
        let dir = TempDir::new().expect("tempdir");
        init_brain(dir.path()).expect("init");
        write(dir.path(), "a.md", &note("a"));
        write(dir.path(), "b.md", "no front matter here");
        write(dir.path(), "c/c.md", &note("c"));

        let scan = BrainSource::new(dir.path()).documents().await.expect("scan");

        let ids: Vec<&str> = scan.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(scan.rejected.len(), 1);
        assert!(scan.rejected[0].origin.ends_with("b.md"));
    }

    #[tokio::test]
    async fn duplicate_ids_keep_first_path() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "a/one.md", &note("same"));
        write(dir.path(), "b/two.md", &note("same"));

        let scan = BrainSource::new(dir.path()).documents().await.expect("scan");

        assert_eq!(scan.documents.len(), 1);
        assert!(
            scan.documents[0]
                .path
                .as_ref()
                .expect("path")
                .ends_with("a/one.md")
        );
        assert!(scan.rejected[0].reason.contains("duplicate id"));
    }

    #[tokio::test]
    async fn load_by_id() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "a.md", &note("a"));
        let source = BrainSource::new(dir.path());

        assert!(source.document("a").await.expect("load").is_some());
        assert!(source.document("zzz").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn missing_brain_scans_empty() {
        let dir = TempDir::new().expect("tempdir");
        let scan = BrainSource::new(dir.path().join("nope"))
            .documents()
            .await
            .expect("scan");
        assert!(scan.documents.is_empty());
    }
}
