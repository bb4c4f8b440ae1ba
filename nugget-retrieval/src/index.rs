//! Immutable index snapshots and the single writer that publishes them.
//!
//! Readers clone the active `Arc<IndexSnapshot>` and keep it for as long as
//! they need; writers assemble the next snapshot off to the side and swap it
//! in only once it is complete. A write whose future is dropped publishes
//! nothing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use nugget_core::config::RetrievalSettings;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chunker::{Chunk, ChunkConfig, chunk_document};
use crate::embeddings::{EmbeddingProvider, RetryPolicy, cosine_similarity, embed_with_retry};
use crate::errors::{RetrievalError, RetrievalResult};
use crate::fts::TextIndex;
use crate::graph::{Reached, RelationGraph};
use crate::models::{ChunkKey, Document, DocumentChange, RelationKind};
use crate::paths::index_db_path;
use crate::sources::{DocumentSource, Rejected};
use crate::storage::EmbeddingCache;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub chunking: ChunkConfig,
    /// Chunks per embedding call.
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Where vectors persist between processes; `None` keeps them in memory.
    pub cache_path: Option<PathBuf>,
}

impl IndexOptions {
    pub fn from_settings(settings: &RetrievalSettings) -> RetrievalResult<Self> {
        let cache_path = if settings.persist_embeddings {
            Some(index_db_path(settings)?)
        } else {
            None
        };
        Ok(Self {
            chunking: ChunkConfig::try_from(&settings.chunking)?,
            batch_size: settings.embedding.batch.max(1),
            retry: RetryPolicy::from_settings(&settings.embedding),
            cache_path,
        })
    }
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkConfig::default(),
            batch_size: 32,
            retry: RetryPolicy::default(),
            cache_path: None,
        }
    }
}

/// Counts describing the snapshot a write published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub generation: u64,
    pub documents: usize,
    pub chunks: usize,
    pub embedded: usize,
    pub unembedded: usize,
    pub rejected: usize,
    /// Vectors carried over from the previous snapshot by this write.
    pub reused: usize,
    /// Vectors loaded from the on-disk cache by this write.
    pub from_cache: usize,
    /// Vectors computed by the provider during this write.
    pub fresh: usize,
    /// Chunks left unembedded because the provider kept failing.
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    generation: u64,
    model_id: String,
    dims: Option<usize>,
    documents: BTreeMap<String, Arc<Document>>,
    chunks: BTreeMap<ChunkKey, Arc<Chunk>>,
    /// Absent for unembedded chunks.
    vectors: HashMap<ChunkKey, Arc<Vec<f32>>>,
    text: TextIndex,
    graph: RelationGraph,
    /// Load failures by origin path.
    rejected: BTreeMap<String, Rejected>,
}

impl IndexSnapshot {
    fn empty(generation: u64, embedder: &dyn EmbeddingProvider) -> Self {
        Self {
            generation,
            model_id: embedder.model_id().to_string(),
            dims: embedder.dims(),
            documents: BTreeMap::new(),
            chunks: BTreeMap::new(),
            vectors: HashMap::new(),
            text: TextIndex::default(),
            graph: RelationGraph::default(),
            rejected: BTreeMap::new(),
        }
    }

    fn successor(&self) -> Self {
        let mut next = self.clone();
        next.generation += 1;
        next
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Model every vector in this snapshot was produced by.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn document(&self, id: &str) -> Option<&Arc<Document>> {
        self.documents.get(id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Arc<Document>> {
        self.documents.values()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn chunk(&self, key: &ChunkKey) -> Option<&Arc<Chunk>> {
        self.chunks.get(key)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        self.chunks.values()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks of one document, in position order.
    pub fn document_chunks(&self, document_id: &str) -> impl Iterator<Item = &Arc<Chunk>> {
        self.chunks
            .range(ChunkKey::new(document_id, 0)..=ChunkKey::new(document_id, u32::MAX))
            .map(|(_, chunk)| chunk)
    }

    pub fn vector(&self, key: &ChunkKey) -> Option<&[f32]> {
        self.vectors.get(key).map(|vector| vector.as_slice())
    }

    pub fn embedded_count(&self) -> usize {
        self.vectors.len()
    }

    pub fn unembedded(&self) -> Vec<&ChunkKey> {
        self.chunks
            .keys()
            .filter(|key| !self.vectors.contains_key(key))
            .collect()
    }

    pub fn graph(&self) -> &RelationGraph {
        &self.graph
    }

    pub fn text(&self) -> &TextIndex {
        &self.text
    }

    /// Files that currently fail to load, ordered by origin.
    pub fn rejected(&self) -> impl Iterator<Item = &Rejected> {
        self.rejected.values()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    /// Top `k` embedded chunks by cosine similarity. Only strictly positive
    /// similarities are returned; ties are broken by chunk key.
    pub fn query_vectors(&self, vector: &[f32], k: usize) -> Vec<(ChunkKey, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(ChunkKey, f32)> = self
            .vectors
            .iter()
            .map(|(key, candidate)| (key, cosine_similarity(vector, candidate)))
            .filter(|(_, similarity)| *similarity > 0.0)
            .map(|(key, similarity)| (key.clone(), similarity))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    /// Top `k` chunks by BM25 over the query's terms.
    pub fn query_text(&self, query: &str, k: usize) -> RetrievalResult<Vec<(ChunkKey, f64)>> {
        self.text.search(query, k)
    }

    pub fn neighbors(
        &self,
        document_id: &str,
        relation_filter: Option<&[RelationKind]>,
        max_hops: u32,
    ) -> RetrievalResult<Vec<Reached>> {
        if !self.documents.contains_key(document_id) {
            return Err(RetrievalError::UnknownDocument(document_id.to_string()));
        }
        Ok(self.graph.neighbors(document_id, relation_filter, max_hops))
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            generation: self.generation,
            documents: self.documents.len(),
            chunks: self.chunks.len(),
            embedded: self.vectors.len(),
            unembedded: self.chunks.len() - self.vectors.len(),
            rejected: self.rejected.len(),
            ..IndexStats::default()
        }
    }

    /// Vectors by content hash, usable only by the same model.
    fn reusable_vectors(&self, model_id: &str) -> HashMap<String, Arc<Vec<f32>>> {
        if self.model_id != model_id {
            return HashMap::new();
        }
        self.chunks
            .iter()
            .filter_map(|(key, chunk)| {
                self.vectors
                    .get(key)
                    .map(|vector| (chunk.content_hash.clone(), Arc::clone(vector)))
            })
            .collect()
    }

    /// Drop a document and its chunks, returning what was removed.
    fn purge_document(&mut self, document_id: &str) -> Option<Arc<Document>> {
        let keys: Vec<ChunkKey> = self
            .document_chunks(document_id)
            .map(|chunk| chunk.key.clone())
            .collect();
        for key in &keys {
            self.chunks.remove(key);
            self.vectors.remove(key);
        }
        self.documents.remove(document_id)
    }

    fn insert_chunks(&mut self, chunks: Vec<Arc<Chunk>>, vectors: HashMap<ChunkKey, Arc<Vec<f32>>>) {
        for chunk in chunks {
            self.chunks.insert(chunk.key.clone(), chunk);
        }
        self.vectors.extend(vectors);
    }

    fn resolve_rejection(&mut self, path: Option<&Path>) {
        if let Some(path) = path {
            self.rejected.remove(&path.display().to_string());
        }
    }

    /// Replace the text index with one over the current chunks.
    async fn rebuild_text(&mut self) -> RetrievalResult<()> {
        let entries: Vec<(ChunkKey, String)> = self
            .chunks
            .iter()
            .map(|(key, chunk)| (key.clone(), chunk.embedding_text()))
            .collect();
        self.text = tokio::task::spawn_blocking(move || TextIndex::build(entries))
            .await
            .map_err(|err| RetrievalError::Io(std::io::Error::other(err)))??;
        Ok(())
    }

    fn rebuild_graph(&mut self) {
        self.graph = RelationGraph::from_documents(self.documents.values().map(|doc| &**doc));
    }

    fn settle_dims(&mut self, embedder: &dyn EmbeddingProvider) {
        self.dims = embedder
            .dims()
            .or_else(|| self.vectors.values().next().map(|vector| vector.len()));
    }
}

#[derive(Default)]
struct EmbedOutcome {
    vectors: HashMap<ChunkKey, Arc<Vec<f32>>>,
    reused: usize,
    from_cache: usize,
    fresh: usize,
    failed: usize,
}

impl EmbedOutcome {
    fn annotate(&self, stats: &mut IndexStats) {
        stats.reused = self.reused;
        stats.from_cache = self.from_cache;
        stats.fresh = self.fresh;
        stats.failed = self.failed;
    }
}

struct Published {
    snapshot: Arc<IndexSnapshot>,
    embedder: Arc<dyn EmbeddingProvider>,
}

struct WriterState {
    cache: Option<EmbeddingCache>,
}

/// Owner of the active snapshot. Any number of readers, one writer at a time.
pub struct IndexStore {
    source: Arc<dyn DocumentSource>,
    options: IndexOptions,
    active: RwLock<Published>,
    writer: Mutex<WriterState>,
}

impl IndexStore {
    pub async fn open(
        source: Arc<dyn DocumentSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        options: IndexOptions,
    ) -> RetrievalResult<Self> {
        let cache = match &options.cache_path {
            Some(path) => Some(EmbeddingCache::open(path, embedder.model_id()).await?),
            None => None,
        };
        let snapshot = Arc::new(IndexSnapshot::empty(0, embedder.as_ref()));
        Ok(Self {
            source,
            options,
            active: RwLock::new(Published { snapshot, embedder }),
            writer: Mutex::new(WriterState { cache }),
        })
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&active.snapshot)
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&active.embedder)
    }

    /// Snapshot and the embedder that belongs to it, read together.
    pub fn view(&self) -> (Arc<IndexSnapshot>, Arc<dyn EmbeddingProvider>) {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        (Arc::clone(&active.snapshot), Arc::clone(&active.embedder))
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Rebuild everything from the document source.
    pub async fn build(&self) -> RetrievalResult<IndexStats> {
        let state = self.writer.lock().await;
        let started = Instant::now();
        let (previous, embedder) = self.view();

        let scan = self.source.documents().await?;
        let mut next = IndexSnapshot::empty(previous.generation + 1, embedder.as_ref());
        next.rejected = scan
            .rejected
            .into_iter()
            .map(|rejected| (rejected.origin.clone(), rejected))
            .collect();

        let mut chunks = Vec::new();
        for doc in scan.documents {
            chunks.extend(
                chunk_document(&doc, &self.options.chunking)
                    .into_iter()
                    .map(Arc::new),
            );
            next.documents.insert(doc.id.clone(), Arc::new(doc));
        }

        let reuse = previous.reusable_vectors(embedder.model_id());
        let mut outcome = self
            .embed_chunks(embedder.as_ref(), state.cache.as_ref(), &chunks, &reuse)
            .await;
        next.insert_chunks(chunks, std::mem::take(&mut outcome.vectors));
        next.rebuild_text().await?;
        next.rebuild_graph();
        next.settle_dims(embedder.as_ref());

        if let Some(cache) = &state.cache {
            let live: HashSet<String> = next
                .chunks
                .values()
                .map(|chunk| chunk.content_hash.clone())
                .collect();
            match cache.retain(&live).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "pruned stale cached vectors"),
                Err(err) => warn!("failed to prune embedding cache: {err}"),
            }
        }

        let mut stats = self.publish(next, None);
        outcome.annotate(&mut stats);
        info!(
            generation = stats.generation,
            documents = stats.documents,
            chunks = stats.chunks,
            embedded = stats.embedded,
            reused = stats.reused,
            from_cache = stats.from_cache,
            fresh = stats.fresh,
            failed = stats.failed,
            rejected = stats.rejected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index built"
        );
        Ok(stats)
    }

    /// Reload one document from the source, purging it when it is gone.
    ///
    /// The source is read under the writer lock, so concurrent reindexes of
    /// the same document publish in the order they read.
    pub async fn reindex(&self, document_id: &str) -> RetrievalResult<IndexStats> {
        let state = self.writer.lock().await;
        let change = match self.source.document(document_id).await? {
            Some(doc) => DocumentChange::Modified(doc),
            None => DocumentChange::Removed(document_id.to_string()),
        };
        self.apply_locked(&state, change).await
    }

    pub async fn apply_change(&self, change: DocumentChange) -> RetrievalResult<IndexStats> {
        let state = self.writer.lock().await;
        self.apply_locked(&state, change).await
    }

    /// Replace the load failures recorded under `path` (a file or a
    /// directory) with `found`. Publishes only when the set changes.
    pub async fn refresh_rejections(
        &self,
        path: &Path,
        found: Vec<Rejected>,
    ) -> RetrievalResult<IndexStats> {
        let _state = self.writer.lock().await;
        let previous = self.snapshot();

        let mut rejected = previous.rejected.clone();
        rejected.retain(|origin, _| !Path::new(origin).starts_with(path));
        for entry in found {
            warn!(path = %entry.origin, "document failed to load: {}", entry.reason);
            rejected.insert(entry.origin.clone(), entry);
        }
        if rejected == previous.rejected {
            return Ok(previous.stats());
        }

        let mut next = previous.successor();
        next.rejected = rejected;
        let stats = self.publish(next, None);
        debug!(
            generation = stats.generation,
            rejected = stats.rejected,
            "rejected documents updated"
        );
        Ok(stats)
    }

    async fn apply_locked(
        &self,
        state: &WriterState,
        change: DocumentChange,
    ) -> RetrievalResult<IndexStats> {
        let started = Instant::now();
        let (previous, embedder) = self.view();

        let document_id = change.document_id().to_string();
        let mut next = previous.successor();
        let purged = next.purge_document(&document_id);

        let mut outcome = EmbedOutcome::default();
        match change {
            DocumentChange::Removed(_) => {
                let Some(purged) = purged else {
                    debug!(document = %document_id, "removal of unindexed document ignored");
                    return Ok(previous.stats());
                };
                next.resolve_rejection(purged.path.as_deref());
            }
            DocumentChange::Added(doc) | DocumentChange::Modified(doc) => {
                let chunks: Vec<Arc<Chunk>> = chunk_document(&doc, &self.options.chunking)
                    .into_iter()
                    .map(Arc::new)
                    .collect();
                let reuse = previous.reusable_vectors(embedder.model_id());
                outcome = self
                    .embed_chunks(embedder.as_ref(), state.cache.as_ref(), &chunks, &reuse)
                    .await;
                next.insert_chunks(chunks, std::mem::take(&mut outcome.vectors));
                next.resolve_rejection(doc.path.as_deref());
                next.documents.insert(document_id.clone(), Arc::new(doc));
            }
        }
        next.rebuild_text().await?;
        next.rebuild_graph();
        next.settle_dims(embedder.as_ref());

        let mut stats = self.publish(next, None);
        outcome.annotate(&mut stats);
        info!(
            generation = stats.generation,
            document = %document_id,
            chunks = stats.chunks,
            fresh = stats.fresh,
            failed = stats.failed,
            rejected = stats.rejected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "document reindexed"
        );
        Ok(stats)
    }

    /// Re-embed every chunk with another model. Documents, chunks, the text
    /// index and the graph carry over unchanged.
    pub async fn change_embedder(
        &self,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> RetrievalResult<IndexStats> {
        let mut state = self.writer.lock().await;
        let started = Instant::now();
        let previous = self.snapshot();

        if let Some(path) = &self.options.cache_path {
            state.cache = Some(EmbeddingCache::open(path, embedder.model_id()).await?);
        }

        let mut next = previous.successor();
        next.model_id = embedder.model_id().to_string();
        next.vectors.clear();

        let chunks: Vec<Arc<Chunk>> = previous.chunks.values().cloned().collect();
        let reuse = previous.reusable_vectors(embedder.model_id());
        let mut outcome = self
            .embed_chunks(embedder.as_ref(), state.cache.as_ref(), &chunks, &reuse)
            .await;
        next.vectors = std::mem::take(&mut outcome.vectors);
        next.settle_dims(embedder.as_ref());

        let model = next.model_id.clone();
        let mut stats = self.publish(next, Some(embedder));
        outcome.annotate(&mut stats);
        info!(
            generation = stats.generation,
            previous = %previous.model_id,
            model = %model,
            embedded = stats.embedded,
            failed = stats.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding model changed"
        );
        Ok(stats)
    }

    pub fn query_vectors(&self, vector: &[f32], k: usize) -> Vec<(ChunkKey, f32)> {
        self.snapshot().query_vectors(vector, k)
    }

    pub fn query_text(&self, query: &str, k: usize) -> RetrievalResult<Vec<(ChunkKey, f64)>> {
        self.snapshot().query_text(query, k)
    }

    pub fn neighbors(
        &self,
        document_id: &str,
        relation_filter: Option<&[RelationKind]>,
        max_hops: u32,
    ) -> RetrievalResult<Vec<Reached>> {
        self.snapshot()
            .neighbors(document_id, relation_filter, max_hops)
    }

    fn publish(
        &self,
        next: IndexSnapshot,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> IndexStats {
        let stats = next.stats();
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        active.snapshot = Arc::new(next);
        if let Some(embedder) = embedder {
            active.embedder = embedder;
        }
        stats
    }

    /// Vectors for `chunks`: previous snapshot first, then the disk cache,
    /// then the provider. Batches that fail after retries stay unembedded.
    async fn embed_chunks(
        &self,
        embedder: &dyn EmbeddingProvider,
        cache: Option<&EmbeddingCache>,
        chunks: &[Arc<Chunk>],
        reuse: &HashMap<String, Arc<Vec<f32>>>,
    ) -> EmbedOutcome {
        let mut outcome = EmbedOutcome::default();
        let mut pending: Vec<&Arc<Chunk>> = Vec::new();
        for chunk in chunks {
            match reuse.get(&chunk.content_hash) {
                Some(vector) => {
                    outcome.vectors.insert(chunk.key.clone(), Arc::clone(vector));
                    outcome.reused += 1;
                }
                None => pending.push(chunk),
            }
        }

        if let Some(cache) = cache
            && !pending.is_empty()
        {
            let hashes: Vec<String> = pending
                .iter()
                .map(|chunk| chunk.content_hash.clone())
                .collect();
            match cache.lookup(&hashes).await {
                Ok(found) => {
                    let dims = embedder.dims();
                    pending.retain(|chunk| match found.get(&chunk.content_hash) {
                        Some(vector) if dims.is_none_or(|dims| dims == vector.len()) => {
                            outcome
                                .vectors
                                .insert(chunk.key.clone(), Arc::new(vector.clone()));
                            outcome.from_cache += 1;
                            false
                        }
                        _ => true,
                    });
                }
                Err(err) => warn!("embedding cache lookup failed: {err}"),
            }
        }

        for batch in pending.chunks(self.options.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.embedding_text()).collect();
            match embed_with_retry(embedder, &texts, &self.options.retry).await {
                Ok(vectors) => {
                    let mut entries = Vec::with_capacity(batch.len());
                    for (chunk, vector) in batch.iter().zip(vectors) {
                        entries.push((chunk.content_hash.clone(), vector.clone()));
                        outcome.vectors.insert(chunk.key.clone(), Arc::new(vector));
                    }
                    outcome.fresh += batch.len();
                    if let Some(cache) = cache
                        && let Err(err) = cache.store(&entries).await
                    {
                        warn!("failed to persist vectors: {err}");
                    }
                }
                Err(err) => {
                    warn!(
                        model = %embedder.model_id(),
                        chunks = batch.len(),
                        first = %batch[0].key,
                        "embedding batch failed, chunks left unembedded: {err}"
                    );
                    outcome.failed += batch.len();
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::models::{DocumentType, Relation, SourceKind};
    use crate::sources::InMemorySource;
    use chrono::Utc;

    fn doc(id: &str, body: &str, relations: &[(&str, RelationKind)]) -> Document {
        Document {
            id: id.to_string(),
            doc_type: DocumentType::Concept,
            domain: "test".to_string(),
            tags: Vec::new(),
            confidence: 0.8,
            source: SourceKind::Unknown,
            relations: relations
                .iter()
                .map(|(target, kind)| Relation {
                    id: target.to_string(),
                    relation: kind.clone(),
                })
                .collect(),
            created: Utc::now(),
            modified: Utc::now(),
            body: body.to_string(),
            path: None,
        }
    }

    async fn store_with(docs: Vec<Document>) -> IndexStore {
        let source = Arc::new(InMemorySource::new(docs));
        IndexStore::open(source, Arc::new(HashingEmbedder::new(64)), IndexOptions::default())
            .await
            .expect("open")
    }

    #[tokio::test]
    async fn starts_empty_at_generation_zero() {
        let store = store_with(Vec::new()).await;
        let snapshot = store.snapshot();
        assert_eq!(snapshot.generation(), 0);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.model_id(), "hashing-v1-64");
    }

    #[tokio::test]
    async fn vector_query_keeps_positive_similarity_only() {
        let store = store_with(vec![
            doc("cache", "# Cache\n\nevict stale cache entries", &[]),
            doc("wardrobe", "# Wardrobe\n\ncapsule garments", &[]),
        ])
        .await;
        store.build().await.expect("build");

        let query = HashingEmbedder::new(64).vectorize("evict stale cache entries");
        let hits = store.query_vectors(&query, 10);

        assert_eq!(hits[0].0, ChunkKey::new("cache", 0));
        assert!(hits.iter().all(|(_, similarity)| *similarity > 0.0));
    }

    #[tokio::test]
    async fn neighbors_reject_unknown_documents() {
        let store = store_with(vec![
            doc("a", "# A\n\nalpha", &[("b", RelationKind::Uses)]),
            doc("b", "# B\n\nbeta", &[]),
        ])
        .await;
        store.build().await.expect("build");

        let reached = store.neighbors("a", None, 2).expect("neighbors");
        assert_eq!(reached.len(), 1);
        assert!(matches!(
            store.neighbors("nope", None, 2),
            Err(RetrievalError::UnknownDocument(_))
        ));
    }

    #[tokio::test]
    async fn readers_keep_their_snapshot_across_writes() {
        let store = store_with(vec![doc("a", "# A\n\nalpha words", &[])]).await;
        store.build().await.expect("build");
        let held = store.snapshot();

        store
            .apply_change(DocumentChange::Removed("a".to_string()))
            .await
            .expect("remove");

        assert_eq!(held.document_count(), 1);
        assert_eq!(store.snapshot().document_count(), 0);
        assert_eq!(store.snapshot().generation(), held.generation() + 1);
    }

    #[tokio::test]
    async fn removing_unknown_document_publishes_nothing() {
        let store = store_with(vec![doc("a", "# A\n\nalpha", &[])]).await;
        let built = store.build().await.expect("build");

        let stats = store
            .apply_change(DocumentChange::Removed("ghost".to_string()))
            .await
            .expect("remove");

        assert_eq!(stats.generation, built.generation);
    }
}
