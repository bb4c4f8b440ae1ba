use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::Notify;

use nugget_retrieval::embeddings::RetryPolicy;
use nugget_retrieval::paths::{domains_root, init_brain};
use nugget_retrieval::sources::SourceScan;
use nugget_retrieval::{
    BrainSource, ChunkKey, Document, DocumentChange, DocumentSource, DocumentType,
    EmbeddingProvider, HashingEmbedder, InMemorySource, IndexOptions, IndexStore,
    PassthroughRanker, Relation, RelationKind, RetrievalEngine, RetrievalError, RetrievalRequest,
    RetrievalResult, RetrievalSettings, SourceKind,
};

fn doc(id: &str, body: &str, relations: &[(&str, RelationKind)]) -> Document {
    let at = Utc
        .with_ymd_and_hms(2026, 2, 1, 12, 0, 0)
        .single()
        .expect("timestamp");
    Document {
        id: id.to_string(),
        doc_type: DocumentType::Concept,
        domain: "coding".to_string(),
        tags: Vec::new(),
        confidence: 0.8,
        source: SourceKind::DirectExperience,
        relations: relations
            .iter()
            .map(|(target, kind)| Relation {
                id: target.to_string(),
                relation: kind.clone(),
            })
            .collect(),
        created: at,
        modified: at,
        body: body.to_string(),
        path: None,
    }
}

fn long_body(topic: &str, sections: usize) -> String {
    let mut body = format!("# {topic}\n\n");
    for section in 0..sections {
        body.push_str(&format!("## Part {section}\n\n"));
        for sentence in 0..30 {
            body.push_str(&format!(
                "The {topic} note keeps sentence {sentence} of part {section} for indexing. "
            ));
        }
        body.push_str("\n\n");
    }
    body
}

fn corpus() -> Vec<Document> {
    vec![
        doc("alpha", &long_body("alpha", 3), &[("beta", RelationKind::Uses)]),
        doc("beta", &long_body("beta", 1), &[("ghost", RelationKind::InformedBy)]),
        doc("gamma", "# Gamma\n\nshort note about gamma rays", &[]),
    ]
}

fn fast_options() -> IndexOptions {
    IndexOptions {
        batch_size: 4,
        retry: RetryPolicy {
            retries: 1,
            timeout: Duration::from_millis(200),
            base_delay: Duration::from_millis(1),
        },
        ..IndexOptions::default()
    }
}

async fn store_over(
    source: Arc<InMemorySource>,
    embedder: Arc<dyn EmbeddingProvider>,
    options: IndexOptions,
) -> IndexStore {
    IndexStore::open(source, embedder, options)
        .await
        .expect("open store")
}

/// Fails every call whose batch contains a chunk of `poisoned`.
struct SelectiveEmbedder {
    inner: HashingEmbedder,
    poisoned: &'static str,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for SelectiveEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dims(&self) -> Option<usize> {
        self.inner.dims()
    }

    async fn embed_many(&self, texts: &[String]) -> RetrievalResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if texts.iter().any(|text| text.contains(self.poisoned)) {
            return Err(RetrievalError::Embedding("provider unavailable".to_string()));
        }
        self.inner.embed_many(texts).await
    }
}

/// Counts calls, otherwise behaves like the hashing embedder.
struct CountingEmbedder {
    inner: HashingEmbedder,
    texts: AtomicUsize,
}

impl CountingEmbedder {
    fn new(dims: usize) -> Self {
        Self {
            inner: HashingEmbedder::new(dims),
            texts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dims(&self) -> Option<usize> {
        self.inner.dims()
    }

    async fn embed_many(&self, texts: &[String]) -> RetrievalResult<Vec<Vec<f32>>> {
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_many(texts).await
    }
}

/// The first single-document read returns what it saw, but only after the
/// test opens the gate.
#[derive(Default)]
struct GatedSource {
    inner: InMemorySource,
    reads: AtomicUsize,
    entered: Notify,
    gate: Notify,
}

#[async_trait]
impl DocumentSource for GatedSource {
    async fn documents(&self) -> RetrievalResult<SourceScan> {
        self.inner.documents().await
    }

    async fn document(&self, id: &str) -> RetrievalResult<Option<Document>> {
        let found = self.inner.document(id).await?;
        if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.gate.notified().await;
        }
        Ok(found)
    }
}

async fn ranked(engine: &RetrievalEngine, task: &str) -> Vec<(String, f64)> {
    engine
        .retrieve(&RetrievalRequest::new(task))
        .await
        .expect("retrieve")
        .fragments
        .into_iter()
        .map(|fragment| (fragment.chunk_id, fragment.score))
        .collect()
}

// ── rebuilds ──

#[tokio::test]
async fn rebuild_is_idempotent() {
    let source = Arc::new(InMemorySource::new(corpus()));
    let store =
        Arc::new(store_over(source, Arc::new(HashingEmbedder::new(64)), fast_options()).await);
    let engine = RetrievalEngine::new(
        Arc::clone(&store),
        Arc::new(PassthroughRanker),
        &RetrievalSettings::default(),
    );
    let task = "alpha sentence indexing for gamma rays";

    let first_stats = store.build().await.expect("first build");
    let first = store.snapshot();
    let first_ranked = ranked(&engine, task).await;
    let second_stats = store.build().await.expect("second build");
    let second = store.snapshot();
    let second_ranked = ranked(&engine, task).await;

    assert_eq!(second.generation(), first.generation() + 1);
    assert_eq!(first_stats.chunks, second_stats.chunks);
    assert_eq!(second_stats.fresh, 0);
    assert_eq!(second_stats.reused, second_stats.chunks);

    let chunks = |s: &nugget_retrieval::IndexSnapshot| {
        s.chunks().map(|c| (**c).clone()).collect::<Vec<_>>()
    };
    assert_eq!(chunks(&first), chunks(&second));
    for chunk in first.chunks() {
        assert_eq!(first.vector(&chunk.key), second.vector(&chunk.key));
    }
    assert_eq!(
        first.query_text("alpha sentence indexing", 10).expect("text query"),
        second.query_text("alpha sentence indexing", 10).expect("text query")
    );
    assert_eq!(first.graph().edge_count(), second.graph().edge_count());

    assert!(!first_ranked.is_empty());
    assert_eq!(first_ranked, second_ranked);
}

#[tokio::test]
async fn every_chunk_belongs_to_an_indexed_document() {
    let source = Arc::new(InMemorySource::new(corpus()));
    let store = store_over(source, Arc::new(HashingEmbedder::new(64)), fast_options()).await;
    store.build().await.expect("build");

    let snapshot = store.snapshot();
    assert!(snapshot.chunk_count() > 3, "long documents should split");
    for chunk in snapshot.chunks() {
        assert!(snapshot.document(&chunk.key.document_id).is_some());
    }
    assert_eq!(snapshot.graph().dangling_edges().len(), 1);
}

// ── incremental writes ──

#[tokio::test]
async fn reindex_replaces_old_chunks() {
    let source = Arc::new(InMemorySource::new(corpus()));
    let store = store_over(
        Arc::clone(&source),
        Arc::new(HashingEmbedder::new(64)),
        fast_options(),
    )
    .await;
    store.build().await.expect("build");
    let alpha_chunks = store.snapshot().document_chunks("alpha").count();
    assert!(alpha_chunks > 1);

    source.upsert(doc("alpha", "# Alpha\n\nnow a tiny note about zebras", &[]));
    let stats = store.reindex("alpha").await.expect("reindex");

    let snapshot = store.snapshot();
    assert_eq!(snapshot.document_chunks("alpha").count(), 1);
    assert_eq!(stats.fresh, 1);
    assert!(snapshot.chunk(&ChunkKey::new("alpha", 1)).is_none());
    let stale = snapshot
        .query_text("sentence alpha part", 50)
        .expect("text query");
    assert!(stale.iter().all(|(k, _)| k.document_id != "alpha"));
    let zebras = snapshot.query_text("zebras", 5).expect("text query");
    assert_eq!(zebras[0].0, ChunkKey::new("alpha", 0));
    // alpha no longer uses beta
    assert!(snapshot.neighbors("beta", None, 1).expect("neighbors").is_empty());
}

#[tokio::test]
async fn reindex_of_vanished_document_purges_it() {
    let source = Arc::new(InMemorySource::new(corpus()));
    let store = store_over(
        Arc::clone(&source),
        Arc::new(HashingEmbedder::new(64)),
        fast_options(),
    )
    .await;
    store.build().await.expect("build");

    source.remove("beta");
    let stats = store.reindex("beta").await.expect("reindex");

    let snapshot = store.snapshot();
    assert_eq!(stats.documents, 2);
    assert!(snapshot.document("beta").is_none());
    assert_eq!(snapshot.document_chunks("beta").count(), 0);
    assert!(snapshot.query_text("beta", 10).expect("text query").is_empty());
    // the alpha -> beta edge now dangles and is skipped
    assert!(snapshot.neighbors("alpha", None, 2).expect("neighbors").is_empty());
}

#[tokio::test]
async fn apply_change_adds_documents() {
    let source = Arc::new(InMemorySource::new(Vec::new()));
    let store = store_over(source, Arc::new(HashingEmbedder::new(64)), fast_options()).await;
    store.build().await.expect("build");

    store
        .apply_change(DocumentChange::Added(doc(
            "delta",
            "# Delta\n\nriver delta sediment",
            &[],
        )))
        .await
        .expect("add");

    let snapshot = store.snapshot();
    assert_eq!(snapshot.document_count(), 1);
    assert_eq!(snapshot.embedded_count(), 1);
}

#[tokio::test]
async fn concurrent_reindexes_publish_in_read_order() {
    let source = Arc::new(GatedSource::default());
    source.inner.upsert(doc("alpha", "# Alpha\n\nstale wording", &[]));
    let store = Arc::new(
        IndexStore::open(
            Arc::clone(&source) as Arc<dyn DocumentSource>,
            Arc::new(HashingEmbedder::new(64)),
            fast_options(),
        )
        .await
        .expect("open store"),
    );
    store.build().await.expect("build");

    // The first reindex reads the stale body and stalls before applying it.
    let first = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.reindex("alpha").await }
    });
    source.entered.notified().await;

    source.inner.upsert(doc("alpha", "# Alpha\n\nfresh wording", &[]));
    let second = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.reindex("alpha").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    source.gate.notify_one();

    first.await.expect("join").expect("first reindex");
    second.await.expect("join").expect("second reindex");

    let snapshot = store.snapshot();
    let alpha = snapshot.document("alpha").expect("alpha indexed");
    assert!(alpha.body.contains("fresh wording"));
    let hits = snapshot.query_text("stale", 5).expect("text query");
    assert!(hits.is_empty());
}

#[tokio::test]
async fn reindex_clears_rejection_once_file_loads() {
    let dir = TempDir::new().expect("tempdir");
    init_brain(dir.path()).expect("init");
    let path = domains_root(dir.path()).join("broken.md");
    std::fs::write(&path, "no front matter here").expect("write");
    let store = IndexStore::open(
        Arc::new(BrainSource::new(dir.path())),
        Arc::new(HashingEmbedder::new(64)),
        fast_options(),
    )
    .await
    .expect("open store");

    let stats = store.build().await.expect("build");
    assert_eq!(stats.rejected, 1);

    std::fs::write(
        &path,
        "---\nid: broken\ntype: concept\ndomain: test\ncreated: 2026-01-01\n---\n# Fixed\n",
    )
    .expect("fix");
    let stats = store.reindex("broken").await.expect("reindex");

    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.documents, 1);
    assert_eq!(store.snapshot().rejected().count(), 0);
}

// ── provider failures ──

#[tokio::test]
async fn failed_batches_leave_chunks_text_searchable() {
    let source = Arc::new(InMemorySource::new(vec![
        doc("good", "# Good\n\nreliable words here", &[]),
        doc("bad", "# Bad\n\npoison pill content", &[]),
    ]));
    let embedder = Arc::new(SelectiveEmbedder {
        inner: HashingEmbedder::new(64),
        poisoned: "poison",
        calls: AtomicUsize::new(0),
    });
    let options = IndexOptions {
        batch_size: 1,
        ..fast_options()
    };
    let store = store_over(source, embedder.clone(), options).await;

    let stats = store.build().await.expect("build survives provider failure");

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.unembedded, 1);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.unembedded(), vec![&ChunkKey::new("bad", 0)]);
    let text = snapshot.query_text("poison pill", 5).expect("text query");
    assert_eq!(text[0].0, ChunkKey::new("bad", 0));
    let query = HashingEmbedder::new(64).vectorize("poison pill content");
    assert!(snapshot.query_vectors(&query, 5).iter().all(|(k, _)| k.document_id != "bad"));
    // one good call, two attempts for the poisoned batch
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
}

// ── embedding cache ──

#[tokio::test]
async fn cache_survives_process_restart() {
    let temp = TempDir::new().expect("tempdir");
    let options = IndexOptions {
        cache_path: Some(temp.path().join(".nugget").join("index.sqlite3")),
        ..fast_options()
    };

    let first_embedder = Arc::new(CountingEmbedder::new(64));
    {
        let source = Arc::new(InMemorySource::new(corpus()));
        let store = store_over(source, first_embedder.clone(), options.clone()).await;
        let stats = store.build().await.expect("build");
        assert_eq!(stats.fresh, stats.chunks);
    }

    let second_embedder = Arc::new(CountingEmbedder::new(64));
    let source = Arc::new(InMemorySource::new(corpus()));
    let store = store_over(source, second_embedder.clone(), options).await;
    let stats = store.build().await.expect("rebuild");

    assert_eq!(stats.from_cache, stats.chunks);
    assert_eq!(stats.fresh, 0);
    assert_eq!(second_embedder.texts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn model_change_invalidates_cached_vectors() {
    let temp = TempDir::new().expect("tempdir");
    let options = IndexOptions {
        cache_path: Some(temp.path().join("index.sqlite3")),
        ..fast_options()
    };

    {
        let source = Arc::new(InMemorySource::new(corpus()));
        let store = store_over(source, Arc::new(HashingEmbedder::new(64)), options.clone()).await;
        store.build().await.expect("build");
    }

    let other = Arc::new(CountingEmbedder::new(32));
    let source = Arc::new(InMemorySource::new(corpus()));
    let store = store_over(source, other.clone(), options).await;
    let stats = store.build().await.expect("rebuild");

    assert_eq!(stats.from_cache, 0);
    assert_eq!(stats.fresh, stats.chunks);
    assert_eq!(store.snapshot().dims(), Some(32));
}

#[tokio::test]
async fn changing_embedder_keeps_chunks_and_text() {
    let source = Arc::new(InMemorySource::new(corpus()));
    let store = store_over(source, Arc::new(HashingEmbedder::new(64)), fast_options()).await;
    store.build().await.expect("build");
    let before = store.snapshot();

    let stats = store
        .change_embedder(Arc::new(HashingEmbedder::new(16)))
        .await
        .expect("change embedder");

    let after = store.snapshot();
    assert_eq!(after.model_id(), "hashing-v1-16");
    assert_eq!(store.embedder().model_id(), "hashing-v1-16");
    assert_eq!(stats.chunks, before.chunk_count());
    assert_eq!(stats.fresh, stats.chunks);
    assert_eq!(
        before.query_text("gamma rays", 5).expect("text query"),
        after.query_text("gamma rays", 5).expect("text query")
    );
    for chunk in after.chunks() {
        assert_eq!(after.vector(&chunk.key).map(<[f32]>::len), Some(16));
    }
}
