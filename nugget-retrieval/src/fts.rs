//! Full-text index over chunks, backed by an in-RAM tantivy index.
//!
//! Each snapshot generation gets its own index, built once and never
//! written again, so readers holding an older snapshot keep searching the
//! text they were published with. Scoring is tantivy's BM25 (`k1 = 1.2`,
//! `b = 0.75`).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, STORED, Schema, TEXT, Value};
use tantivy::{
    Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument, Term, doc,
};

use crate::errors::RetrievalResult;
use crate::models::ChunkKey;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("token regex"));

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "do", "does", "for", "from",
    "how", "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of", "on", "or",
    "our", "should", "so", "that", "the", "their", "then", "there", "these", "this", "to", "was",
    "we", "what", "when", "where", "which", "who", "why", "will", "with", "you", "your",
];

/// Writer heap for one build; tantivy's per-thread minimum.
const WRITER_MEMORY: usize = 15_000_000;

/// Lowercased alphanumeric terms, stopwords and single characters dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|term| term.chars().count() > 1 && !STOPWORDS.contains(&term.as_str()))
        .collect()
}

#[derive(Clone, Default)]
pub struct TextIndex {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    searcher: Searcher,
    body: Field,
    slot: Field,
    /// Chunk key per stored slot.
    keys: Vec<ChunkKey>,
}

impl fmt::Debug for TextIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextIndex")
            .field("chunks", &self.len())
            .finish()
    }
}

impl TextIndex {
    /// Index `entries` as `(key, text)` pairs. Text is reduced to the same
    /// terms queries are, so index and query tokenization never drift apart.
    pub fn build(entries: Vec<(ChunkKey, String)>) -> RetrievalResult<Self> {
        if entries.is_empty() {
            return Ok(Self::default());
        }

        let mut builder = Schema::builder();
        let body = builder.add_text_field("body", TEXT);
        let slot = builder.add_u64_field("slot", STORED);
        let index = Index::create_in_ram(builder.build());

        let mut writer: IndexWriter = index.writer_with_num_threads(1, WRITER_MEMORY)?;
        let mut keys = Vec::with_capacity(entries.len());
        for (key, text) in entries {
            writer.add_document(doc!(
                body => tokenize(&text).join(" "),
                slot => keys.len() as u64,
            ))?;
            keys.push(key);
        }
        writer.commit()?;
        writer.wait_merging_threads()?;

        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            inner: Some(Arc::new(Inner {
                searcher: reader.searcher(),
                body,
                slot,
                keys,
            })),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.keys.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// BM25 top `limit` for any of the query's terms; ties broken by chunk
    /// key.
    pub fn search(&self, query: &str, limit: usize) -> RetrievalResult<Vec<(ChunkKey, f64)>> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .map(|term| {
                let term = Term::from_field_text(inner.body, term);
                let query: Box<dyn Query> =
                    Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Should, query)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        // Every match is collected so ties at the cut are decided by key,
        // not by tantivy's internal doc order.
        let top = inner
            .searcher
            .search(&query, &TopDocs::with_limit(inner.keys.len()))?;
        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let stored: TantivyDocument = inner.searcher.doc(address)?;
            let key = stored
                .get_first(inner.slot)
                .and_then(|value| value.as_u64())
                .and_then(|slot| inner.keys.get(slot as usize));
            if let Some(key) = key {
                hits.push((key.clone(), f64::from(score)));
            }
        }
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Every matching chunk, best first.
    pub fn search_all(&self, query: &str) -> RetrievalResult<Vec<(ChunkKey, f64)>> {
        self.search(query, self.len())
    }
}
