//! Layer 2: turn fused search hits into candidates and pull in related
//! documents by walking the relation graph.

use std::collections::{HashMap, HashSet};

use nugget_core::config::SearchDefaults;
use tracing::debug;

use crate::errors::RetrievalResult;
use crate::index::IndexSnapshot;
use crate::models::{Candidate, CandidateOrigin, ChunkKey};
use crate::search::DocumentHit;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphExpander {
    pub max_hops: u32,
    /// How many top documents seed the walk.
    pub seeds: usize,
    /// Score multiplier applied once per hop.
    pub decay: f64,
}

impl GraphExpander {
    pub fn from_settings(settings: &SearchDefaults) -> Self {
        Self {
            max_hops: u32::from(settings.graph_depth),
            seeds: settings.graph_seeds,
            decay: settings.graph_decay,
        }
    }

    /// Search candidates in hit order, followed by graph candidates ordered
    /// by inherited score. A document appears at most once.
    pub fn expand(
        &self,
        snapshot: &IndexSnapshot,
        hits: &[DocumentHit],
        query: &str,
    ) -> RetrievalResult<Vec<Candidate>> {
        let mut candidates: Vec<Candidate> = hits
            .iter()
            .filter_map(|hit| search_candidate(snapshot, hit))
            .collect();
        if self.max_hops == 0 || self.seeds == 0 || hits.is_empty() {
            return Ok(candidates);
        }

        let seeds: Vec<String> = hits
            .iter()
            .take(self.seeds)
            .map(|hit| hit.document_id.clone())
            .collect();
        let seed_scores: HashMap<&str, f64> = hits
            .iter()
            .take(self.seeds)
            .map(|hit| (hit.document_id.as_str(), hit.score()))
            .collect();
        let present: HashSet<&str> = hits.iter().map(|hit| hit.document_id.as_str()).collect();

        let reached = snapshot.graph().expand(&seeds, None, self.max_hops);
        if reached.is_empty() {
            return Ok(candidates);
        }
        let best_chunks = best_text_chunks(snapshot, query)?;

        let mut expanded = Vec::new();
        for item in reached {
            if present.contains(item.document_id.as_str()) {
                continue;
            }
            let Some(doc) = snapshot.document(&item.document_id) else {
                continue;
            };
            let chunk = best_chunks
                .get(item.document_id.as_str())
                .and_then(|key| snapshot.chunk(key))
                .or_else(|| snapshot.document_chunks(&item.document_id).next());
            let Some(chunk) = chunk else {
                continue;
            };

            let seed_score = seed_scores.get(item.seed.as_str()).copied().unwrap_or(0.0);
            let hops = i32::try_from(item.hops).unwrap_or(i32::MAX);
            expanded.push(Candidate {
                chunk: chunk.key.clone(),
                breadcrumb: chunk.breadcrumb.clone(),
                text: chunk.content(),
                domain: doc.domain.clone(),
                confidence: doc.confidence,
                source: doc.source.clone(),
                modified: doc.modified,
                fused_score: seed_score * self.decay.powi(hops),
                origin: CandidateOrigin::Graph {
                    seed: item.seed,
                    hops: item.hops,
                    path: item.path,
                },
                other_chunks: Vec::new(),
            });
        }
        expanded.sort_by(|a, b| {
            b.fused_score
                .total_cmp(&a.fused_score)
                .then_with(|| a.chunk.cmp(&b.chunk))
        });
        debug!(
            seeds = seeds.len(),
            expanded = expanded.len(),
            "layer 2 graph expansion finished"
        );

        candidates.extend(expanded);
        Ok(candidates)
    }
}

fn search_candidate(snapshot: &IndexSnapshot, hit: &DocumentHit) -> Option<Candidate> {
    let doc = snapshot.document(&hit.document_id)?;
    let chunk = snapshot.chunk(&hit.best.chunk)?;
    Some(Candidate {
        chunk: chunk.key.clone(),
        breadcrumb: chunk.breadcrumb.clone(),
        text: chunk.content(),
        domain: doc.domain.clone(),
        confidence: doc.confidence,
        source: doc.source.clone(),
        modified: doc.modified,
        fused_score: hit.score(),
        origin: CandidateOrigin::Search {
            vector_rank: hit.best.vector_rank,
            text_rank: hit.best.text_rank,
        },
        other_chunks: hit.other_chunks.clone(),
    })
}

/// Highest-scoring chunk per document for the query's terms.
fn best_text_chunks(
    snapshot: &IndexSnapshot,
    query: &str,
) -> RetrievalResult<HashMap<String, ChunkKey>> {
    let mut best = HashMap::new();
    for (key, _) in snapshot.text().search_all(query)? {
        best.entry(key.document_id.clone()).or_insert(key);
    }
    Ok(best)
}
