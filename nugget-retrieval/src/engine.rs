//! Retrieval orchestration: embed the task, fuse search results, expand along
//! relations, prune and rank.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nugget_core::config::RetrievalSettings;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::embeddings::{RetryPolicy, embedder_from_settings};
use crate::errors::{RetrievalError, RetrievalResult};
use crate::expander::GraphExpander;
use crate::index::{IndexOptions, IndexStats, IndexStore};
use crate::models::{Candidate, CandidateOrigin, ContextFragment};
use crate::paths::brain_root;
use crate::ranker::{
    PruningPolicy, RankCandidate, Ranked, RelevanceRanker, apply_verdict, prune_candidates,
    ranker_from_settings,
};
use crate::search::HybridSearch;
use crate::sources::BrainSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStage {
    Idle,
    EmbeddingQuery,
    Layer1Fusion,
    Layer2Expansion,
    Layer3Ranking,
    Done,
    Error,
}

impl RetrievalStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use RetrievalStage::*;
        match next {
            Error => !self.is_terminal(),
            _ => matches!(
                (self, next),
                (Idle, EmbeddingQuery)
                    | (EmbeddingQuery, Layer1Fusion)
                    | (Layer1Fusion, Layer2Expansion)
                    | (Layer2Expansion, Layer3Ranking)
                    | (Layer3Ranking, Done)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: RetrievalStage,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalTrace {
    /// Completed stages in order.
    pub stages: Vec<StageTiming>,
    /// The ranker failed or timed out and the pruning order was kept.
    pub degraded: bool,
    /// The task could not be embedded; only full-text search ran.
    pub text_only: bool,
    pub ranker: String,
    pub candidates: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalOutcome {
    pub fragments: Vec<ContextFragment>,
    pub trace: RetrievalTrace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalRequest {
    pub task: String,
    pub domain_hint: Option<String>,
    /// Overrides the configured result count.
    pub max_results: Option<usize>,
}

impl RetrievalRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_domain_hint(mut self, hint: impl Into<String>) -> Self {
        self.domain_hint = Some(hint.into());
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }
}

struct StageMachine {
    current: RetrievalStage,
    entered: Instant,
    trace: RetrievalTrace,
}

impl StageMachine {
    fn new(ranker: &str) -> Self {
        Self {
            current: RetrievalStage::Idle,
            entered: Instant::now(),
            trace: RetrievalTrace {
                ranker: ranker.to_string(),
                ..RetrievalTrace::default()
            },
        }
    }

    fn advance(&mut self, next: RetrievalStage) -> RetrievalResult<()> {
        if !self.current.can_advance_to(next) {
            return Err(RetrievalError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        if self.current != RetrievalStage::Idle {
            let elapsed_ms = self.entered.elapsed().as_millis() as u64;
            debug!(stage = ?self.current, elapsed_ms, "retrieval stage finished");
            self.trace.stages.push(StageTiming {
                stage: self.current,
                elapsed_ms,
            });
        }
        self.current = next;
        self.entered = Instant::now();
        Ok(())
    }

    fn fail(&mut self, err: &RetrievalError) {
        warn!(stage = ?self.current, "retrieval failed: {err}");
        if self.current.can_advance_to(RetrievalStage::Error) {
            self.current = RetrievalStage::Error;
        }
    }
}

pub struct RetrievalEngine {
    store: Arc<IndexStore>,
    ranker: Arc<dyn RelevanceRanker>,
    search: HybridSearch,
    expander: GraphExpander,
    pruning: PruningPolicy,
    candidate_budget: usize,
    ranker_timeout: Duration,
    max_results: usize,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<IndexStore>,
        ranker: Arc<dyn RelevanceRanker>,
        settings: &RetrievalSettings,
    ) -> Self {
        Self {
            store,
            ranker,
            search: HybridSearch::new(
                settings.search.clone(),
                RetryPolicy::from_settings(&settings.embedding),
            ),
            expander: GraphExpander::from_settings(&settings.search),
            pruning: PruningPolicy::from(&settings.ranker.pruning),
            candidate_budget: settings.ranker.candidate_budget,
            ranker_timeout: Duration::from_millis(settings.ranker.timeout_ms),
            max_results: settings.search.max_results,
        }
    }

    /// Engine over the configured brain directory with the configured
    /// providers. The index starts empty; call [`Self::rebuild`].
    pub async fn open(
        settings: &RetrievalSettings,
        ranker_api_key: Option<String>,
    ) -> RetrievalResult<Self> {
        let source = Arc::new(BrainSource::new(brain_root(settings)?));
        let embedder = embedder_from_settings(&settings.embedding);
        let store = IndexStore::open(source, embedder, IndexOptions::from_settings(settings)?).await?;
        let ranker = ranker_from_settings(&settings.ranker, ranker_api_key)?;
        Ok(Self::new(Arc::new(store), ranker, settings))
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub async fn rebuild(&self) -> RetrievalResult<IndexStats> {
        self.store.build().await
    }

    /// Context fragments for `task`, most relevant first.
    pub async fn get_relevant_context(
        &self,
        task: &str,
        domain_hint: Option<&str>,
    ) -> RetrievalResult<Vec<ContextFragment>> {
        let mut request = RetrievalRequest::new(task);
        request.domain_hint = domain_hint.map(str::to_string);
        Ok(self.retrieve(&request).await?.fragments)
    }

    /// Like [`Self::retrieve`], abandoned as soon as `token` is cancelled.
    pub async fn retrieve_cancellable(
        &self,
        request: &RetrievalRequest,
        token: CancellationToken,
    ) -> RetrievalResult<RetrievalOutcome> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("retrieval cancelled");
                Err(RetrievalError::Cancelled)
            }
            outcome = self.retrieve(request) => outcome,
        }
    }

    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievalResult<RetrievalOutcome> {
        let task = request.task.trim();
        if task.is_empty() {
            return Ok(RetrievalOutcome::default());
        }

        let started = Instant::now();
        let mut machine = StageMachine::new(self.ranker.name());
        let max_results = request.max_results.unwrap_or(self.max_results);
        match self
            .run(&mut machine, task, request.domain_hint.as_deref(), max_results)
            .await
        {
            Ok(fragments) => {
                machine.advance(RetrievalStage::Done)?;
                info!(
                    fragments = fragments.len(),
                    candidates = machine.trace.candidates,
                    degraded = machine.trace.degraded,
                    text_only = machine.trace.text_only,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "retrieval finished"
                );
                Ok(RetrievalOutcome {
                    fragments,
                    trace: machine.trace,
                })
            }
            Err(err) => {
                machine.fail(&err);
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        machine: &mut StageMachine,
        task: &str,
        domain_hint: Option<&str>,
        max_results: usize,
    ) -> RetrievalResult<Vec<ContextFragment>> {
        let (snapshot, embedder) = self.store.view();
        if snapshot.is_empty() {
            return Err(RetrievalError::EmptyIndex);
        }

        machine.advance(RetrievalStage::EmbeddingQuery)?;
        let query_vector = self
            .search
            .embed_query(&snapshot, embedder.as_ref(), task)
            .await?;
        machine.trace.text_only = query_vector.is_none();

        machine.advance(RetrievalStage::Layer1Fusion)?;
        let hits = self
            .search
            .fuse(Arc::clone(&snapshot), query_vector, task)
            .await?;

        machine.advance(RetrievalStage::Layer2Expansion)?;
        let candidates = self.expander.expand(&snapshot, &hits, task)?;
        machine.trace.candidates = candidates.len();

        machine.advance(RetrievalStage::Layer3Ranking)?;
        let pruned = prune_candidates(candidates, self.candidate_budget, &self.pruning, domain_hint);
        machine.trace.pruned = pruned.len();
        let ranked = self.rank(task, pruned, &mut machine.trace).await;

        Ok(ranked.into_iter().take(max_results).map(to_fragment).collect())
    }

    /// Ask the ranker for an order; on error, timeout or a malformed verdict
    /// keep the pruning order.
    async fn rank(&self, task: &str, pruned: Vec<Ranked>, trace: &mut RetrievalTrace) -> Vec<Ranked> {
        if pruned.is_empty() {
            return pruned;
        }
        let payload: Vec<RankCandidate> = pruned
            .iter()
            .map(|ranked| RankCandidate::from(&ranked.candidate))
            .collect();

        let verdict = match tokio::time::timeout(self.ranker_timeout, self.ranker.score(task, &payload)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(err)) => {
                warn!(ranker = %self.ranker.name(), "ranker failed, keeping pruning order: {err}");
                trace.degraded = true;
                return pruned;
            }
            Err(_) => {
                warn!(
                    ranker = %self.ranker.name(),
                    timeout_ms = self.ranker_timeout.as_millis() as u64,
                    "ranker timed out, keeping pruning order"
                );
                trace.degraded = true;
                return pruned;
            }
        };

        match apply_verdict(pruned.clone(), verdict) {
            Ok(ranked) => ranked,
            Err(err) => {
                warn!(ranker = %self.ranker.name(), "discarding ranker verdict: {err}");
                trace.degraded = true;
                pruned
            }
        }
    }
}

fn to_fragment(ranked: Ranked) -> ContextFragment {
    let justification = justify(&ranked.candidate);
    let candidate = ranked.candidate;
    ContextFragment {
        document_id: candidate.chunk.document_id.clone(),
        chunk_id: candidate.chunk.to_string(),
        breadcrumb: candidate.breadcrumb,
        excerpt: candidate.text,
        score: ranked.score,
        justification,
    }
}

fn justify(candidate: &Candidate) -> String {
    match &candidate.origin {
        CandidateOrigin::Search {
            vector_rank,
            text_rank,
        } => {
            let mut reason = match (vector_rank, text_rank) {
                (Some(vector), Some(text)) => {
                    format!("semantic match #{vector} and keyword match #{text}")
                }
                (Some(vector), None) => format!("semantic match #{vector}"),
                (None, Some(text)) => format!("keyword match #{text}"),
                (None, None) => "search match".to_string(),
            };
            if !candidate.other_chunks.is_empty() {
                let others: Vec<String> = candidate
                    .other_chunks
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                reason.push_str(&format!("; also matches {}", others.join(", ")));
            }
            reason
        }
        CandidateOrigin::Graph { seed, hops, path } => {
            let steps: Vec<String> = path.iter().map(ToString::to_string).collect();
            format!(
                "related to {seed} within {hops} hop{}: {}",
                if *hops == 1 { "" } else { "s" },
                steps.join(", ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkKey, EdgeDirection, RelationKind, RelationStep, SourceKind};
    use chrono::Utc;

    #[test]
    fn stage_transitions_follow_the_pipeline() {
        use RetrievalStage::*;
        let path = [Idle, EmbeddingQuery, Layer1Fusion, Layer2Expansion, Layer3Ranking, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(!Idle.can_advance_to(Layer1Fusion));
        assert!(!Layer3Ranking.can_advance_to(EmbeddingQuery));
        assert!(!Done.can_advance_to(Error));
        assert!(!Error.can_advance_to(Idle));
        for stage in [Idle, EmbeddingQuery, Layer1Fusion, Layer2Expansion, Layer3Ranking] {
            assert!(stage.can_advance_to(Error));
        }
    }

    #[test]
    fn machine_rejects_skipped_stages() {
        let mut machine = StageMachine::new("passthrough");
        machine.advance(RetrievalStage::EmbeddingQuery).expect("advance");

        let err = machine.advance(RetrievalStage::Done).unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::InvalidTransition {
                from: RetrievalStage::EmbeddingQuery,
                to: RetrievalStage::Done
            }
        ));

        machine.advance(RetrievalStage::Layer1Fusion).expect("advance");
        assert_eq!(machine.trace.stages.len(), 1);
        assert_eq!(machine.trace.stages[0].stage, RetrievalStage::EmbeddingQuery);
    }

    #[test]
    fn justification_describes_graph_paths() {
        let candidate = Candidate {
            chunk: ChunkKey::new("ttl", 0),
            breadcrumb: Vec::new(),
            text: String::new(),
            domain: "coding".to_string(),
            confidence: 0.8,
            source: SourceKind::Unknown,
            modified: Utc::now(),
            fused_score: 0.1,
            origin: CandidateOrigin::Graph {
                seed: "cache".to_string(),
                hops: 1,
                path: vec![RelationStep {
                    from: "cache".to_string(),
                    to: "ttl".to_string(),
                    kind: RelationKind::Implements,
                    direction: EdgeDirection::Outgoing,
                }],
            },
            other_chunks: Vec::new(),
        };

        assert_eq!(
            justify(&candidate),
            "related to cache within 1 hop: cache -implements-> ttl"
        );
    }
}
