//! Layer 3: candidate pruning and pluggable relevance ranking.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nugget_core::config::{PruningDefaults, RankerDefaults, RankerProviderKind};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::chunker::BREADCRUMB_SEPARATOR;
use crate::errors::{RetrievalError, RetrievalResult};
use crate::models::{Candidate, CandidateOrigin, domain_matches};

/// What a ranker sees about one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankCandidate {
    pub document_id: String,
    pub chunk_id: String,
    pub breadcrumb: Vec<String>,
    pub text: String,
    pub domain: String,
    pub confidence: f32,
    pub source: String,
    pub modified: DateTime<Utc>,
    pub hops: u32,
    pub relation_path: Vec<String>,
    pub fused_score: f64,
}

impl From<&Candidate> for RankCandidate {
    fn from(candidate: &Candidate) -> Self {
        let relation_path = match &candidate.origin {
            CandidateOrigin::Graph { path, .. } => {
                path.iter().map(ToString::to_string).collect()
            }
            CandidateOrigin::Search { .. } => Vec::new(),
        };
        Self {
            document_id: candidate.document_id().to_string(),
            chunk_id: candidate.chunk.to_string(),
            breadcrumb: candidate.breadcrumb.clone(),
            text: candidate.text.clone(),
            domain: candidate.domain.clone(),
            confidence: candidate.confidence,
            source: candidate.source.to_string(),
            modified: candidate.modified,
            hops: candidate.origin.hops(),
            relation_path,
            fused_score: candidate.fused_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RankerVerdict {
    /// One relevance score per candidate, in input order.
    Scores(Vec<f32>),
    /// Candidate indices, most relevant first.
    Permutation(Vec<usize>),
}

#[async_trait]
pub trait RelevanceRanker: Send + Sync {
    fn name(&self) -> &str;

    async fn score(
        &self,
        task: &str,
        candidates: &[RankCandidate],
    ) -> RetrievalResult<RankerVerdict>;
}

pub fn ranker_from_settings(
    settings: &RankerDefaults,
    api_key: Option<String>,
) -> RetrievalResult<Arc<dyn RelevanceRanker>> {
    Ok(match settings.provider {
        RankerProviderKind::Passthrough => Arc::new(PassthroughRanker),
        RankerProviderKind::OpenAiCompatible => {
            if api_key.is_none()
                && let Some(env) = &settings.api_key_env
            {
                return Err(RetrievalError::Ranker(format!(
                    "ranker provider '{}' needs an API key in ${env}",
                    settings.provider.as_str()
                )));
            }
            Arc::new(LlmRanker::new(settings, api_key)?)
        }
    })
}

/// Keeps the pruning order.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRanker;

#[async_trait]
impl RelevanceRanker for PassthroughRanker {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn score(
        &self,
        _task: &str,
        candidates: &[RankCandidate],
    ) -> RetrievalResult<RankerVerdict> {
        Ok(RankerVerdict::Permutation((0..candidates.len()).collect()))
    }
}

const EXCERPT_CHARS: usize = 1200;

const RANKER_SYSTEM_PROMPT: &str = "You judge how useful knowledge fragments are for a task. \
Reply with a JSON object {\"scores\": [...]} holding exactly one number between 0 and 1 per \
fragment, in the order given. Reply with the JSON object only.";

/// Scores candidates with an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct LlmRanker {
    http_client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ScoresPayload {
    scores: Vec<f32>,
}

impl LlmRanker {
    pub fn new(settings: &RankerDefaults, api_key: Option<String>) -> RetrievalResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http_client,
            api_key,
            model: settings.model.clone(),
            base_url: settings.base_url.clone(),
        })
    }

    fn chat_completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key
            && let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}"))
        {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }
}

fn render_prompt(task: &str, candidates: &[RankCandidate]) -> String {
    let mut prompt = format!("Task: {task}\n\nFragments:\n");
    for (index, candidate) in candidates.iter().enumerate() {
        let excerpt: String = candidate.text.chars().take(EXCERPT_CHARS).collect();
        prompt.push_str(&format!(
            "\n[{index}] {} | domain {} | confidence {:.2} | {}\n{}\n",
            candidate.document_id,
            candidate.domain,
            candidate.confidence,
            candidate.breadcrumb.join(BREADCRUMB_SEPARATOR),
            excerpt.trim()
        ));
    }
    prompt.push_str(&format!(
        "\nReturn {{\"scores\": [...]}} with {} numbers.",
        candidates.len()
    ));
    prompt
}

/// Pull the scores object out of a model reply, tolerating code fences and
/// surrounding prose.
fn parse_scores(reply: &str) -> RetrievalResult<Vec<f32>> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => {
            return Err(RetrievalError::Ranker(format!(
                "ranker reply holds no JSON object: {}",
                reply.chars().take(200).collect::<String>()
            )));
        }
    };
    let payload: ScoresPayload = serde_json::from_str(json)
        .map_err(|err| RetrievalError::Ranker(format!("invalid ranker reply: {err}")))?;
    Ok(payload.scores)
}

#[async_trait]
impl RelevanceRanker for LlmRanker {
    fn name(&self) -> &str {
        &self.model
    }

    async fn score(
        &self,
        task: &str,
        candidates: &[RankCandidate],
    ) -> RetrievalResult<RankerVerdict> {
        if candidates.is_empty() {
            return Ok(RankerVerdict::Scores(Vec::new()));
        }

        let body = ChatCompletionsRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Some(RANKER_SYSTEM_PROMPT.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Some(render_prompt(task, candidates)),
                },
            ],
            max_tokens: 1024,
            temperature: 0.0,
        };

        let response = self
            .http_client
            .post(self.chat_completions_url())
            .headers(self.build_headers())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Ranker(format!(
                "ranker request failed: {status} {text}"
            )));
        }

        let payload: ChatCompletionsResponse = response.json().await?;
        let reply = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RetrievalError::Ranker("ranker reply was empty".to_string()))?;
        Ok(RankerVerdict::Scores(parse_scores(&reply)?))
    }
}

/// Weights for the pre-ranking score:
/// `fused * (1 - hop_penalty)^hops * (1 + confidence_weight * (confidence - 0.5))`,
/// multiplied by `1 + domain_boost` when the candidate's domain matches the hint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PruningPolicy {
    pub hop_penalty: f64,
    pub confidence_weight: f64,
    pub domain_boost: f64,
}

impl PruningPolicy {
    pub fn score(&self, candidate: &Candidate, domain_hint: Option<&str>) -> f64 {
        let hops = i32::try_from(candidate.origin.hops()).unwrap_or(i32::MAX);
        let proximity = (1.0 - self.hop_penalty).clamp(0.0, 1.0).powi(hops);
        let confidence = 1.0 + self.confidence_weight * (f64::from(candidate.confidence) - 0.5);
        let domain = match domain_hint {
            Some(hint) if domain_matches(&candidate.domain, hint) => 1.0 + self.domain_boost,
            _ => 1.0,
        };
        candidate.fused_score * proximity * confidence * domain
    }
}

impl From<&PruningDefaults> for PruningPolicy {
    fn from(value: &PruningDefaults) -> Self {
        Self {
            hop_penalty: value.hop_penalty,
            confidence_weight: value.confidence_weight,
            domain_boost: value.domain_boost,
        }
    }
}

impl Default for PruningPolicy {
    fn default() -> Self {
        Self::from(&PruningDefaults::default())
    }
}

/// A candidate and its current score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranked {
    pub candidate: Candidate,
    pub score: f64,
}

/// Score candidates by `policy` and keep the best `budget`. Ties are broken by
/// document id, then chunk position.
pub fn prune_candidates(
    candidates: Vec<Candidate>,
    budget: usize,
    policy: &PruningPolicy,
    domain_hint: Option<&str>,
) -> Vec<Ranked> {
    let mut ranked: Vec<Ranked> = candidates
        .into_iter()
        .map(|candidate| Ranked {
            score: policy.score(&candidate, domain_hint),
            candidate,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.candidate.chunk.cmp(&b.candidate.chunk))
    });
    ranked.truncate(budget);
    ranked
}

/// Reorder pruned candidates by a ranker verdict, rejecting malformed ones.
pub fn apply_verdict(ranked: Vec<Ranked>, verdict: RankerVerdict) -> RetrievalResult<Vec<Ranked>> {
    let expected = ranked.len();
    match verdict {
        RankerVerdict::Scores(scores) => {
            if scores.len() != expected {
                return Err(RetrievalError::Ranker(format!(
                    "ranker returned {} scores for {expected} candidates",
                    scores.len()
                )));
            }
            if scores.iter().any(|score| !score.is_finite()) {
                return Err(RetrievalError::Ranker(
                    "ranker returned a non-finite score".to_string(),
                ));
            }
            let mut rescored: Vec<Ranked> = ranked
                .into_iter()
                .zip(scores)
                .map(|(item, score)| Ranked {
                    candidate: item.candidate,
                    score: f64::from(score),
                })
                .collect();
            rescored.sort_by(|a, b| b.score.total_cmp(&a.score));
            Ok(rescored)
        }
        RankerVerdict::Permutation(order) => {
            let unique: HashSet<usize> = order.iter().copied().collect();
            if order.len() != expected
                || unique.len() != expected
                || order.iter().any(|&index| index >= expected)
            {
                return Err(RetrievalError::Ranker(format!(
                    "ranker permutation {order:?} is not a permutation of {expected} candidates"
                )));
            }
            let mut slots: Vec<Option<Ranked>> = ranked.into_iter().map(Some).collect();
            Ok(order
                .into_iter()
                .filter_map(|index| slots[index].take())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkKey, EdgeDirection, RelationKind, RelationStep, SourceKind};

    fn candidate(doc: &str, fused: f64, hops: u32, domain: &str, confidence: f32) -> Candidate {
        let origin = if hops == 0 {
            CandidateOrigin::Search {
                vector_rank: Some(1),
                text_rank: None,
            }
        } else {
            CandidateOrigin::Graph {
                seed: "seed".to_string(),
                hops,
                path: vec![RelationStep {
                    from: "seed".to_string(),
                    to: doc.to_string(),
                    kind: RelationKind::Uses,
                    direction: EdgeDirection::Outgoing,
                }],
            }
        };
        Candidate {
            chunk: ChunkKey::new(doc, 0),
            breadcrumb: vec![doc.to_uppercase()],
            text: format!("text of {doc}"),
            domain: domain.to_string(),
            confidence,
            source: SourceKind::Imported,
            modified: Utc::now(),
            fused_score: fused,
            origin,
            other_chunks: Vec::new(),
        }
    }

    fn ids(ranked: &[Ranked]) -> Vec<&str> {
        ranked.iter().map(|r| r.candidate.document_id()).collect()
    }

    // ── pruning ──

    #[test]
    fn pruning_score_combines_all_factors() {
        let policy = PruningPolicy {
            hop_penalty: 0.25,
            confidence_weight: 0.5,
            domain_boost: 0.25,
        };
        let c = candidate("a", 0.04, 2, "coding/rust", 0.9);

        let expected = 0.04 * 0.75f64.powi(2) * (1.0 + 0.5 * (0.9f64 - 0.5)) * 1.25;
        let actual = policy.score(&c, Some("coding"));
        assert!((actual - expected).abs() < 1e-6, "{actual} vs {expected}");
        assert!(policy.score(&c, Some("fashion")) < actual);
    }

    #[test]
    fn pruning_enforces_budget_and_tie_order() {
        let candidates = vec![
            candidate("c", 0.1, 0, "x", 0.5),
            candidate("b", 0.1, 0, "x", 0.5),
            candidate("a", 0.3, 0, "x", 0.5),
            candidate("d", 0.01, 0, "x", 0.5),
        ];

        let pruned = prune_candidates(candidates, 3, &PruningPolicy::default(), None);
        assert_eq!(ids(&pruned), vec!["a", "b", "c"]);
    }

    #[test]
    fn graph_candidates_pay_hop_penalty() {
        let candidates = vec![
            candidate("far", 0.02, 2, "x", 0.5),
            candidate("near", 0.02, 0, "x", 0.5),
        ];
        let pruned = prune_candidates(candidates, 10, &PruningPolicy::default(), None);
        assert_eq!(ids(&pruned), vec!["near", "far"]);
    }

    // ── construction ──

    #[test]
    fn llm_ranker_requires_its_key_only_when_built() {
        let settings = RankerDefaults {
            provider: RankerProviderKind::OpenAiCompatible,
            api_key_env: Some("NUGGET_TEST_RANKER_KEY".to_string()),
            ..RankerDefaults::default()
        };

        let missing = ranker_from_settings(&settings, None);
        assert!(matches!(
            missing,
            Err(RetrievalError::Ranker(ref message))
                if message.contains("$NUGGET_TEST_RANKER_KEY")
        ));

        let built = ranker_from_settings(&settings, Some("secret".to_string()))
            .map(|ranker| ranker.name().to_string());
        assert_eq!(built.ok(), Some(settings.model.clone()));

        // Local servers without auth leave the env var unset.
        let keyless = RankerDefaults {
            api_key_env: None,
            ..settings
        };
        assert!(ranker_from_settings(&keyless, None).is_ok());

        let passthrough = ranker_from_settings(&RankerDefaults::default(), None)
            .map(|ranker| ranker.name().to_string());
        assert_eq!(passthrough.ok().as_deref(), Some("passthrough"));
    }

    // ── verdicts ──

    #[tokio::test]
    async fn passthrough_keeps_order() {
        let pruned = prune_candidates(
            vec![candidate("a", 0.3, 0, "x", 0.5), candidate("b", 0.2, 0, "x", 0.5)],
            10,
            &PruningPolicy::default(),
            None,
        );
        let payload: Vec<RankCandidate> = pruned.iter().map(|r| RankCandidate::from(&r.candidate)).collect();

        let verdict = PassthroughRanker.score("task", &payload).await.expect("score");
        let ranked = apply_verdict(pruned, verdict).expect("apply");
        assert_eq!(ids(&ranked), vec!["a", "b"]);
    }

    #[test]
    fn scores_reorder_candidates() {
        let pruned = prune_candidates(
            vec![candidate("a", 0.3, 0, "x", 0.5), candidate("b", 0.2, 0, "x", 0.5)],
            10,
            &PruningPolicy::default(),
            None,
        );
        let ranked = apply_verdict(pruned, RankerVerdict::Scores(vec![0.1, 0.9])).expect("apply");
        assert_eq!(ids(&ranked), vec!["b", "a"]);
        assert!((ranked[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn malformed_verdicts_are_rejected() {
        let pruned = || {
            prune_candidates(
                vec![candidate("a", 0.3, 0, "x", 0.5), candidate("b", 0.2, 0, "x", 0.5)],
                10,
                &PruningPolicy::default(),
                None,
            )
        };
        assert!(apply_verdict(pruned(), RankerVerdict::Scores(vec![0.5])).is_err());
        assert!(apply_verdict(pruned(), RankerVerdict::Scores(vec![0.5, f32::NAN])).is_err());
        assert!(apply_verdict(pruned(), RankerVerdict::Permutation(vec![0, 0])).is_err());
        assert!(apply_verdict(pruned(), RankerVerdict::Permutation(vec![0, 2])).is_err());
        assert!(apply_verdict(pruned(), RankerVerdict::Permutation(vec![1, 0])).is_ok());
    }

    // ── llm ranker plumbing ──

    #[test]
    fn parses_fenced_scores() {
        let reply = "Sure:\n```json\n{\"scores\": [0.9, 0.1]}\n```";
        assert_eq!(parse_scores(reply).expect("scores"), vec![0.9, 0.1]);
        assert!(parse_scores("no json here").is_err());
        assert!(parse_scores("{\"other\": 1}").is_err());
    }

    #[test]
    fn chat_completions_url_handles_v1_suffix() {
        let mut settings = RankerDefaults::default();
        settings.base_url = "http://127.0.0.1:8080/".to_string();
        let ranker = LlmRanker::new(&settings, None).expect("ranker");
        assert_eq!(
            ranker.chat_completions_url(),
            "http://127.0.0.1:8080/v1/chat/completions"
        );

        settings.base_url = "https://api.openai.com/v1".to_string();
        let ranker = LlmRanker::new(&settings, Some("key".to_string())).expect("ranker");
        assert_eq!(
            ranker.chat_completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert!(ranker.build_headers().contains_key(AUTHORIZATION));
    }

    #[test]
    fn prompt_lists_every_fragment() {
        let payload = vec![
            RankCandidate::from(&candidate("a", 0.3, 0, "coding", 0.5)),
            RankCandidate::from(&candidate("b", 0.2, 1, "coding", 0.5)),
        ];
        let prompt = render_prompt("evict cache", &payload);
        assert!(prompt.contains("[0] a"));
        assert!(prompt.contains("[1] b"));
        assert!(prompt.contains("2 numbers"));
        assert_eq!(payload[1].relation_path, vec!["seed -uses-> b"]);
    }
}
