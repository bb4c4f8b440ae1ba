//! Relationship graph projected from frontmatter relations.
//!
//! The graph is rebuilt with every snapshot; it is never edited in place.
//! Edges whose target is not a known document are kept but never walked.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::{Document, EdgeDirection, RelationKind, RelationStep};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
}

/// A document reached by traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reached {
    pub document_id: String,
    pub hops: u32,
    /// Seed the shortest path started from.
    pub seed: String,
    pub path: Vec<RelationStep>,
}

impl Reached {
    pub fn relation_kinds(&self) -> Vec<&RelationKind> {
        self.path.iter().map(|step| &step.kind).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    nodes: BTreeSet<String>,
    outgoing: BTreeMap<String, Vec<Edge>>,
    incoming: BTreeMap<String, Vec<Edge>>,
    edge_count: usize,
}

impl RelationGraph {
    pub fn from_documents<'a>(documents: impl IntoIterator<Item = &'a Document>) -> Self {
        let mut graph = Self::default();
        for doc in documents {
            graph.nodes.insert(doc.id.clone());
            for relation in &doc.relations {
                let edge = Edge {
                    source: doc.id.clone(),
                    target: relation.id.clone(),
                    kind: relation.relation.clone(),
                };
                graph
                    .outgoing
                    .entry(edge.source.clone())
                    .or_default()
                    .push(edge.clone());
                graph
                    .incoming
                    .entry(edge.target.clone())
                    .or_default()
                    .push(edge);
                graph.edge_count += 1;
            }
        }
        for edges in graph.outgoing.values_mut().chain(graph.incoming.values_mut()) {
            edges.sort();
            edges.dedup();
        }
        graph
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.nodes.contains(document_id)
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Edges pointing at documents that do not exist.
    pub fn dangling_edges(&self) -> Vec<&Edge> {
        self.outgoing
            .values()
            .flatten()
            .filter(|edge| !self.nodes.contains(&edge.target))
            .collect()
    }

    /// Documents within `max_hops` of `document_id`, both directions.
    pub fn neighbors(
        &self,
        document_id: &str,
        relation_filter: Option<&[RelationKind]>,
        max_hops: u32,
    ) -> Vec<Reached> {
        self.expand(&[document_id.to_string()], relation_filter, max_hops)
    }

    /// Multi-source breadth-first walk. Seeds themselves are not reported;
    /// each other document is reported once, at its shortest distance, with
    /// earlier seeds winning ties.
    pub fn expand(
        &self,
        seeds: &[String],
        relation_filter: Option<&[RelationKind]>,
        max_hops: u32,
    ) -> Vec<Reached> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, u32, &str, Vec<RelationStep>)> = VecDeque::new();
        for seed in seeds {
            if self.nodes.contains(seed) && visited.insert(seed.as_str()) {
                queue.push_back((seed.as_str(), 0, seed.as_str(), Vec::new()));
            }
        }

        let allowed = |kind: &RelationKind| relation_filter.is_none_or(|kinds| kinds.contains(kind));
        let mut reached = Vec::new();
        while let Some((current, hops, seed, path)) = queue.pop_front() {
            if hops >= max_hops {
                continue;
            }
            let outgoing = self
                .outgoing
                .get(current)
                .into_iter()
                .flatten()
                .map(|edge| (edge, edge.target.as_str(), EdgeDirection::Outgoing));
            let incoming = self
                .incoming
                .get(current)
                .into_iter()
                .flatten()
                .map(|edge| (edge, edge.source.as_str(), EdgeDirection::Incoming));

            for (edge, next, direction) in outgoing.chain(incoming) {
                if !allowed(&edge.kind) || !self.nodes.contains(next) || visited.contains(next) {
                    continue;
                }
                visited.insert(next);
                let mut next_path = path.clone();
                next_path.push(RelationStep {
                    from: current.to_string(),
                    to: next.to_string(),
                    kind: edge.kind.clone(),
                    direction,
                });
                reached.push(Reached {
                    document_id: next.to_string(),
                    hops: hops + 1,
                    seed: seed.to_string(),
                    path: next_path.clone(),
                });
                queue.push_back((next, hops + 1, seed, next_path));
            }
        }
        reached
    }
}
