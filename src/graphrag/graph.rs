//! The typed directed multigraph: services, files, symbols, contracts,
//! endpoints, domain entities, and events, joined by 16 relation types.
//!
//! Parallel edges between the same pair of nodes are distinguished by
//! `EdgeRelation` — petgraph's multigraph already allows more than one edge
//! between a pair, so no `(u, v, relation)` keying trick is needed, but the
//! relation is still carried on the edge weight so callers can filter by it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Symbol,
    Service,
    Contract,
    Endpoint,
    DomainEntity,
    Event,
}

impl NodeType {
    pub fn prefix(&self) -> &'static str {
        match self {
            NodeType::File => "file",
            NodeType::Symbol => "symbol",
            NodeType::Service => "service",
            NodeType::Contract => "contract",
            NodeType::Endpoint => "endpoint",
            NodeType::DomainEntity => "domain_entity",
            NodeType::Event => "event",
        }
    }
}

/// The 16 relation types that may label an edge. Parallel edges between
/// the same two nodes are legal as long as their relation differs (or, in
/// rare fan-out cases such as repeated `CALLS` sites, even when it doesn't).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeRelation {
    ContainsFile,
    DefinesSymbol,
    Imports,
    Calls,
    ReferencesSymbol,
    ProvidesContract,
    DependsOnContract,
    ExposesEndpoint,
    HandlesEndpoint,
    OwnsEntity,
    ImplementsEntity,
    PublishesEvent,
    ConsumesEvent,
    TriggersEvent,
    ServiceCalls,
    BelongsToService,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub pagerank: Option<f64>,
    #[serde(default)]
    pub community: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub relation: EdgeRelation,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

pub struct KnowledgeGraph {
    graph: StableDiGraph<Node, Edge>,
    index_by_id: HashMap<String, NodeIndex>,
}

impl Default for KnowledgeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index_by_id: HashMap::new(),
        }
    }

    pub fn node_id(node_type: NodeType, rest: &str) -> String {
        format!("{}::{}", node_type.prefix(), rest)
    }

    /// Idempotent: re-adding an existing ID returns the existing index
    /// rather than creating a duplicate node.
    pub fn add_node(&mut self, id: impl Into<String>, node_type: NodeType, attributes: serde_json::Value) -> NodeIndex {
        let id = id.into();
        if let Some(&idx) = self.index_by_id.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(Node {
            id: id.clone(),
            node_type,
            attributes,
            pagerank: None,
            community: None,
        });
        self.index_by_id.insert(id, idx);
        idx
    }

    pub fn node_index(&self, id: &str) -> Option<NodeIndex> {
        self.index_by_id.get(id).copied()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index_by_id.get(id).and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        let idx = *self.index_by_id.get(id)?;
        self.graph.node_weight_mut(idx)
    }

    /// Edges whose source or target cannot be resolved are silently
    /// dropped, never an error — partial loads from upstream stores are
    /// expected.
    pub fn add_edge(&mut self, source_id: &str, target_id: &str, relation: EdgeRelation, attributes: serde_json::Value) -> bool {
        let (Some(&u), Some(&v)) = (self.index_by_id.get(source_id), self.index_by_id.get(target_id)) else {
            return false;
        };
        self.graph.add_edge(u, v, Edge { relation, attributes });
        true
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    pub fn inner(&self) -> &StableDiGraph<Node, Edge> {
        &self.graph
    }

    pub fn inner_mut(&mut self) -> &mut StableDiGraph<Node, Edge> {
        &mut self.graph
    }

    pub fn index_by_id(&self) -> &HashMap<String, NodeIndex> {
        &self.index_by_id
    }

    /// Outbound neighbors carrying a given relation, in no particular
    /// order beyond petgraph's internal edge storage.
    pub fn outbound(&self, id: &str, relation: EdgeRelation) -> Vec<&Node> {
        let Some(&idx) = self.index_by_id.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges(idx)
            .filter(|e| e.weight().relation == relation)
            .filter_map(|e| self.graph.node_weight(e.target()))
            .collect()
    }

    pub fn inbound(&self, id: &str, relation: EdgeRelation) -> Vec<&Node> {
        let Some(&idx) = self.index_by_id.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, petgraph::Direction::Incoming)
            .filter(|e| e.weight().relation == relation)
            .filter_map(|e| self.graph.node_weight(e.source()))
            .collect()
    }

    /// Deterministic node-link serialization: nodes and edges sorted by ID
    /// so two builds from identical inputs produce byte-identical JSON
    /// (after PageRank/Louvain, which are themselves seeded).
    pub fn to_node_link_json(&self) -> serde_json::Value {
        let mut nodes: Vec<&Node> = self.graph.node_weights().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges: Vec<serde_json::Value> = Vec::new();
        for edge_ref in self.graph.edge_references() {
            let source = &self.graph[edge_ref.source()].id;
            let target = &self.graph[edge_ref.target()].id;
            edges.push(serde_json::json!({
                "source": source,
                "target": target,
                "relation": edge_ref.weight().relation,
                "attributes": edge_ref.weight().attributes,
            }));
        }
        edges.sort_by(|a, b| {
            let key = |v: &serde_json::Value| {
                (
                    v["source"].as_str().unwrap_or_default().to_string(),
                    v["target"].as_str().unwrap_or_default().to_string(),
                    v["relation"].to_string(),
                )
            };
            key(a).cmp(&key(b))
        });

        let nodes_json: Vec<serde_json::Value> = nodes.iter().map(|n| serde_json::to_value(n).unwrap()).collect();
        serde_json::json!({ "nodes": nodes_json, "edges": edges })
    }

    /// Rebuild statistics keyed by node type, for diagnostics and tests.
    pub fn counts_by_type(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for node in self.graph.node_weights() {
            *counts.entry(node.node_type.prefix()).or_insert(0) += 1;
        }
        counts
    }

    /// Inverse of [`to_node_link_json`](Self::to_node_link_json): rebuilds a
    /// graph from a persisted snapshot. Used when resuming a run into a
    /// phase that needs Graph RAG but started in a fresh process.
    pub fn from_node_link_json(value: &serde_json::Value) -> Result<Self, String> {
        let mut graph = Self::new();
        let nodes = value.get("nodes").and_then(|v| v.as_array()).ok_or("snapshot missing nodes array")?;
        for node_value in nodes {
            let node: Node = serde_json::from_value(node_value.clone()).map_err(|e| format!("malformed node: {e}"))?;
            let idx = graph.add_node(node.id.clone(), node.node_type, node.attributes);
            if let Some(weight) = graph.graph.node_weight_mut(idx) {
                weight.pagerank = node.pagerank;
                weight.community = node.community;
            }
        }
        let edges = value.get("edges").and_then(|v| v.as_array()).ok_or("snapshot missing edges array")?;
        for edge_value in edges {
            let source = edge_value.get("source").and_then(|v| v.as_str()).ok_or("edge missing source")?;
            let target = edge_value.get("target").and_then(|v| v.as_str()).ok_or("edge missing target")?;
            let relation: EdgeRelation =
                serde_json::from_value(edge_value.get("relation").cloned().unwrap_or_default()).map_err(|e| format!("malformed relation: {e}"))?;
            let attributes = edge_value.get("attributes").cloned().unwrap_or(serde_json::Value::Null);
            graph.add_edge(source, target, relation, attributes);
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_prefixed_by_type() {
        assert_eq!(KnowledgeGraph::node_id(NodeType::Service, "auth"), "service::auth");
    }

    #[test]
    fn adding_existing_node_is_idempotent() {
        let mut graph = KnowledgeGraph::new();
        let a = graph.add_node("service::auth", NodeType::Service, serde_json::Value::Null);
        let b = graph.add_node("service::auth", NodeType::Service, serde_json::Value::Null);
        assert_eq!(a, b);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn edge_with_missing_endpoint_is_dropped_not_errored() {
        let mut graph = KnowledgeGraph::new();
        graph.add_node("service::auth", NodeType::Service, serde_json::Value::Null);
        let added = graph.add_edge("service::auth", "service::missing", EdgeRelation::ServiceCalls, serde_json::Value::Null);
        assert!(!added);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn edge_between_existing_nodes_is_added() {
        let mut graph = KnowledgeGraph::new();
        graph.add_node("service::auth", NodeType::Service, serde_json::Value::Null);
        graph.add_node("service::order", NodeType::Service, serde_json::Value::Null);
        assert!(graph.add_edge("service::auth", "service::order", EdgeRelation::ServiceCalls, serde_json::Value::Null));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn node_link_json_is_deterministic_across_rebuilds() {
        let build = || {
            let mut graph = KnowledgeGraph::new();
            graph.add_node("service::order", NodeType::Service, serde_json::Value::Null);
            graph.add_node("service::auth", NodeType::Service, serde_json::Value::Null);
            graph.add_edge("service::auth", "service::order", EdgeRelation::ServiceCalls, serde_json::Value::Null);
            graph.to_node_link_json()
        };
        assert_eq!(build(), build());
    }
}
