//! An in-process `GraphRagClient`: no MCP wire hop, just the in-memory
//! `KnowledgeGraph` and the on-disk vector store the build phase already
//! produced. The pipeline engine wires this in once a graph exists —
//! freshly built this run, or reloaded from the most recent snapshot row
//! on resume.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use rusqlite::Connection;

use super::client::{BoundaryViolation, GraphRagClient, NeighborhoodResult, SearchHit};
use super::context::ContextAssembler;
use super::graph::{EdgeRelation, KnowledgeGraph, NodeType};
use super::vector::{Collection, VectorStore};

/// Reloads the most recently persisted graph snapshot, if any. Used when
/// a run resumes into a Graph-RAG-dependent phase in a process that
/// never ran the build phase itself.
pub fn load_latest_snapshot(snapshots_db: &Path) -> Option<KnowledgeGraph> {
    if !snapshots_db.exists() {
        return None;
    }
    let conn = Connection::open(snapshots_db).ok()?;
    let graph_json: String = conn
        .query_row("SELECT graph_json FROM graph_rag_snapshots ORDER BY id DESC LIMIT 1", [], |row| row.get(0))
        .ok()?;
    let value: serde_json::Value = serde_json::from_str(&graph_json).ok()?;
    KnowledgeGraph::from_node_link_json(&value).ok()
}

pub struct LocalGraphRagClient {
    graph: Arc<KnowledgeGraph>,
    vector_db_path: std::path::PathBuf,
    context_token_budget: usize,
}

impl LocalGraphRagClient {
    pub fn new(graph: Arc<KnowledgeGraph>, vector_db_path: impl Into<std::path::PathBuf>, context_token_budget: usize) -> Self {
        Self {
            graph,
            vector_db_path: vector_db_path.into(),
            context_token_budget,
        }
    }

    /// Breadth-first, relation-agnostic, bounded to `depth` hops.
    fn neighborhood(&self, node_id: &str, depth: u32) -> NeighborhoodResult {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut result = NeighborhoodResult::default();
        visited.insert(node_id.to_string());
        queue.push_back((node_id.to_string(), 0u32));

        while let Some((current, current_depth)) = queue.pop_front() {
            if current_depth >= depth {
                continue;
            }
            let Some(idx) = self.graph.node_index(&current) else { continue };
            for edge_ref in self.graph.inner().edges(idx) {
                let target = &self.graph.inner()[edge_ref.target()].id;
                result.edges.push((current.clone(), target.clone(), edge_ref.weight().relation));
                if visited.insert(target.clone()) {
                    result.nodes.push(target.clone());
                    queue.push_back((target.clone(), current_depth + 1));
                }
            }
        }
        result
    }

    /// All nodes transitively reachable by following *inbound* edges from
    /// `node_id` — the set of things that would be affected by a change
    /// to the named node.
    fn transitive_dependents(&self, node_id: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(node_id.to_string());
        queue.push_back(node_id.to_string());
        let mut dependents = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(idx) = self.graph.node_index(&current) else { continue };
            for edge_ref in self.graph.inner().edges_directed(idx, petgraph::Direction::Incoming) {
                let source = &self.graph.inner()[edge_ref.source()].id;
                if visited.insert(source.clone()) {
                    dependents.push(source.clone());
                    queue.push_back(source.clone());
                }
            }
        }
        dependents
    }
}

#[async_trait]
impl GraphRagClient for LocalGraphRagClient {
    async fn build_knowledge_graph(&self, _input: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_service_context(&self, service_name: &str) -> anyhow::Result<String> {
        let node_id = KnowledgeGraph::node_id(NodeType::Service, service_name);
        Ok(ContextAssembler::assemble(&self.graph, &node_id, self.context_token_budget))
    }

    async fn query_graph_neighborhood(&self, node_id: &str, depth: u32) -> anyhow::Result<NeighborhoodResult> {
        Ok(self.neighborhood(node_id, depth))
    }

    async fn hybrid_search(&self, query: &str, semantic_weight: f64, graph_weight: f64) -> anyhow::Result<Vec<SearchHit>> {
        let store = VectorStore::open(&self.vector_db_path)?;
        let semantic_hits = store.search(Collection::NodeDescriptions, query, self.graph.node_count().max(1))?;

        let mut scored: Vec<SearchHit> = semantic_hits
            .into_iter()
            .map(|(node_id, semantic_score)| {
                let pagerank = self.graph.node(&node_id).and_then(|n| n.pagerank).unwrap_or(0.0);
                SearchHit {
                    node_id,
                    score: semantic_weight * semantic_score + graph_weight * pagerank,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.node_id.cmp(&b.node_id)));
        Ok(scored)
    }

    async fn find_cross_service_impact(&self, node_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.transitive_dependents(node_id))
    }

    async fn validate_service_boundaries(&self) -> anyhow::Result<Vec<BoundaryViolation>> {
        let mut violations = Vec::new();
        for edge_ref in self.graph.inner().edge_references() {
            let edge = edge_ref.weight();
            if edge.relation != EdgeRelation::ServiceCalls {
                continue;
            }
            let via_endpoint = edge.attributes.get("via_endpoint");
            if via_endpoint.is_none() || via_endpoint == Some(&serde_json::Value::Null) {
                let source = &self.graph.inner()[edge_ref.source()].id;
                let target = &self.graph.inner()[edge_ref.target()].id;
                violations.push(BoundaryViolation {
                    source: source.clone(),
                    target: target.clone(),
                    reason: "service-to-service call not routed through a declared endpoint contract".to_string(),
                });
            }
        }
        Ok(violations)
    }

    async fn check_cross_service_events(&self, event_node_id: &str) -> anyhow::Result<bool> {
        Ok(!self.graph.inbound(event_node_id, EdgeRelation::PublishesEvent).is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        graph.add_node("service::auth", NodeType::Service, serde_json::Value::Null);
        graph.add_node("service::order", NodeType::Service, serde_json::Value::Null);
        graph.add_node("service::billing", NodeType::Service, serde_json::Value::Null);
        graph.add_edge("service::auth", "service::order", EdgeRelation::ServiceCalls, serde_json::Value::Null);
        graph.add_edge(
            "service::order",
            "service::billing",
            EdgeRelation::ServiceCalls,
            serde_json::json!({"via_endpoint": "endpoint::billing::charge"}),
        );
        graph.add_node("event::order_placed", NodeType::Event, serde_json::Value::Null);
        graph.add_edge("service::order", "event::order_placed", EdgeRelation::PublishesEvent, serde_json::Value::Null);
        graph
    }

    #[tokio::test]
    async fn neighborhood_respects_depth() {
        let graph = Arc::new(sample_graph());
        let client = LocalGraphRagClient::new(graph, "/nonexistent/vectors.db", 2000);
        let result = client.query_graph_neighborhood("service::auth", 1).await.unwrap();
        assert!(result.nodes.contains(&"service::order".to_string()));
        assert!(!result.nodes.contains(&"service::billing".to_string()));
    }

    #[tokio::test]
    async fn cross_service_impact_is_transitive() {
        let graph = Arc::new(sample_graph());
        let client = LocalGraphRagClient::new(graph, "/nonexistent/vectors.db", 2000);
        let impact = client.find_cross_service_impact("service::billing").await.unwrap();
        assert!(impact.contains(&"service::order".to_string()));
        assert!(impact.contains(&"service::auth".to_string()));
    }

    #[tokio::test]
    async fn boundary_violation_flagged_when_via_endpoint_missing() {
        let graph = Arc::new(sample_graph());
        let client = LocalGraphRagClient::new(graph, "/nonexistent/vectors.db", 2000);
        let violations = client.validate_service_boundaries().await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].source, "service::auth");
        assert_eq!(violations[0].target, "service::order");
    }

    #[tokio::test]
    async fn cross_service_event_detected_via_publisher_edge() {
        let graph = Arc::new(sample_graph());
        let client = LocalGraphRagClient::new(graph, "/nonexistent/vectors.db", 2000);
        assert!(client.check_cross_service_events("event::order_placed").await.unwrap());
        assert!(!client.check_cross_service_events("event::unknown").await.unwrap());
    }

    #[test]
    fn snapshot_roundtrips_through_node_link_json() {
        let graph = sample_graph();
        let json = graph.to_node_link_json();
        let rebuilt = KnowledgeGraph::from_node_link_json(&json).unwrap();
        assert_eq!(rebuilt.node_count(), graph.node_count());
        assert_eq!(rebuilt.edge_count(), graph.edge_count());
    }
}
