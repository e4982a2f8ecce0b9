//! Client-side view of the Graph RAG MCP server: the seven tools it
//! exposes, a no-op implementation for the disabled case, and a handle
//! that wraps every call so a client error never propagates past this
//! module — callers always get a usable (possibly empty) result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::graph::EdgeRelation;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NeighborhoodResult {
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String, EdgeRelation)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub node_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BoundaryViolation {
    pub source: String,
    pub target: String,
    pub reason: String,
}

/// The seven tools the Graph RAG MCP server exposes, as described by the
/// indexer's own external interface. `build_knowledge_graph` is invoked
/// by the pipeline engine directly against `GraphRagBuilder`; it is kept
/// here too since the same server process is expected to host it.
#[async_trait]
pub trait GraphRagClient: Send + Sync {
    async fn build_knowledge_graph(&self, input: serde_json::Value) -> anyhow::Result<()>;
    async fn get_service_context(&self, service_name: &str) -> anyhow::Result<String>;
    async fn query_graph_neighborhood(&self, node_id: &str, depth: u32) -> anyhow::Result<NeighborhoodResult>;
    async fn hybrid_search(&self, query: &str, semantic_weight: f64, graph_weight: f64) -> anyhow::Result<Vec<SearchHit>>;
    async fn find_cross_service_impact(&self, node_id: &str) -> anyhow::Result<Vec<String>>;
    async fn validate_service_boundaries(&self) -> anyhow::Result<Vec<BoundaryViolation>>;
    async fn check_cross_service_events(&self, event_node_id: &str) -> anyhow::Result<bool>;
}

/// Stands in for a disabled or unreachable Graph RAG server: every tool
/// succeeds with an empty/neutral result rather than erroring, so callers
/// that only check `GraphRagHandle::is_enabled()` once still behave
/// correctly if they skip that check.
pub struct NullGraphRagClient;

#[async_trait]
impl GraphRagClient for NullGraphRagClient {
    async fn build_knowledge_graph(&self, _input: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_service_context(&self, _service_name: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }

    async fn query_graph_neighborhood(&self, _node_id: &str, _depth: u32) -> anyhow::Result<NeighborhoodResult> {
        Ok(NeighborhoodResult::default())
    }

    async fn hybrid_search(&self, _query: &str, _semantic_weight: f64, _graph_weight: f64) -> anyhow::Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }

    async fn find_cross_service_impact(&self, _node_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn validate_service_boundaries(&self) -> anyhow::Result<Vec<BoundaryViolation>> {
        Ok(Vec::new())
    }

    async fn check_cross_service_events(&self, _event_node_id: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Wraps an optional `GraphRagClient` (`None` when `graph_rag.enabled` is
/// false or the server never started) so every call site gets the same
/// try-then-fall-back-to-disabled behavior without repeating it.
#[derive(Clone)]
pub struct GraphRagHandle {
    client: Option<Arc<dyn GraphRagClient>>,
}

impl GraphRagHandle {
    pub fn disabled() -> Self {
        Self { client: None }
    }

    pub fn new(client: Arc<dyn GraphRagClient>) -> Self {
        Self { client: Some(client) }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub async fn get_service_context(&self, service_name: &str) -> String {
        match &self.client {
            None => String::new(),
            Some(client) => client.get_service_context(service_name).await.unwrap_or_else(|err| {
                warn!(service_name, error = %err, "graph rag get_service_context failed, falling back to empty context");
                String::new()
            }),
        }
    }

    pub async fn query_graph_neighborhood(&self, node_id: &str, depth: u32) -> NeighborhoodResult {
        match &self.client {
            None => NeighborhoodResult::default(),
            Some(client) => client.query_graph_neighborhood(node_id, depth).await.unwrap_or_else(|err| {
                warn!(node_id, error = %err, "graph rag query_graph_neighborhood failed");
                NeighborhoodResult::default()
            }),
        }
    }

    pub async fn hybrid_search(&self, query: &str, semantic_weight: f64, graph_weight: f64) -> Vec<SearchHit> {
        match &self.client {
            None => Vec::new(),
            Some(client) => client.hybrid_search(query, semantic_weight, graph_weight).await.unwrap_or_else(|err| {
                warn!(query, error = %err, "graph rag hybrid_search failed");
                Vec::new()
            }),
        }
    }

    pub async fn find_cross_service_impact(&self, node_id: &str) -> Vec<String> {
        match &self.client {
            None => Vec::new(),
            Some(client) => client.find_cross_service_impact(node_id).await.unwrap_or_else(|err| {
                warn!(node_id, error = %err, "graph rag find_cross_service_impact failed");
                Vec::new()
            }),
        }
    }

    pub async fn validate_service_boundaries(&self) -> Vec<BoundaryViolation> {
        match &self.client {
            None => Vec::new(),
            Some(client) => client.validate_service_boundaries().await.unwrap_or_else(|err| {
                warn!(error = %err, "graph rag validate_service_boundaries failed");
                Vec::new()
            }),
        }
    }

    /// Used by Layer 4 to suppress ADV-001 (dead event handler) when a
    /// cross-service publisher exists for the event in question.
    pub async fn check_cross_service_events(&self, event_node_id: &str) -> bool {
        match &self.client {
            None => false,
            Some(client) => client.check_cross_service_events(event_node_id).await.unwrap_or_else(|err| {
                warn!(event_node_id, error = %err, "graph rag check_cross_service_events failed");
                false
            }),
        }
    }
}
