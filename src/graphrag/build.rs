//! The 5-phase knowledge graph build pipeline: load, construct, derive
//! synthesized edges, compute metrics, persist.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::context::{ContextAssembler, DEFAULT_CONTEXT_TOKEN_BUDGET};
use super::graph::{EdgeRelation, KnowledgeGraph, Node, NodeType};
use super::metrics::{compute_louvain_communities, compute_pagerank};
use super::stores::SourceStores;
use super::vector::{Collection, VectorStore};
use crate::fleet::ServiceDefinition;

pub const DEFAULT_SHARED_UTIL_PREFIXES: &[&str] = &["shared/", "common/", "utils/", "lib/", "helpers/"];
const IMPLEMENTS_ENTITY_SUFFIXES: &[&str] = &[
    "Service", "Model", "Schema", "Entity", "Repository", "Controller", "Handler", "DTO", "Manager", "Factory",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
    Published,
    Consumed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub handler_symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSpec {
    pub name: String,
    pub direction: EventDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceInterface {
    pub service_name: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

/// Service interface data (endpoints, events) the pipeline pre-fetches
/// and hands in; the indexer never computes it itself.
#[derive(Debug, Clone, Default)]
pub struct GraphRagInput {
    pub service_interfaces: Vec<ServiceInterface>,
    pub shared_util_prefixes: Vec<String>,
}

impl GraphRagInput {
    pub fn with_defaults(service_interfaces: Vec<ServiceInterface>) -> Self {
        Self {
            service_interfaces,
            shared_util_prefixes: DEFAULT_SHARED_UTIL_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to persist graph snapshot: {0}")]
    SnapshotFailed(#[from] rusqlite::Error),
}

pub struct GraphRagBuildResult {
    pub graph: KnowledgeGraph,
    pub node_link_json: serde_json::Value,
    /// Partial-load failures from the three source stores; the build
    /// still completes with whatever loaded.
    pub errors: Vec<String>,
}

pub struct GraphRagBuilder {
    stores: Arc<dyn SourceStores>,
    vector_store: VectorStore,
    snapshots_db: std::path::PathBuf,
}

impl GraphRagBuilder {
    pub fn new(stores: Arc<dyn SourceStores>, vector_store: VectorStore, snapshots_db: impl Into<std::path::PathBuf>) -> Self {
        Self {
            stores,
            vector_store,
            snapshots_db: snapshots_db.into(),
        }
    }

    pub async fn build(&self, input: GraphRagInput) -> Result<GraphRagBuildResult, BuildError> {
        let mut errors = Vec::new();

        let symbols = self.stores.load_symbols().await.unwrap_or_else(|e| {
            errors.push(format!("symbols: {e}"));
            Vec::new()
        });
        let dependency_edges = self.stores.load_dependency_edges().await.unwrap_or_else(|e| {
            errors.push(format!("dependency_edges: {e}"));
            Vec::new()
        });
        let service_map = self.stores.load_service_map().await.unwrap_or_else(|e| {
            errors.push(format!("service_map: {e}"));
            Vec::new()
        });
        let domain_entities = self.stores.load_domain_entities().await.unwrap_or_else(|e| {
            errors.push(format!("domain_entities: {e}"));
            Vec::new()
        });
        let contracts = self.stores.load_contracts().await.unwrap_or_else(|e| {
            errors.push(format!("contracts: {e}"));
            Vec::new()
        });

        let mut graph = KnowledgeGraph::new();

        for service in &service_map {
            graph.add_node(
                KnowledgeGraph::node_id(NodeType::Service, &service.service_name),
                NodeType::Service,
                serde_json::json!({ "name": service.service_name, "description": service.description }),
            );
        }
        for entity in &domain_entities {
            let entity_id = KnowledgeGraph::node_id(NodeType::DomainEntity, &entity.id);
            graph.add_node(&entity_id, NodeType::DomainEntity, serde_json::json!({ "name": entity.name }));
            let service_id = KnowledgeGraph::node_id(NodeType::Service, &entity.owner_service);
            graph.add_edge(&service_id, &entity_id, EdgeRelation::OwnsEntity, serde_json::Value::Null);
        }

        let mut file_service: HashMap<String, String> = HashMap::new();
        for symbol in &symbols {
            let file_id = KnowledgeGraph::node_id(NodeType::File, &symbol.file_path);
            graph.add_node(&file_id, NodeType::File, serde_json::Value::Null);
            if let Some(service_name) = owning_service(&symbol.file_path, &service_map) {
                file_service.entry(symbol.file_path.clone()).or_insert_with(|| service_name.clone());
                let service_id = KnowledgeGraph::node_id(NodeType::Service, &service_name);
                graph.add_edge(&service_id, &file_id, EdgeRelation::ContainsFile, serde_json::Value::Null);
            }
        }
        for symbol in &symbols {
            let file_id = KnowledgeGraph::node_id(NodeType::File, &symbol.file_path);
            let symbol_id = KnowledgeGraph::node_id(NodeType::Symbol, &symbol.id);
            graph.add_node(&symbol_id, NodeType::Symbol, serde_json::json!({ "name": symbol.name, "kind": symbol.kind }));
            graph.add_edge(&file_id, &symbol_id, EdgeRelation::DefinesSymbol, serde_json::Value::Null);
        }

        for contract in &contracts {
            let contract_id = KnowledgeGraph::node_id(NodeType::Contract, &contract.contract_id);
            graph.add_node(&contract_id, NodeType::Contract, serde_json::Value::Null);
            let service_id = KnowledgeGraph::node_id(NodeType::Service, &contract.service_name);
            graph.add_edge(&service_id, &contract_id, EdgeRelation::ProvidesContract, serde_json::Value::Null);

            for (path, methods) in contract.openapi_paths.as_object().into_iter().flatten() {
                let Some(methods) = methods.as_object() else { continue };
                for method in methods.keys() {
                    let endpoint_id = KnowledgeGraph::node_id(NodeType::Endpoint, &format!("{}::{}", method.to_uppercase(), path));
                    graph.add_node(&endpoint_id, NodeType::Endpoint, serde_json::json!({ "method": method.to_uppercase(), "path": path }));
                    graph.add_edge(&contract_id, &endpoint_id, EdgeRelation::ExposesEndpoint, serde_json::Value::Null);
                }
            }
            for channel_name in contract.asyncapi_channels.as_object().into_iter().flatten().map(|(k, _)| k) {
                let event_id = KnowledgeGraph::node_id(NodeType::Event, channel_name);
                graph.add_node(&event_id, NodeType::Event, serde_json::Value::Null);
            }
        }

        for iface in &input.service_interfaces {
            for event in &iface.events {
                let event_id = KnowledgeGraph::node_id(NodeType::Event, &event.name);
                graph.add_node(&event_id, NodeType::Event, serde_json::Value::Null);
                let service_id = KnowledgeGraph::node_id(NodeType::Service, &iface.service_name);
                let relation = match event.direction {
                    EventDirection::Published => EdgeRelation::PublishesEvent,
                    EventDirection::Consumed => EdgeRelation::ConsumesEvent,
                };
                graph.add_edge(&service_id, &event_id, relation, serde_json::Value::Null);
            }
        }

        // ID translation: `file::symbol` (store format) -> `symbol::file::symbol`
        // (graph format). Edges with an unresolved endpoint are dropped by `add_edge`.
        for edge in &dependency_edges {
            let source_id = KnowledgeGraph::node_id(NodeType::Symbol, &edge.source);
            let target_id = KnowledgeGraph::node_id(NodeType::Symbol, &edge.target);
            graph.add_edge(&source_id, &target_id, EdgeRelation::Calls, serde_json::Value::Null);
        }

        // Phase 3: synthesized edges.
        for iface in &input.service_interfaces {
            for endpoint in &iface.endpoints {
                let Some(handler_symbol) = &endpoint.handler_symbol else { continue };
                let endpoint_id = KnowledgeGraph::node_id(NodeType::Endpoint, &format!("{}::{}", endpoint.method.to_uppercase(), endpoint.path));
                let symbol_id = KnowledgeGraph::node_id(NodeType::Symbol, handler_symbol);
                graph.add_edge(&symbol_id, &endpoint_id, EdgeRelation::HandlesEndpoint, serde_json::Value::Null);
            }
        }

        for edge in &dependency_edges {
            let source_file = file_of(&edge.source);
            let target_file = file_of(&edge.target);
            if source_file == target_file {
                continue;
            }
            if is_shared_util(source_file, &input.shared_util_prefixes) || is_shared_util(target_file, &input.shared_util_prefixes) {
                continue;
            }
            let (Some(source_service), Some(target_service)) = (file_service.get(source_file), file_service.get(target_file)) else {
                continue;
            };
            if source_service == target_service {
                continue;
            }
            let target_symbol_id = KnowledgeGraph::node_id(NodeType::Symbol, &edge.target);
            let via_endpoint = graph.outbound(&target_symbol_id, EdgeRelation::HandlesEndpoint).first().map(|n| n.id.clone());
            let source_service_id = KnowledgeGraph::node_id(NodeType::Service, source_service);
            let target_service_id = KnowledgeGraph::node_id(NodeType::Service, target_service);
            graph.add_edge(
                &source_service_id,
                &target_service_id,
                EdgeRelation::ServiceCalls,
                serde_json::json!({ "via_endpoint": via_endpoint }),
            );
        }

        for symbol in &symbols {
            if !matches!(symbol.kind.as_str(), "class" | "interface" | "type") {
                continue;
            }
            let normalized_symbol = normalize_name(&symbol.name);
            for entity in &domain_entities {
                if normalize_name(&entity.name) == normalized_symbol {
                    let symbol_id = KnowledgeGraph::node_id(NodeType::Symbol, &symbol.id);
                    let entity_id = KnowledgeGraph::node_id(NodeType::DomainEntity, &entity.id);
                    graph.add_edge(&symbol_id, &entity_id, EdgeRelation::ImplementsEntity, serde_json::Value::Null);
                }
            }
        }

        // Phase 4: metrics, stored as node attributes.
        let pagerank = compute_pagerank(&graph);
        let communities = compute_louvain_communities(&graph);
        for (index, score) in pagerank {
            if let Some(node) = graph.inner_mut().node_weight_mut(index) {
                node.pagerank = Some(score);
            }
        }
        for (index, community) in communities {
            if let Some(node) = graph.inner_mut().node_weight_mut(index) {
                node.community = Some(community);
            }
        }

        // Phase 5: persist.
        let node_link_json = graph.to_node_link_json();
        self.persist_snapshot(&node_link_json)?;
        self.rebuild_vector_collections(&graph, &service_map)?;

        Ok(GraphRagBuildResult { graph, node_link_json, errors })
    }

    fn persist_snapshot(&self, node_link_json: &serde_json::Value) -> Result<(), BuildError> {
        if let Some(parent) = self.snapshots_db.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(&self.snapshots_db)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS graph_rag_snapshots (id INTEGER PRIMARY KEY AUTOINCREMENT, created_at TEXT NOT NULL, graph_json TEXT NOT NULL)",
            [],
        )?;
        conn.execute(
            "INSERT INTO graph_rag_snapshots (created_at, graph_json) VALUES (?1, ?2)",
            params![chrono::Utc::now().to_rfc3339(), node_link_json.to_string()],
        )?;
        Ok(())
    }

    fn rebuild_vector_collections(&self, graph: &KnowledgeGraph, service_map: &[ServiceDefinition]) -> Result<(), BuildError> {
        self.vector_store.recreate_collection(Collection::NodeDescriptions).map_err(BuildError::from)?;
        let description_records: Vec<(String, String)> = graph.nodes().map(|node| (node.id.clone(), describe_node(node))).collect();
        self.vector_store
            .upsert_batch(Collection::NodeDescriptions, &description_records)
            .map_err(BuildError::from)?;

        self.vector_store.recreate_collection(Collection::ContextSummaries).map_err(BuildError::from)?;
        let summary_records: Vec<(String, String)> = service_map
            .iter()
            .map(|service| {
                let service_id = KnowledgeGraph::node_id(NodeType::Service, &service.service_name);
                let summary = ContextAssembler::assemble(graph, &service_id, DEFAULT_CONTEXT_TOKEN_BUDGET);
                (service_id, summary)
            })
            .collect();
        self.vector_store
            .upsert_batch(Collection::ContextSummaries, &summary_records)
            .map_err(BuildError::from)?;
        Ok(())
    }
}

fn file_of(dependency_ref: &str) -> &str {
    dependency_ref.rsplit_once("::").map(|(file, _)| file).unwrap_or(dependency_ref)
}

fn is_shared_util(file_path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| file_path.starts_with(prefix.as_str()))
}

fn owning_service(file_path: &str, service_map: &[ServiceDefinition]) -> Option<String> {
    service_map.iter().find(|s| file_path.starts_with(s.service_name.as_str())).map(|s| s.service_name.clone())
}

fn normalize_name(name: &str) -> String {
    let mut normalized = name.to_string();
    for suffix in IMPLEMENTS_ENTITY_SUFFIXES {
        if let Some(stripped) = normalized.strip_suffix(suffix) {
            normalized = stripped.to_string();
            break;
        }
    }
    normalized.to_lowercase()
}

fn describe_node(node: &Node) -> String {
    node.attributes.get("name").and_then(|v| v.as_str()).map(|s| s.to_string()).unwrap_or_else(|| node.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphrag::stores::{Contract, DependencyEdge, DomainEntity, InMemorySourceStores, SymbolDef};
    use tempfile::tempdir;

    fn builder_with(stores: InMemorySourceStores, dir: &std::path::Path) -> GraphRagBuilder {
        let vector_store = VectorStore::open(dir.join("vectors.db")).unwrap();
        GraphRagBuilder::new(Arc::new(stores), vector_store, dir.join("snapshots.db"))
    }

    #[tokio::test]
    async fn build_links_service_calls_across_service_boundary() {
        let dir = tempdir().unwrap();
        let stores = InMemorySourceStores {
            service_map: vec![
                ServiceDefinition { service_name: "auth".into(), description: String::new(), dependencies: Vec::new(), extra: serde_json::Value::Null },
                ServiceDefinition { service_name: "order".into(), description: String::new(), dependencies: Vec::new(), extra: serde_json::Value::Null },
            ],
            symbols: vec![
                SymbolDef { id: "auth/src/client.rs::call_order".into(), file_path: "auth/src/client.rs".into(), name: "call_order".into(), kind: "function".into() },
                SymbolDef { id: "order/src/api.rs::OrderApi".into(), file_path: "order/src/api.rs".into(), name: "OrderApi".into(), kind: "class".into() },
            ],
            dependency_edges: vec![DependencyEdge { source: "auth/src/client.rs::call_order".into(), target: "order/src/api.rs::OrderApi".into() }],
            ..Default::default()
        };
        let builder = builder_with(stores, dir.path());
        let result = builder.build(GraphRagInput::with_defaults(Vec::new())).await.unwrap();
        assert!(result.errors.is_empty());
        let auth_id = KnowledgeGraph::node_id(NodeType::Service, "auth");
        let calls = result.graph.outbound(&auth_id, EdgeRelation::ServiceCalls);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, KnowledgeGraph::node_id(NodeType::Service, "order"));
    }

    #[tokio::test]
    async fn shared_util_imports_do_not_create_service_calls_edge() {
        let dir = tempdir().unwrap();
        let stores = InMemorySourceStores {
            service_map: vec![ServiceDefinition { service_name: "auth".into(), description: String::new(), dependencies: Vec::new(), extra: serde_json::Value::Null }],
            symbols: vec![
                SymbolDef { id: "auth/src/client.rs::f".into(), file_path: "auth/src/client.rs".into(), name: "f".into(), kind: "function".into() },
                SymbolDef { id: "shared/src/util.rs::g".into(), file_path: "shared/src/util.rs".into(), name: "g".into(), kind: "function".into() },
            ],
            dependency_edges: vec![DependencyEdge { source: "auth/src/client.rs::f".into(), target: "shared/src/util.rs::g".into() }],
            ..Default::default()
        };
        let builder = builder_with(stores, dir.path());
        let result = builder.build(GraphRagInput::with_defaults(Vec::new())).await.unwrap();
        let auth_id = KnowledgeGraph::node_id(NodeType::Service, "auth");
        assert!(result.graph.outbound(&auth_id, EdgeRelation::ServiceCalls).is_empty());
    }

    #[tokio::test]
    async fn implements_entity_matches_normalized_symbol_and_entity_names() {
        let dir = tempdir().unwrap();
        let stores = InMemorySourceStores {
            service_map: vec![ServiceDefinition { service_name: "auth".into(), description: String::new(), dependencies: Vec::new(), extra: serde_json::Value::Null }],
            symbols: vec![SymbolDef { id: "auth/src/model.rs::UserModel".into(), file_path: "auth/src/model.rs".into(), name: "UserModel".into(), kind: "class".into() }],
            domain_entities: vec![DomainEntity { id: "user".into(), name: "User".into(), owner_service: "auth".into() }],
            ..Default::default()
        };
        let builder = builder_with(stores, dir.path());
        let result = builder.build(GraphRagInput::with_defaults(Vec::new())).await.unwrap();
        let symbol_id = KnowledgeGraph::node_id(NodeType::Symbol, "auth/src/model.rs::UserModel");
        let implements = result.graph.outbound(&symbol_id, EdgeRelation::ImplementsEntity);
        assert_eq!(implements.len(), 1);
    }

    #[tokio::test]
    async fn partial_store_failure_is_recorded_not_fatal() {
        let dir = tempdir().unwrap();
        let vector_store = VectorStore::open(dir.path().join("vectors.db")).unwrap();
        let stores = crate::graphrag::stores::SqliteSourceStores::new(
            dir.path().join("nope1.db"),
            dir.path().join("nope2.db"),
            dir.path().join("nope3.db"),
        );
        let builder = GraphRagBuilder::new(Arc::new(stores), vector_store, dir.path().join("snapshots.db"));
        let result = builder.build(GraphRagInput::with_defaults(Vec::new())).await.unwrap();
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn rebuild_is_byte_identical_from_identical_inputs() {
        let make_stores = || InMemorySourceStores {
            service_map: vec![ServiceDefinition { service_name: "auth".into(), description: "auth svc".into(), dependencies: Vec::new(), extra: serde_json::Value::Null }],
            contracts: vec![Contract {
                contract_id: "auth-v1".into(),
                service_name: "auth".into(),
                openapi_paths: serde_json::json!({ "/login": { "post": {} } }),
                asyncapi_channels: serde_json::Value::Null,
            }],
            ..Default::default()
        };

        let dir_a = tempdir().unwrap();
        let builder_a = builder_with(make_stores(), dir_a.path());
        let result_a = builder_a.build(GraphRagInput::with_defaults(Vec::new())).await.unwrap();

        let dir_b = tempdir().unwrap();
        let builder_b = builder_with(make_stores(), dir_b.path());
        let result_b = builder_b.build(GraphRagInput::with_defaults(Vec::new())).await.unwrap();

        assert_eq!(result_a.node_link_json, result_b.node_link_json);
    }
}
