//! Graph RAG Indexer: unifies three read-only stores into one typed
//! knowledge graph, serves vector search, and assembles per-service
//! context blocks for builders and the quality gate's scanners.

pub mod build;
pub mod client;
pub mod context;
pub mod graph;
pub mod local;
pub mod metrics;
pub mod stores;
pub mod vector;

pub use build::{BuildError, GraphRagBuilder, GraphRagInput};
pub use client::{GraphRagClient, GraphRagHandle, NullGraphRagClient};
pub use context::ContextAssembler;
pub use graph::{EdgeRelation, KnowledgeGraph, NodeType};
pub use local::{load_latest_snapshot, LocalGraphRagClient};
