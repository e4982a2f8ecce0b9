//! Builder Fleet: bounded-concurrency subprocess supervisor for the builder
//! agents that turn one service's PRD slice into source code.

pub mod builder;

pub use builder::{BuilderFleet, FleetConfig};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One entry of the Architect's service map, as consumed by the fleet.
/// The Architect is out of scope; this struct only needs to carry what the
/// fleet and builder_config.json require.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub service_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Anything else the Architect attached (endpoints, events, ...); kept
    /// opaque here and passed through verbatim to the builder.
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildDepth {
    Quick,
    Standard,
    Thorough,
}

impl Default for BuildDepth {
    fn default() -> Self {
        BuildDepth::Standard
    }
}

/// Written to `<output_dir>/builder_config.json` before each builder
/// subprocess is spawned. Empty-string fields must behave identically to
/// the field being entirely absent — this is the gating contract for
/// optional context (Graph RAG disabled, no contract yet, etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub service_name: String,
    pub depth: BuildDepth,
    pub prd_path: PathBuf,
    #[serde(default)]
    pub contract_context: String,
    #[serde(default)]
    pub graph_rag_context: String,
    #[serde(default)]
    pub codebase_context: String,
    pub output_dir: PathBuf,
    pub service_info: ServiceDefinition,
}
