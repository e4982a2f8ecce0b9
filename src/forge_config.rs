//! Layered configuration for the orchestration engine.
//!
//! Load order, each layer overriding the previous key-by-key: built-in
//! defaults -> `<project>/.forge/pipeline.toml` -> `PIPELINE_*` environment
//! variables -> CLI flags (applied by the caller via the `with_*` builders
//! after [`PipelineConfig::load`] returns). Unknown top-level keys are a
//! hard `UserError`; unknown nested keys are logged via `tracing::warn!`
//! and otherwise ignored.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::PipelineError;
use crate::fleet::BuildDepth;

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "architect",
    "builder",
    "integration",
    "quality_gate",
    "graph_rag",
    "budget_limit",
    "output_dir",
    "mode",
];

const KNOWN_ARCHITECT_KEYS: &[&str] = &["timeout", "max_retries", "auto_approve", "cmd"];
const KNOWN_BUILDER_KEYS: &[&str] = &["max_concurrent", "timeout_per_builder", "depth", "cmd"];
const KNOWN_INTEGRATION_KEYS: &[&str] = &["timeout", "cmd"];
const KNOWN_QUALITY_GATE_KEYS: &[&str] = &["max_fix_retries", "layer3_scanners", "layer4_enabled"];
const KNOWN_GRAPH_RAG_KEYS: &[&str] = &["enabled", "context_token_budget", "semantic_weight", "graph_weight"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Docker,
    Mcp,
    Auto,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Auto
    }
}

impl std::str::FromStr for RunMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(RunMode::Docker),
            "mcp" => Ok(RunMode::Mcp),
            "auto" => Ok(RunMode::Auto),
            other => Err(PipelineError::UserError(format!("invalid mode '{other}', expected docker|mcp|auto"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectConfig {
    pub timeout: u64,
    pub max_retries: u32,
    pub auto_approve: bool,
    /// Argv of the external Architect process. The run directory and
    /// `--output <path>` are appended by the caller.
    pub cmd: Vec<String>,
}

impl Default for ArchitectConfig {
    fn default() -> Self {
        Self {
            timeout: 600,
            max_retries: 2,
            auto_approve: false,
            cmd: vec!["forge-architect".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    pub max_concurrent: usize,
    pub timeout_per_builder: u64,
    pub depth: BuildDepth,
    /// Argv of the per-service builder agent process.
    pub cmd: Vec<String>,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            timeout_per_builder: 1800,
            depth: BuildDepth::Standard,
            cmd: vec!["forge-builder".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub timeout: u64,
    /// Argv of the external Integration process.
    pub cmd: Vec<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            timeout: 300,
            cmd: vec!["forge-integrate".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGateSettings {
    pub max_fix_retries: u32,
    pub layer3_scanners: Vec<String>,
    pub layer4_enabled: bool,
}

impl Default for QualityGateSettings {
    fn default() -> Self {
        Self {
            max_fix_retries: 3,
            layer3_scanners: vec!["secrets".to_string(), "health".to_string()],
            layer4_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphRagSettings {
    pub enabled: bool,
    pub context_token_budget: usize,
    pub semantic_weight: f64,
    pub graph_weight: f64,
}

impl Default for GraphRagSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            context_token_budget: crate::graphrag::context::DEFAULT_CONTEXT_TOKEN_BUDGET,
            semantic_weight: 0.5,
            graph_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub architect: ArchitectConfig,
    pub builder: BuilderSettings,
    pub integration: IntegrationConfig,
    pub quality_gate: QualityGateSettings,
    pub graph_rag: GraphRagSettings,
    pub budget_limit: Option<Decimal>,
    pub output_dir: PathBuf,
    pub mode: RunMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            architect: ArchitectConfig::default(),
            builder: BuilderSettings::default(),
            integration: IntegrationConfig::default(),
            quality_gate: QualityGateSettings::default(),
            graph_rag: GraphRagSettings::default(),
            budget_limit: None,
            output_dir: PathBuf::from("./forge-run"),
            mode: RunMode::Auto,
        }
    }
}

impl PipelineConfig {
    /// Loads defaults, then a config file if present, then `PIPELINE_*`
    /// environment variable overrides. `config_path` overrides the default
    /// `<project_dir>/.forge/pipeline.toml` discovery location.
    pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<Self, PipelineError> {
        let path = config_path.map(PathBuf::from).unwrap_or_else(|| project_dir.join(".forge/pipeline.toml"));
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| PipelineError::StoreIOError { path: path.clone(), source })?;
            Self::parse(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parses and validates a `pipeline.toml` document. Rejects unknown
    /// top-level keys; warns and ignores unknown nested keys.
    pub fn parse(content: &str) -> Result<Self, PipelineError> {
        let value: toml::Value = toml::from_str(content).map_err(|e| PipelineError::UserError(format!("invalid config syntax: {e}")))?;
        let table = value.as_table().ok_or_else(|| PipelineError::UserError("config root must be a table".into()))?;

        for key in table.keys() {
            if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
                return Err(PipelineError::UserError(format!("unknown configuration key '{key}'")));
            }
        }

        warn_unknown_nested(table, "architect", KNOWN_ARCHITECT_KEYS);
        warn_unknown_nested(table, "builder", KNOWN_BUILDER_KEYS);
        warn_unknown_nested(table, "integration", KNOWN_INTEGRATION_KEYS);
        warn_unknown_nested(table, "quality_gate", KNOWN_QUALITY_GATE_KEYS);
        warn_unknown_nested(table, "graph_rag", KNOWN_GRAPH_RAG_KEYS);

        toml::from_str(content).map_err(|e| PipelineError::UserError(format!("invalid config: {e}")))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PIPELINE_BUDGET_LIMIT") {
            match v.parse::<Decimal>() {
                Ok(limit) => self.budget_limit = Some(limit),
                Err(e) => warn!(value = %v, error = %e, "ignoring malformed PIPELINE_BUDGET_LIMIT"),
            }
        }
        if let Ok(v) = std::env::var("PIPELINE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PIPELINE_MODE") {
            match v.parse::<RunMode>() {
                Ok(mode) => self.mode = mode,
                Err(e) => warn!(value = %v, error = %e, "ignoring malformed PIPELINE_MODE"),
            }
        }
        if let Ok(v) = std::env::var("PIPELINE_BUILDER_MAX_CONCURRENT") {
            match v.parse::<usize>() {
                Ok(n) => self.builder.max_concurrent = n,
                Err(e) => warn!(value = %v, error = %e, "ignoring malformed PIPELINE_BUILDER_MAX_CONCURRENT"),
            }
        }
        if let Ok(v) = std::env::var("PIPELINE_GRAPH_RAG_ENABLED") {
            match v.parse::<bool>() {
                Ok(enabled) => self.graph_rag.enabled = enabled,
                Err(e) => warn!(value = %v, error = %e, "ignoring malformed PIPELINE_GRAPH_RAG_ENABLED"),
            }
        }
        if let Ok(v) = std::env::var("PIPELINE_BUILDER_CMD") {
            self.builder.cmd = split_cmd(&v);
        }
        if let Ok(v) = std::env::var("PIPELINE_ARCHITECT_CMD") {
            self.architect.cmd = split_cmd(&v);
        }
        if let Ok(v) = std::env::var("PIPELINE_INTEGRATION_CMD") {
            self.integration.cmd = split_cmd(&v);
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: Option<usize>) -> Self {
        if let Some(n) = max_concurrent {
            self.builder.max_concurrent = n;
        }
        self
    }

    pub fn with_output_dir(mut self, output_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = output_dir {
            self.output_dir = dir;
        }
        self
    }

    pub fn render_template() -> String {
        template_yaml()
    }
}

/// Splits a `PIPELINE_*_CMD` override on whitespace into argv. Used by
/// tests to substitute a fake external process for the real Architect,
/// Builder, or Integration collaborator.
fn split_cmd(v: &str) -> Vec<String> {
    v.split_whitespace().map(str::to_string).collect()
}

fn warn_unknown_nested(table: &toml::value::Table, section: &str, known_keys: &[&str]) {
    let Some(toml::Value::Table(nested)) = table.get(section) else {
        return;
    };
    for key in nested.keys() {
        if !known_keys.contains(&key.as_str()) {
            warn!(section, key, "ignoring unknown nested configuration key");
        }
    }
}

fn template_yaml() -> String {
    r#"# Forge pipeline configuration template.
# Every key below is recognized; remove a section to accept its defaults.

architect:
  timeout: 600          # seconds
  max_retries: 2
  auto_approve: false   # skip human review of the architect's service map
  cmd: [forge-architect]

builder:
  max_concurrent: 3       # builder fleet semaphore size
  timeout_per_builder: 1800  # seconds, wall clock
  depth: standard          # quick | standard | thorough
  cmd: [forge-builder]

integration:
  timeout: 300           # seconds
  cmd: [forge-integrate]

quality_gate:
  max_fix_retries: 3
  layer3_scanners: [secrets, health]
  layer4_enabled: true   # adversarial layer is advisory-only, never blocking

graph_rag:
  enabled: true
  context_token_budget: 2000
  semantic_weight: 0.5
  graph_weight: 0.5      # semantic_weight + graph_weight should not exceed 1

budget_limit: null       # USD spend cap, or null for no limit
output_dir: ./forge-run
mode: auto               # docker | mcp | auto
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_spec_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.builder.max_concurrent, 3);
        assert_eq!(config.builder.timeout_per_builder, 1800);
        assert_eq!(config.quality_gate.max_fix_retries, 3);
        assert!(config.budget_limit.is_none());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let err = PipelineConfig::parse("bogus_key = 1\n").unwrap_err();
        assert!(matches!(err, PipelineError::UserError(_)));
    }

    #[test]
    fn unknown_nested_key_is_ignored_not_rejected() {
        let config = PipelineConfig::parse("[builder]\nmax_concurrent = 5\nbogus_nested = true\n").unwrap();
        assert_eq!(config.builder.max_concurrent, 5);
    }

    #[test]
    fn partial_section_fills_remaining_fields_from_defaults() {
        let config = PipelineConfig::parse("[builder]\nmax_concurrent = 7\n").unwrap();
        assert_eq!(config.builder.max_concurrent, 7);
        assert_eq!(config.builder.timeout_per_builder, 1800);
    }

    #[test]
    fn load_without_config_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::load(dir.path(), None).unwrap();
        assert_eq!(config.builder.max_concurrent, 3);
    }

    #[test]
    fn load_reads_config_file_when_present() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".forge")).unwrap();
        fs::write(dir.path().join(".forge/pipeline.toml"), "budget_limit = \"12.50\"\n").unwrap();
        let config = PipelineConfig::load(dir.path(), None).unwrap();
        assert_eq!(config.budget_limit, Some(Decimal::new(1250, 2)));
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".forge")).unwrap();
        fs::write(dir.path().join(".forge/pipeline.toml"), "[builder]\nmax_concurrent = 3\n").unwrap();
        // SAFETY: test is single-threaded w.r.t. this env var and restores it.
        unsafe { std::env::set_var("PIPELINE_BUILDER_MAX_CONCURRENT", "9") };
        let config = PipelineConfig::load(dir.path(), None).unwrap();
        unsafe { std::env::remove_var("PIPELINE_BUILDER_MAX_CONCURRENT") };
        assert_eq!(config.builder.max_concurrent, 9);
    }

    #[test]
    fn cli_override_wins_over_everything() {
        let config = PipelineConfig::default().with_max_concurrent(Some(11));
        assert_eq!(config.builder.max_concurrent, 11);
    }

    #[test]
    fn builder_cmd_override_splits_on_whitespace() {
        unsafe { std::env::set_var("PIPELINE_BUILDER_CMD", "echo fake-builder") };
        let config = PipelineConfig::load(tempdir().unwrap().path(), None).unwrap();
        unsafe { std::env::remove_var("PIPELINE_BUILDER_CMD") };
        assert_eq!(config.builder.cmd, vec!["echo".to_string(), "fake-builder".to_string()]);
    }

    #[test]
    fn mode_parses_all_three_variants() {
        assert_eq!("docker".parse::<RunMode>().unwrap(), RunMode::Docker);
        assert_eq!("mcp".parse::<RunMode>().unwrap(), RunMode::Mcp);
        assert_eq!("auto".parse::<RunMode>().unwrap(), RunMode::Auto);
        assert!("bogus".parse::<RunMode>().is_err());
    }

    #[test]
    fn template_mentions_every_top_level_key() {
        let template = PipelineConfig::render_template();
        for key in KNOWN_TOP_LEVEL_KEYS {
            assert!(template.contains(key), "template missing {key}");
        }
    }
}
