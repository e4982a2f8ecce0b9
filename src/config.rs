//! Resolves the on-disk layout for one pipeline run and loads its config.

use std::path::{Path, PathBuf};

use crate::errors::PipelineError;
use crate::forge_config::PipelineConfig;
use crate::state::StateStore;

/// Everything a CLI command needs to operate on one run: where the PRD
/// lives, where the run directory is, and the loaded layered config.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub project_dir: PathBuf,
    pub prd_path: PathBuf,
    pub run_dir: PathBuf,
    pub config: PipelineConfig,
}

impl RunContext {
    /// `config_path` overrides the default `.forge/pipeline.toml`
    /// discovery location (the CLI's `--config FILE`).
    pub fn new(project_dir: PathBuf, prd_path: PathBuf, config_path: Option<PathBuf>) -> Result<Self, PipelineError> {
        if !prd_path.exists() {
            return Err(PipelineError::UserError(format!("PRD file not found: {}", prd_path.display())));
        }
        let config = PipelineConfig::load(&project_dir, config_path.as_deref())?;
        let run_dir = if config.output_dir.is_absolute() {
            config.output_dir.clone()
        } else {
            project_dir.join(&config.output_dir)
        };
        Ok(Self {
            project_dir,
            prd_path,
            run_dir,
            config,
        })
    }

    /// Discovers an existing run for commands that take no `<prd>`
    /// argument (`plan`, `build`, `integrate`, `verify`, `resume`,
    /// `status`). The PRD path is recovered from `RUN_METADATA.json`
    /// rather than supplied on the command line.
    pub fn discover(project_dir: PathBuf, config_path: Option<PathBuf>) -> Result<Self, PipelineError> {
        let config = PipelineConfig::load(&project_dir, config_path.as_deref())?;
        let run_dir = if config.output_dir.is_absolute() {
            config.output_dir.clone()
        } else {
            project_dir.join(&config.output_dir)
        };
        let metadata_path = run_dir.join("RUN_METADATA.json");
        if !metadata_path.exists() {
            return Err(PipelineError::UserError(format!(
                "no run found at {} — run `forge init <prd>` first",
                run_dir.display()
            )));
        }
        let metadata = RunMetadata::read(&metadata_path)?;
        Ok(Self {
            project_dir,
            prd_path: metadata.prd_path,
            run_dir,
            config,
        })
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(&self.run_dir)
    }

    pub fn ensure_run_dir(&self) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.run_dir).map_err(|source| PipelineError::StoreIOError {
            path: self.run_dir.clone(),
            source,
        })
    }

    pub fn service_dir(&self, service_name: &str) -> PathBuf {
        self.run_dir.join(service_name)
    }

    pub fn run_metadata_path(&self) -> PathBuf {
        self.run_dir.join("RUN_METADATA.json")
    }
}

/// Persisted once at `init`, never mutated — a cheap existence check for
/// `status`/`resume` independent of parsing the full state file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub prd_path: PathBuf,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub forge_version: String,
}

impl RunMetadata {
    pub fn new(run_id: impl Into<String>, prd_path: PathBuf) -> Self {
        Self {
            run_id: run_id.into(),
            prd_path,
            created_at: chrono::Utc::now(),
            forge_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| PipelineError::Other(anyhow::anyhow!("failed to serialize run metadata: {e}")))?;
        std::fs::write(path, json).map_err(|source| PipelineError::StoreIOError {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|source| PipelineError::StoreIOError {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| PipelineError::Other(anyhow::anyhow!("corrupt run metadata {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_prd(dir: &Path) -> PathBuf {
        let path = dir.join("prd.md");
        std::fs::write(&path, "# PRD").unwrap();
        path
    }

    #[test]
    fn missing_prd_is_a_user_error() {
        let dir = tempdir().unwrap();
        let err = RunContext::new(dir.path().to_path_buf(), dir.path().join("nope.md"), None).unwrap_err();
        assert!(matches!(err, PipelineError::UserError(_)));
    }

    #[test]
    fn run_dir_defaults_relative_to_project_dir() {
        let dir = tempdir().unwrap();
        let prd = write_prd(dir.path());
        let ctx = RunContext::new(dir.path().to_path_buf(), prd, None).unwrap();
        assert_eq!(ctx.run_dir, dir.path().join("forge-run"));
    }

    #[test]
    fn run_metadata_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("RUN_METADATA.json");
        let meta = RunMetadata::new("run-1", PathBuf::from("prd.md"));
        meta.write(&path).unwrap();
        let loaded = RunMetadata::read(&path).unwrap();
        assert_eq!(loaded.run_id, "run-1");
    }
}
