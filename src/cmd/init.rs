use std::path::PathBuf;

use tracing::info;

use crate::config::RunContext;
use crate::engine::PipelineEngine;
use crate::errors::PipelineError;
use crate::shutdown::ShutdownCoordinator;

use super::print_summary;

/// `forge-pipeline init <prd>`: creates `RUN_METADATA.json` and an
/// `initialized`-phase `PIPELINE_STATE.json`, then stops. Does not run a
/// single phase — use `run` to init and drive to completion in one step.
pub fn cmd_init(project_dir: PathBuf, prd_path: PathBuf, config_path: Option<PathBuf>) -> Result<(), PipelineError> {
    let ctx = RunContext::new(project_dir, prd_path, config_path)?;
    let engine = PipelineEngine::new(ctx.clone(), ShutdownCoordinator::new());
    let state = engine.init()?;
    info!(run_id = %state.run_id, run_dir = %ctx.run_dir.display(), "initialized run");
    print_summary(&state);
    Ok(())
}
