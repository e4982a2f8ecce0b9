use std::path::PathBuf;

use crate::config::RunContext;
use crate::engine::PipelineEngine;
use crate::errors::PipelineError;
use crate::shutdown::ShutdownCoordinator;

use super::{finish, print_summary};

/// `forge-pipeline resume`: loads the last committed `PIPELINE_STATE.json`
/// for the discovered run and drives it from whatever non-terminal phase
/// it was in to completion.
pub async fn cmd_resume(project_dir: PathBuf, config_path: Option<PathBuf>) -> Result<(), PipelineError> {
    let ctx = RunContext::discover(project_dir, config_path)?;
    let shutdown = ShutdownCoordinator::new();
    shutdown.install();

    let mut engine = PipelineEngine::new(ctx, shutdown);
    let state = engine.resume().await?;
    print_summary(&state);
    finish(state).map(|_| ())
}
