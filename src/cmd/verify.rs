use std::path::PathBuf;

use crate::config::RunContext;
use crate::engine::PipelineEngine;
use crate::errors::PipelineError;
use crate::phase::Phase;
use crate::shutdown::ShutdownCoordinator;

use super::{finish, print_summary};

/// `forge-pipeline verify`: drives the discovered run through the quality
/// gate, including any fix-and-regate loop, to a terminal phase.
pub async fn cmd_verify(project_dir: PathBuf, config_path: Option<PathBuf>) -> Result<(), PipelineError> {
    let ctx = RunContext::discover(project_dir, config_path)?;
    let state = ctx.state_store().load()?;
    let shutdown = ShutdownCoordinator::new();
    shutdown.install();

    let mut engine = PipelineEngine::new(ctx, shutdown);
    let state = engine.run_until(state, Phase::DoneSuccess).await?;
    print_summary(&state);
    finish(state).map(|_| ())
}
