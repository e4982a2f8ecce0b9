use std::path::PathBuf;

use crate::config::RunContext;
use crate::engine::PipelineEngine;
use crate::errors::PipelineError;
use crate::phase::Phase;
use crate::shutdown::ShutdownCoordinator;

use super::print_summary;

/// `forge-pipeline integrate`: drives the discovered run through the
/// Integration phase and stops at `integration_complete`, without running
/// the quality gate.
pub async fn cmd_integrate(project_dir: PathBuf, config_path: Option<PathBuf>) -> Result<(), PipelineError> {
    let ctx = RunContext::discover(project_dir, config_path)?;
    let state = ctx.state_store().load()?;
    let shutdown = ShutdownCoordinator::new();
    shutdown.install();

    let mut engine = PipelineEngine::new(ctx, shutdown);
    let state = engine.run_until(state, Phase::IntegrationComplete).await?;
    print_summary(&state);
    Ok(())
}
