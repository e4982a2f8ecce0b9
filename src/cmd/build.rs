use std::path::PathBuf;

use crate::config::RunContext;
use crate::engine::PipelineEngine;
use crate::errors::PipelineError;
use crate::phase::Phase;
use crate::shutdown::ShutdownCoordinator;

use super::print_summary;

/// `forge-pipeline build [--max-concurrent N]`: drives the discovered run
/// through the builder fleet phase and stops at `builders_complete`,
/// without running integration or the quality gate.
pub async fn cmd_build(project_dir: PathBuf, config_path: Option<PathBuf>, max_concurrent: Option<usize>) -> Result<(), PipelineError> {
    let mut ctx = RunContext::discover(project_dir, config_path)?;
    ctx.config = ctx.config.with_max_concurrent(max_concurrent);
    let state = ctx.state_store().load()?;
    let shutdown = ShutdownCoordinator::new();
    shutdown.install();

    let mut engine = PipelineEngine::new(ctx, shutdown);
    let state = engine.run_until(state, Phase::BuildersComplete).await?;
    print_summary(&state);
    Ok(())
}
