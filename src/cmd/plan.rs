use std::path::PathBuf;

use crate::config::RunContext;
use crate::engine::PipelineEngine;
use crate::errors::PipelineError;
use crate::phase::Phase;
use crate::shutdown::ShutdownCoordinator;

use super::print_summary;

/// `forge-pipeline plan`: drives the discovered run through the Architect,
/// contract registration, and Graph RAG build phases, then stops at
/// `graph_rag_ready` without starting the builder fleet.
pub async fn cmd_plan(project_dir: PathBuf, config_path: Option<PathBuf>) -> Result<(), PipelineError> {
    let ctx = RunContext::discover(project_dir, config_path)?;
    let state = ctx.state_store().load()?;
    let shutdown = ShutdownCoordinator::new();
    shutdown.install();

    let mut engine = PipelineEngine::new(ctx, shutdown);
    let state = engine.run_until(state, Phase::GraphRagReady).await?;
    print_summary(&state);
    Ok(())
}
