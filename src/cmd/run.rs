use std::path::PathBuf;

use crate::config::RunContext;
use crate::engine::PipelineEngine;
use crate::errors::PipelineError;
use crate::shutdown::ShutdownCoordinator;

use super::{finish, print_summary};

/// `forge-pipeline run <prd>`: initializes a fresh run and drives it to
/// `done_success`/`done_failure` in one process. Equivalent to `init`
/// followed by `resume`, but never round-trips the initial state through
/// disk first.
pub async fn cmd_run(project_dir: PathBuf, prd_path: PathBuf, config_path: Option<PathBuf>, max_concurrent: Option<usize>) -> Result<(), PipelineError> {
    let mut ctx = RunContext::new(project_dir, prd_path, config_path)?;
    ctx.config = ctx.config.with_max_concurrent(max_concurrent);

    let shutdown = ShutdownCoordinator::new();
    shutdown.install();

    let mut engine = PipelineEngine::new(ctx, shutdown);
    let initial = engine.init()?;
    let state = engine.run_to_completion(initial).await?;
    print_summary(&state);
    finish(state).map(|_| ())
}
