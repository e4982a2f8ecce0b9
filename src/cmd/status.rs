use std::path::PathBuf;

use crate::config::RunContext;
use crate::errors::PipelineError;

use super::print_summary;

/// `forge-pipeline status`: reports the discovered run's last committed
/// state without advancing anything.
pub fn cmd_status(project_dir: PathBuf, config_path: Option<PathBuf>) -> Result<(), PipelineError> {
    let ctx = RunContext::discover(project_dir, config_path)?;
    let state = ctx.state_store().load()?;
    print_summary(&state);
    Ok(())
}
