//! CLI command implementations.
//!
//! Each submodule owns one subcommand and is a thin wrapper around
//! [`crate::config::RunContext`] and [`crate::engine::PipelineEngine`] —
//! argument parsing lives entirely in `main.rs`, these just do the work.

pub mod build;
pub mod config_template;
pub mod init;
pub mod integrate;
pub mod plan;
pub mod resume;
pub mod run;
pub mod status;
pub mod verify;

pub use build::cmd_build;
pub use config_template::cmd_config_template;
pub use init::cmd_init;
pub use integrate::cmd_integrate;
pub use plan::cmd_plan;
pub use resume::cmd_resume;
pub use run::cmd_run;
pub use status::cmd_status;
pub use verify::cmd_verify;

use console::style;

use crate::errors::PipelineError;
use crate::phase::{BuilderStatus, Phase, PipelineState};

/// Shared epilogue for every command that drives the engine: a
/// `done_failure` terminal phase always surfaces as a hard error so the
/// process exits non-zero, everything else is success from the CLI's
/// point of view even if the run isn't finished yet (`plan`/`build`/
/// `integrate` stop partway through by design).
pub(crate) fn finish(state: PipelineState) -> Result<PipelineState, PipelineError> {
    if state.phase == Phase::DoneFailure {
        return Err(PipelineError::QualityGateFailure { fix_attempts: state.fix_attempts });
    }
    Ok(state)
}

pub(crate) fn print_summary(state: &PipelineState) {
    println!("phase:        {}", style_phase(state.phase));
    println!("run_id:       {}", state.run_id);
    println!("total_cost:   {}", state.total_cost);
    if state.fix_attempts > 0 {
        println!("fix_attempts: {}", state.fix_attempts);
    }
    if !state.builder_results.is_empty() {
        println!("builders:");
        let mut names: Vec<&String> = state.builder_results.keys().collect();
        names.sort();
        for name in names {
            let result = &state.builder_results[name];
            println!("  {:<20} {}", name, style_builder_status(result.status));
        }
    }
}

fn style_phase(phase: Phase) -> console::StyledObject<Phase> {
    if phase == Phase::DoneSuccess {
        style(phase).green()
    } else if phase == Phase::DoneFailure {
        style(phase).red()
    } else {
        style(phase).yellow()
    }
}

fn style_builder_status(status: BuilderStatus) -> console::StyledObject<BuilderStatus> {
    match status {
        BuilderStatus::Succeeded => style(status).green(),
        BuilderStatus::Failed | BuilderStatus::Timeout => style(status).red(),
        BuilderStatus::Pending | BuilderStatus::Running => style(status).yellow(),
    }
}
