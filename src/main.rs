use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use forge_pipeline::cmd;
use forge_pipeline::errors::PipelineError;

#[derive(Parser)]
#[command(name = "forge-pipeline")]
#[command(version, about = "Resumable multi-phase builder fleet orchestrator")]
struct Cli {
    /// Project root; defaults to the current directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Overrides the default `.forge/pipeline.toml` discovery location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new run from a PRD, without running any phase.
    Init { prd: PathBuf },
    /// Initialize a new run and drive it to completion.
    Run {
        prd: PathBuf,
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Drive the discovered run through Architect, contracts, and Graph RAG build.
    Plan,
    /// Drive the discovered run through the builder fleet.
    Build {
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Drive the discovered run through the Integration phase.
    Integrate,
    /// Drive the discovered run through the quality gate to a terminal phase.
    Verify,
    /// Continue the discovered run from its last committed phase to completion.
    Resume,
    /// Report the discovered run's last committed state.
    Status,
    /// Print an annotated `pipeline.toml` template to stdout.
    ConfigTemplate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("error: failed to get current directory: {e}");
                return ExitCode::from(1);
            }
        },
    };

    // Kept alive for the process lifetime so the non-blocking file writer
    // flushes its queue before exit; dropping it early silently truncates
    // the log.
    let _log_guard = init_logging(&project_dir);

    let result = match cli.command {
        Commands::Init { prd } => cmd::cmd_init(project_dir, prd, cli.config),
        Commands::Run { prd, max_concurrent } => cmd::cmd_run(project_dir, prd, cli.config, max_concurrent).await,
        Commands::Plan => cmd::cmd_plan(project_dir, cli.config).await,
        Commands::Build { max_concurrent } => cmd::cmd_build(project_dir, cli.config, max_concurrent).await,
        Commands::Integrate => cmd::cmd_integrate(project_dir, cli.config).await,
        Commands::Verify => cmd::cmd_verify(project_dir, cli.config).await,
        Commands::Resume => cmd::cmd_resume(project_dir, cli.config).await,
        Commands::Status => cmd::cmd_status(project_dir, cli.config),
        Commands::ConfigTemplate => cmd::cmd_config_template(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            exit_code(&e)
        }
    }
}

fn exit_code(err: &PipelineError) -> ExitCode {
    ExitCode::from(err.exit_code() as u8)
}

/// Structured logs go to both stderr (human-facing, `EnvFilter`-gated) and
/// a daily-rotating file under `<project_dir>/.forge/logs` (always at
/// `info` and above) so a run's full trace survives even when the
/// terminal scrolls past it.
fn init_logging(project_dir: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = project_dir.join(".forge/logs");
    let file_appender = tracing_appender::rolling::daily(log_dir, "pipeline.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(EnvFilter::from_default_env());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(EnvFilter::new("info"));

    tracing_subscriber::registry().with(stderr_layer).with(file_layer).init();
    guard
}
