//! The Architect and Integration phases are external collaborators: this
//! crate only knows their subprocess contract (an input JSON blob in, an
//! artifact JSON file out), never their internals. Both phases reuse the
//! same spawn/poll/escalate shape as the builder fleet.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::shutdown::ShutdownCoordinator;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ExternalStepConfig {
    /// Argv; `cmd[0]` is the program, the rest are fixed leading args.
    /// `--input <path> --output <path>` are appended by the caller.
    pub cmd: Vec<String>,
    pub timeout: Duration,
    pub grace_period: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ExternalStepError {
    #[error("failed to write input for {step}: {source}")]
    WriteInput { step: String, source: std::io::Error },
    #[error("failed to spawn {step}: {source}")]
    Spawn { step: String, source: std::io::Error },
    #[error("shutdown requested during {step}")]
    Shutdown { step: String },
    #[error("{step} exceeded its timeout")]
    TimedOut { step: String },
    #[error("{step} exited with code {code:?}")]
    NonZeroExit { step: String, code: Option<i32> },
    #[error("{step} exited successfully but did not write {artifact_path}", artifact_path = artifact_path.display())]
    MissingArtifact { step: String, artifact_path: PathBuf },
}

/// Runs one external-collaborator step to completion: writes `input` to
/// `<run_dir>/<step>_input.json`, spawns `config.cmd` with `--input` and
/// `--output` appended, polls every 500ms for exit, shutdown, or timeout,
/// and on success requires `artifact_path` to exist.
pub async fn run_external_step(
    step: &str,
    config: &ExternalStepConfig,
    input: &serde_json::Value,
    run_dir: &Path,
    artifact_path: &Path,
    shutdown: &ShutdownCoordinator,
) -> Result<(), ExternalStepError> {
    let input_path = run_dir.join(format!("{step}_input.json"));
    let bytes = serde_json::to_vec_pretty(input).unwrap_or_default();
    tokio::fs::write(&input_path, bytes).await.map_err(|source| ExternalStepError::WriteInput {
        step: step.to_string(),
        source,
    })?;

    let started = tokio::time::Instant::now();
    let mut child = spawn(config, &input_path, artifact_path, run_dir).map_err(|source| ExternalStepError::Spawn {
        step: step.to_string(),
        source,
    })?;

    let log_path = run_dir.join(format!("{step}.log"));
    if let Err(e) = stream_output(&mut child, &log_path).await {
        warn!(step, "failed to capture output: {e}");
    }

    loop {
        if let Some(status) = child.try_wait().unwrap_or(None) {
            return match status.code() {
                Some(0) if artifact_path.exists() => Ok(()),
                Some(0) => Err(ExternalStepError::MissingArtifact {
                    step: step.to_string(),
                    artifact_path: artifact_path.to_path_buf(),
                }),
                code => Err(ExternalStepError::NonZeroExit { step: step.to_string(), code }),
            };
        }

        if shutdown.should_stop() {
            info!(step, "shutdown requested, cancelling external step");
            escalate_stop(&mut child, config.grace_period).await;
            return Err(ExternalStepError::Shutdown { step: step.to_string() });
        }

        if started.elapsed() >= config.timeout {
            warn!(step, "exceeded timeout, terminating");
            escalate_stop(&mut child, config.grace_period).await;
            return Err(ExternalStepError::TimedOut { step: step.to_string() });
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn spawn(config: &ExternalStepConfig, input_path: &Path, artifact_path: &Path, run_dir: &Path) -> std::io::Result<Child> {
    let (program, leading_args) = config.cmd.split_first().expect("cmd must have at least one element");
    Command::new(program)
        .args(leading_args)
        .arg("--input")
        .arg(input_path)
        .arg("--output")
        .arg(artifact_path)
        .current_dir(run_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

async fn stream_output(child: &mut Child, log_path: &Path) -> std::io::Result<()> {
    let mut log_file = File::create(log_path).await?;
    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.ok();
        log_file.write_all(&buf).await?;
    }
    if let Some(mut stderr) = child.stderr.take() {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await.ok();
        log_file.write_all(&buf).await?;
    }
    Ok(())
}

async fn escalate_stop(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        send_signal(pid, libc::SIGTERM);
    }
    let waited = tokio::time::timeout(grace, child.wait()).await;
    if waited.is_err() {
        if let Some(pid) = child.id() {
            send_signal(pid, libc::SIGKILL);
        }
        let _ = child.wait().await;
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(cmd: Vec<&str>) -> ExternalStepConfig {
        ExternalStepConfig {
            cmd: cmd.into_iter().map(str::to_string).collect(),
            timeout: Duration::from_secs(5),
            grace_period: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn successful_step_requires_artifact_to_exist() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("architect_output.json");
        // `true` exits 0 but never writes the artifact.
        let err = run_external_step("architect", &config(vec!["true"]), &serde_json::json!({}), dir.path(), &artifact, &ShutdownCoordinator::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalStepError::MissingArtifact { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("architect_output.json");
        let err = run_external_step("architect", &config(vec!["false"]), &serde_json::json!({}), dir.path(), &artifact, &ShutdownCoordinator::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalStepError::NonZeroExit { .. }));
    }

    #[tokio::test]
    async fn input_json_is_written_before_spawn() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("architect_output.json");
        let _ = run_external_step(
            "architect",
            &config(vec!["false"]),
            &serde_json::json!({"prd_path": "prd.md"}),
            dir.path(),
            &artifact,
            &ShutdownCoordinator::new(),
        )
        .await;
        let content = std::fs::read_to_string(dir.path().join("architect_input.json")).unwrap();
        assert!(content.contains("prd.md"));
    }
}
