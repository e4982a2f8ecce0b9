//! The fleet's scheduling loop: one bounded semaphore, one subprocess per
//! service, cooperative cancellation on every poll.

use super::{BuildDepth, BuilderConfig, ServiceDefinition};
use crate::phase::{BuilderResult, BuilderStatus};
use crate::shutdown::ShutdownCoordinator;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Semaphore size; `1` yields fully serial builder execution.
    pub max_concurrent: usize,
    pub timeout_per_builder: Duration,
    pub grace_period: Duration,
    /// Argv for the builder subprocess: `builder_cmd[0]` is the program,
    /// the rest are fixed leading args. The fleet appends
    /// `--config <builder_config.json>` itself.
    pub builder_cmd: Vec<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            timeout_per_builder: Duration::from_secs(1800),
            grace_period: Duration::from_secs(10),
            builder_cmd: vec!["true".to_string()],
        }
    }
}

pub struct BuilderFleet {
    config: FleetConfig,
}

impl BuilderFleet {
    pub fn new(config: FleetConfig) -> Self {
        Self { config }
    }

    /// Single entry point per pipeline phase. Failure of one builder never
    /// aborts the others; the returned map always has one entry per input
    /// service.
    pub async fn run(
        &self,
        services: &[ServiceDefinition],
        prd_path: &std::path::Path,
        run_dir: &std::path::Path,
        graph_rag_contexts: &HashMap<String, String>,
        fix_instructions: &HashMap<String, String>,
        depth: BuildDepth,
        shutdown: ShutdownCoordinator,
    ) -> HashMap<String, BuilderResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut handles = Vec::with_capacity(services.len());

        for service in services {
            let semaphore = semaphore.clone();
            let shutdown = shutdown.clone();
            let config = self.config.clone();
            let service = service.clone();
            let prd_path = prd_path.to_path_buf();
            let output_dir = run_dir.join(&service.service_name);
            let graph_rag_context = graph_rag_contexts
                .get(&service.service_name)
                .cloned()
                .unwrap_or_default();
            let fix_instructions = fix_instructions.get(&service.service_name).cloned();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let name = service.service_name.clone();
                let result = run_one_builder(
                    service,
                    depth,
                    &prd_path,
                    &output_dir,
                    &graph_rag_context,
                    fix_instructions.as_deref(),
                    &config,
                    &shutdown,
                )
                .await;
                (name, result)
            }));
        }

        let mut results = HashMap::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((name, result)) => {
                    results.insert(name, result);
                }
                Err(join_err) => {
                    warn!("builder task panicked: {join_err}");
                }
            }
        }
        results
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_builder(
    service: ServiceDefinition,
    depth: BuildDepth,
    prd_path: &std::path::Path,
    output_dir: &std::path::Path,
    graph_rag_context: &str,
    fix_instructions: Option<&str>,
    config: &FleetConfig,
    shutdown: &ShutdownCoordinator,
) -> BuilderResult {
    let service_name = service.service_name.clone();

    if let Err(e) = tokio::fs::create_dir_all(output_dir).await {
        return failed(service_name, output_dir, format!("failed to create output dir: {e}"));
    }

    let builder_config = BuilderConfig {
        service_name: service_name.clone(),
        depth,
        prd_path: prd_path.to_path_buf(),
        contract_context: String::new(),
        graph_rag_context: graph_rag_context.to_string(),
        codebase_context: String::new(),
        output_dir: output_dir.to_path_buf(),
        service_info: service,
    };

    let config_path = output_dir.join("builder_config.json");
    match serde_json::to_vec_pretty(&builder_config) {
        Ok(bytes) => {
            if let Err(e) = tokio::fs::write(&config_path, bytes).await {
                return failed(service_name, output_dir, format!("failed to write builder_config.json: {e}"));
            }
        }
        Err(e) => return failed(service_name, output_dir, format!("failed to serialize builder_config.json: {e}")),
    }

    if let Some(instructions) = fix_instructions {
        let path = output_dir.join("FIX_INSTRUCTIONS.md");
        if let Err(e) = tokio::fs::write(&path, instructions).await {
            warn!("failed to write FIX_INSTRUCTIONS.md for {service_name}: {e}");
        }
    }

    let started = tokio::time::Instant::now();
    let mut child = match spawn_builder(config, &config_path, output_dir) {
        Ok(child) => child,
        Err(e) => return failed(service_name, output_dir, format!("failed to spawn builder: {e}")),
    };

    let log_path = output_dir.join("builder.log");
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut log_task = tokio::spawn(stream_output(stdout, stderr, log_path));

    loop {
        if let Some(status) = child.try_wait().unwrap_or(None) {
            join_log_task(&mut log_task, &service_name).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            return finish(service_name, output_dir, status.code(), duration_ms);
        }

        if shutdown.should_stop() {
            info!("shutdown requested, cancelling builder {service_name}");
            escalate_stop(&mut child, config.grace_period).await;
            log_task.abort();
            let duration_ms = started.elapsed().as_millis() as u64;
            return cancelled(service_name, output_dir, duration_ms);
        }

        if started.elapsed() >= config.timeout_per_builder {
            warn!("builder {service_name} exceeded timeout, terminating");
            escalate_stop(&mut child, config.grace_period).await;
            log_task.abort();
            let duration_ms = started.elapsed().as_millis() as u64;
            return timed_out(service_name, output_dir, duration_ms);
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn spawn_builder(
    config: &FleetConfig,
    config_path: &std::path::Path,
    output_dir: &std::path::Path,
) -> std::io::Result<Child> {
    let (program, leading_args) = config
        .builder_cmd
        .split_first()
        .expect("builder_cmd must have at least one element");

    Command::new(program)
        .args(leading_args)
        .arg("--config")
        .arg(config_path)
        .current_dir(output_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Drains stdout/stderr into `log_path`, run as its own task so it proceeds
/// concurrently with the poll loop's `shutdown.should_stop()`/timeout
/// checks rather than blocking them until the child exits.
async fn stream_output(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    log_path: PathBuf,
) -> std::io::Result<()> {
    let mut log_file = File::create(&log_path).await?;

    if let Some(mut stdout) = stdout {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.ok();
        log_file.write_all(&buf).await?;
    }
    if let Some(mut stderr) = stderr {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await.ok();
        log_file.write_all(&buf).await?;
    }
    Ok(())
}

/// Awaits the log-drain task once the child has already exited, so its
/// output is fully flushed to `builder.log` before the result is reported.
async fn join_log_task(log_task: &mut tokio::task::JoinHandle<std::io::Result<()>>, service_name: &str) {
    match log_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failed to capture builder output for {service_name}: {e}"),
        Err(join_err) => warn!("log-drain task for {service_name} panicked: {join_err}"),
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. `kill_on_drop` on the `Command`
/// is the last-resort backstop if this task itself is aborted mid-escalation.
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

fn failed(service_name: String, output_dir: &std::path::Path, message: String) -> BuilderResult {
    BuilderResult {
        service_name,
        status: BuilderStatus::Failed,
        output_dir: output_dir.to_path_buf(),
        cost: rust_decimal::Decimal::ZERO,
        duration_ms: Some(0),
        exit_code: None,
        error_message: Some(message),
    }
}

fn finish(service_name: String, output_dir: &std::path::Path, exit_code: Option<i32>, duration_ms: u64) -> BuilderResult {
    let status = match exit_code {
        Some(0) => BuilderStatus::Succeeded,
        _ => BuilderStatus::Failed,
    };
    let error_message = match status {
        BuilderStatus::Failed => Some(format!("builder exited with code {exit_code:?}")),
        _ => None,
    };
    BuilderResult {
        service_name,
        status,
        output_dir: output_dir.to_path_buf(),
        cost: read_reported_cost(output_dir),
        duration_ms: Some(duration_ms),
        exit_code,
        error_message,
    }
}

fn cancelled(service_name: String, output_dir: &std::path::Path, duration_ms: u64) -> BuilderResult {
    BuilderResult {
        service_name,
        status: BuilderStatus::Failed,
        output_dir: output_dir.to_path_buf(),
        cost: read_reported_cost(output_dir),
        duration_ms: Some(duration_ms),
        exit_code: None,
        error_message: Some("cancelled".to_string()),
    }
}

fn timed_out(service_name: String, output_dir: &std::path::Path, duration_ms: u64) -> BuilderResult {
    BuilderResult {
        service_name,
        status: BuilderStatus::Timeout,
        output_dir: output_dir.to_path_buf(),
        cost: read_reported_cost(output_dir),
        duration_ms: Some(duration_ms),
        exit_code: None,
        error_message: Some("timed out".to_string()),
    }
}

/// Builders report their own spend in `.agent-team/STATE.json`; absence of
/// the file (a builder that never ran) is zero cost, not an error.
fn read_reported_cost(output_dir: &std::path::Path) -> rust_decimal::Decimal {
    let path = output_dir.join(".agent-team").join("STATE.json");
    let Ok(content) = std::fs::read_to_string(path) else {
        return rust_decimal::Decimal::ZERO;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) else {
        return rust_decimal::Decimal::ZERO;
    };
    value
        .get("cost")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(rust_decimal::Decimal::ZERO)
}
