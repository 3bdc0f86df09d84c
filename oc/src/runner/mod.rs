//! Process runner
//!
//! Spawns child processes for command and provider steps: environment and
//! secrets assembly, stdin delivery of the composed prompt, stdout capture
//! through the pipeline, timeout enforcement with a graceful-then-hard
//! signal pair, and the serial retry policy.

mod provider;

pub use provider::{ProviderInvocation, build_invocation};

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::capture::{CaptureConfig, CaptureOutcome, tail_lines};
use crate::error::{EXIT_CANCELLED, EXIT_TIMEOUT, StepError};

/// Grace period between SIGTERM and SIGKILL on timeout or cancellation.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to execute one child process attempt.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Program plus arguments. Raw commands arrive as `["sh", "-c", text]`.
    pub argv: Vec<String>,
    /// Composed prompt (stdin-mode providers and commands with input_file).
    pub stdin: Option<String>,
    /// Step-level literal env overlay; wins over the inherited environment.
    pub env_overlay: Vec<(String, String)>,
    /// Secret values to mask in logs and persisted tails.
    pub secret_values: Vec<String>,
    pub timeout: Option<Duration>,
    pub cwd: std::path::PathBuf,
    pub capture: CaptureConfig,
    /// `logs/<Step>.stderr`; written iff stderr is non-empty.
    pub stderr_path: std::path::PathBuf,
}

/// Retry policy resolved from step settings and CLI defaults.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    /// Retries beyond the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
    /// Exit codes that trigger a retry.
    pub retry_on: Vec<i32>,
}

impl RetryPlan {
    /// No retries at all (raw commands without an explicit `retries`).
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
            retry_on: Vec::new(),
        }
    }
}

/// Exit codes providers retry on by default: retryable API failure and
/// timeout.
pub const PROVIDER_RETRY_EXITS: [i32; 2] = [1, EXIT_TIMEOUT];

/// Result of running a step's child to completion (across retries).
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Total attempts, including the first.
    pub attempts: u32,
    pub duration_ms: u64,
    pub capture: CaptureOutcome,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled
    }

    /// Last ~10 stderr lines, masked.
    pub fn stderr_tail(&self, secrets: &[String]) -> Vec<String> {
        tail_lines(&mask_secrets(&self.stderr, secrets), 10)
    }

    /// Last ~10 stdout lines, masked.
    pub fn stdout_tail(&self, secrets: &[String]) -> Vec<String> {
        self.capture
            .stdout_tail()
            .into_iter()
            .map(|line| mask_secrets(&line, secrets))
            .collect()
    }
}

/// Validate that every declared secret is present in the orchestrator
/// environment. Empty values count as present. Returns the resolved values
/// for masking.
pub fn resolve_secrets(names: &[String]) -> Result<Vec<String>, StepError> {
    let mut values = Vec::new();
    let mut missing = Vec::new();
    for name in names {
        match std::env::var(name) {
            Ok(value) => values.push(value),
            Err(_) => missing.push(name.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(StepError::missing_secrets(missing));
    }
    Ok(values)
}

/// Best-effort exact replacement of secret values with `***`.
pub fn mask_secrets(text: &str, secrets: &[String]) -> String {
    let mut masked = text.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            masked = masked.replace(secret.as_str(), "***");
        }
    }
    masked
}

/// Run the child to completion, retrying per `retry`. Retries are serial;
/// the delay sleep observes the cancellation token.
pub async fn run_child(
    spec: &ExecSpec,
    retry: &RetryPlan,
    cancel: &CancelToken,
) -> eyre::Result<ExecOutcome> {
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        debug!(
            argv = %mask_secrets(&spec.argv.join(" "), &spec.secret_values),
            attempt = attempts,
            "spawning child"
        );

        let mut outcome = run_once(spec, cancel).await?;
        outcome.attempts = attempts;
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        if outcome.success() || outcome.cancelled {
            return Ok(outcome);
        }
        if attempts > retry.max_retries || !retry.retry_on.contains(&outcome.exit_code) {
            return Ok(outcome);
        }

        info!(
            exit_code = outcome.exit_code,
            attempt = attempts,
            max_retries = retry.max_retries,
            delay_ms = retry.delay.as_millis() as u64,
            "retrying step child"
        );
        tokio::select! {
            _ = tokio::time::sleep(retry.delay) => {}
            _ = cancel.cancelled() => {
                outcome.cancelled = true;
                return Ok(outcome);
            }
        }
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

async fn run_once(spec: &ExecSpec, cancel: &CancelToken) -> eyre::Result<ExecOutcome> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| eyre::eyre!("empty argv"))?;

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(&spec.cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    for (key, value) in &spec.env_overlay {
        command.env(key, value);
    }

    let mut child = command.spawn()?;

    if let Some(ref prompt) = spec.stdin {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| eyre::eyre!("failed to open child stdin"))?;
        let data = prompt.clone().into_bytes();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&data).await {
                debug!(error = %e, "stdin write failed (child may have exited)");
            }
            // Dropping stdin closes the pipe so the child sees EOF.
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| eyre::eyre!("failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| eyre::eyre!("failed to capture stderr"))?;

    let capture_config = spec.capture.clone();
    let stdout_task = tokio::spawn(async move { crate::capture::capture_stream(stdout, &capture_config).await });
    let stderr_task = tokio::spawn(async move {
        let mut reader = stderr;
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer).await;
        String::from_utf8_lossy(&buffer).into_owned()
    });

    let waited = tokio::select! {
        status = child.wait() => WaitOutcome::Exited(status?),
        _ = sleep_opt(spec.timeout) => WaitOutcome::TimedOut,
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
    };

    let (exit_code, timed_out, cancelled) = match waited {
        WaitOutcome::Exited(status) => (status.code().unwrap_or(-1), false, false),
        WaitOutcome::TimedOut => {
            warn!(timeout_sec = spec.timeout.map(|t| t.as_secs()), "child timed out, terminating");
            terminate(&mut child).await;
            (EXIT_TIMEOUT, true, false)
        }
        WaitOutcome::Cancelled => {
            info!("cancellation received, terminating child");
            terminate(&mut child).await;
            (EXIT_CANCELLED, false, true)
        }
    };

    let capture = stdout_task.await??;
    let stderr_text = stderr_task.await.unwrap_or_default();

    if !stderr_text.is_empty() {
        if let Some(parent) = spec.stderr_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&spec.stderr_path, &stderr_text).await?;
    }

    Ok(ExecOutcome {
        exit_code,
        timed_out,
        cancelled,
        attempts: 1,
        duration_ms: 0,
        capture,
        stderr: stderr_text,
    })
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Graceful-then-hard termination: SIGTERM, wait out the grace period, then
/// SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            debug!(error = %e, "SIGTERM failed, killing directly");
            let _ = child.kill().await;
            return;
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
            warn!("child ignored SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    } else {
        let _ = child.kill().await;
    }
    let _ = child.wait().await;
}
