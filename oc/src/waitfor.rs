//! Wait-for primitive
//!
//! Polls a glob until enough matches appear, the timeout elapses, or the run
//! is cancelled. Timeout and cancellation both record exit 124 with
//! `timed_out: true`; the sorted match list is recorded either way.

use std::path::Path;
use std::time::Instant;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::deps::expand_with_scope;
use crate::domain::workflow::WaitSpec;
use crate::error::{EXIT_TIMEOUT, StepError};
use crate::vars::Scope;

/// What a wait step observed, persisted onto its step result.
#[derive(Debug, Clone)]
pub struct WaitObservation {
    pub files: Vec<String>,
    pub wait_duration_ms: u64,
    pub poll_count: u64,
    pub timed_out: bool,
    pub exit_code: i32,
}

impl WaitObservation {
    pub fn satisfied(&self) -> bool {
        self.exit_code == 0
    }
}

/// Poll until `min_count` matches, timeout, or cancellation.
pub async fn wait_for(
    workspace: &Path,
    spec: &WaitSpec,
    scope: &Scope,
    cancel: &CancelToken,
) -> Result<WaitObservation, StepError> {
    let started = Instant::now();
    let deadline = Duration::from_secs(spec.timeout_sec);
    let poll_interval = Duration::from_millis(spec.poll_ms);

    let mut poll_count: u64 = 0;
    let mut files: Vec<String> = Vec::new();

    debug!(glob = %spec.glob, timeout_sec = spec.timeout_sec, poll_ms = spec.poll_ms, min_count = spec.min_count, "wait_for starting");

    loop {
        poll_count += 1;
        files = expand_with_scope(workspace, &spec.glob, scope)?;
        if files.len() >= spec.min_count {
            let wait_duration_ms = started.elapsed().as_millis() as u64;
            info!(glob = %spec.glob, matches = files.len(), poll_count, wait_duration_ms, "wait_for satisfied");
            return Ok(WaitObservation {
                files,
                wait_duration_ms,
                poll_count,
                timed_out: false,
                exit_code: 0,
            });
        }

        if started.elapsed() >= deadline {
            break;
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        let nap = poll_interval.min(remaining);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = cancel.cancelled() => {
                debug!(glob = %spec.glob, "wait_for cancelled");
                break;
            }
        }
        if cancel.is_cancelled() {
            break;
        }
    }

    let wait_duration_ms = started.elapsed().as_millis() as u64;
    info!(glob = %spec.glob, poll_count, wait_duration_ms, "wait_for timed out");
    Ok(WaitObservation {
        files,
        wait_duration_ms,
        poll_count,
        timed_out: true,
        exit_code: EXIT_TIMEOUT,
    })
}
