//! Engine settings
//!
//! One resolved `Settings` value is threaded through the interpreter. CLI
//! flags overlay the `ORCHESTRATE_*` environment variables (clap handles the
//! env fallback), which overlay the defaults here.

use std::path::PathBuf;
use std::str::FromStr;

/// What to do with an unhandled step failure when `strict_flow` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnErrorPolicy {
    Stop,
    /// Advance to the next step. The default, so `strict_flow` governs.
    #[default]
    Continue,
}

impl FromStr for OnErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stop" => Ok(Self::Stop),
            "continue" => Ok(Self::Continue),
            _ => Err(format!("Unknown on-error policy: {s}. Use: stop or continue")),
        }
    }
}

impl std::fmt::Display for OnErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

/// Resolved engine settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root all declared paths resolve against.
    pub workspace: PathBuf,
    /// Holds `runs/<run_id>/`. Default: `<workspace>/.orchestrate`.
    pub state_dir: PathBuf,
    pub debug: bool,
    pub dry_run: bool,
    /// Per-step state backups (`--backup-state`; implied by `--debug`).
    pub backup_state: bool,
    pub on_error: OnErrorPolicy,
    /// Default retry count for provider steps without explicit `retries`.
    pub max_retries: u32,
    /// Default inter-attempt delay in milliseconds.
    pub retry_delay_ms: u64,
    /// Prune run roots beyond the newest N when set.
    pub keep_runs: Option<usize>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

impl Settings {
    pub fn new(workspace: PathBuf) -> Self {
        let state_dir = workspace.join(".orchestrate");
        Self {
            workspace,
            state_dir,
            debug: false,
            dry_run: false,
            backup_state: false,
            on_error: OnErrorPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            keep_runs: None,
        }
    }

    /// Backups are taken when requested explicitly or in debug mode.
    pub fn backups_enabled(&self) -> bool {
        self.backup_state || self.debug
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }
}
