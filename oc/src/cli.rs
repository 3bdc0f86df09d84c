//! CLI command definitions

use clap::{Args, Parser, Subcommand};
use eyre::{Result, bail};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::config::{OnErrorPolicy, Settings};

/// Orchestrate - deterministic YAML workflow runner
#[derive(Parser)]
#[command(
    name = "oc",
    about = "Runs declarative, crash-resumable YAML workflows",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by `run` and `resume`
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Verbose step debugging: per-step state backups and debug blocks
    #[arg(long, global = true, env = "ORCHESTRATE_DEBUG")]
    pub debug: bool,

    /// Validate and print the step plan without executing
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Directory holding run state (default: <workspace>/.orchestrate)
    #[arg(long, global = true, env = "ORCHESTRATE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Unhandled-failure policy when strict_flow is off (stop, continue)
    #[arg(long = "on-error", global = true, default_value = "continue")]
    pub on_error: OnErrorPolicy,

    /// Default retry count for provider steps
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Default delay between retry attempts in milliseconds
    #[arg(long, global = true)]
    pub retry_delay: Option<u64>,

    /// Keep only the newest N run directories
    #[arg(long, global = true, env = "ORCHESTRATE_KEEP_RUNS")]
    pub keep_runs: Option<usize>,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true, env = "ORCHESTRATE_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a workflow file from the current workspace
    Run {
        /// Path to the workflow YAML
        workflow: PathBuf,

        /// Context overrides as key=value (repeatable)
        #[arg(long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,

        /// YAML file of context key/value overrides
        #[arg(long = "context-file", value_name = "PATH")]
        context_file: Option<PathBuf>,

        /// Sweep *.task/*.tmp files from the processed directory first
        #[arg(long)]
        clean_processed: bool,

        /// Zip the processed directory after the run
        /// (default destination: <run_root>/processed.zip)
        #[arg(
            long,
            value_name = "DST",
            num_args = 0..=1,
            default_missing_value = ""
        )]
        archive_processed: Option<String>,
    },

    /// Resume an interrupted run by id
    Resume {
        /// Run id (YYYYMMDDTHHMMSSZ-xxxxxx)
        run_id: String,

        /// Start a fresh run id if the state is unusable
        #[arg(long)]
        force_restart: bool,

        /// Roll back to the newest valid state backup
        #[arg(long)]
        repair: bool,

        /// Copy state.json aside before every step
        #[arg(long)]
        backup_state: bool,
    },
}

impl CommonArgs {
    /// Resolve settings: flags over environment over defaults.
    pub fn settings(&self, workspace: PathBuf, backup_state: bool) -> Settings {
        let mut settings = Settings::new(workspace);
        if let Some(ref state_dir) = self.state_dir {
            settings.state_dir = state_dir.clone();
        }
        settings.debug = self.debug;
        settings.dry_run = self.dry_run;
        settings.backup_state = backup_state;
        settings.on_error = self.on_error;
        if let Some(max_retries) = self.max_retries {
            settings.max_retries = max_retries;
        }
        if let Some(retry_delay) = self.retry_delay {
            settings.retry_delay_ms = retry_delay;
        }
        settings.keep_runs = self.keep_runs;
        settings
    }
}

/// Parse repeated `--context key=value` pairs into a JSON map.
pub fn parse_context_pairs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("--context expects key=value, got '{pair}'");
        };
        if key.is_empty() {
            bail!("--context key must be non-empty in '{pair}'");
        }
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(map)
}

/// Load a YAML context file into a JSON map.
pub fn load_context_file(path: &PathBuf) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("cannot read context file {}: {e}", path.display()))?;
    let value: Value = serde_yaml::from_str(&text)
        .map_err(|e| eyre::eyre!("context file {} is not valid YAML: {e}", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => bail!("context file {} must contain a mapping", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_context() {
        let cli = Cli::parse_from([
            "oc",
            "run",
            "workflow.yaml",
            "--context",
            "env=staging",
            "--context",
            "batch=7",
        ]);
        match cli.command {
            Command::Run { workflow, context, .. } => {
                assert_eq!(workflow, PathBuf::from("workflow.yaml"));
                assert_eq!(context.len(), 2);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_resume_flags() {
        let cli = Cli::parse_from(["oc", "resume", "20250101T000000Z-abc123", "--repair"]);
        match cli.command {
            Command::Resume {
                run_id,
                repair,
                force_restart,
                backup_state,
            } => {
                assert_eq!(run_id, "20250101T000000Z-abc123");
                assert!(repair);
                assert!(!force_restart);
                assert!(!backup_state);
            }
            other => panic!("expected resume, got {other:?}"),
        }
    }

    #[test]
    fn test_archive_processed_optional_value() {
        let cli = Cli::parse_from(["oc", "run", "w.yaml", "--archive-processed"]);
        match cli.command {
            Command::Run { archive_processed, .. } => {
                assert_eq!(archive_processed.as_deref(), Some(""));
            }
            other => panic!("expected run, got {other:?}"),
        }

        let cli = Cli::parse_from(["oc", "run", "w.yaml", "--archive-processed", "out.zip"]);
        match cli.command {
            Command::Run { archive_processed, .. } => {
                assert_eq!(archive_processed.as_deref(), Some("out.zip"));
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_on_error_parses() {
        let cli = Cli::parse_from(["oc", "run", "w.yaml", "--on-error", "stop"]);
        assert_eq!(cli.common.on_error, OnErrorPolicy::Stop);
    }

    #[test]
    fn test_parse_context_pairs() {
        let map = parse_context_pairs(&["a=1".to_string(), "b=x=y".to_string()]).unwrap();
        assert_eq!(map["a"], "1");
        assert_eq!(map["b"], "x=y");

        assert!(parse_context_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_context_pairs(&["=empty".to_string()]).is_err());
    }

    #[test]
    fn test_settings_overlay() {
        let cli = Cli::parse_from(["oc", "--max-retries", "5", "run", "w.yaml"]);
        let settings = cli.common.settings(PathBuf::from("/ws"), false);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.state_dir, PathBuf::from("/ws/.orchestrate"));
    }
}
