//! Orchestrate - CLI entry point
//!
//! Loads and validates the workflow, wires ctrl-c into the cancellation
//! token, drives the interpreter, and maps outcomes onto the exit-code
//! contract: 0 success, 2 invalid input, 1 run failure, 124 when the
//! terminal failure was a timeout.

use clap::Parser;
use eyre::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

use orchestrate::cancel::CancelToken;
use orchestrate::cli::{Cli, Command, CommonArgs, load_context_file, parse_context_pairs};
use orchestrate::config::Settings;
use orchestrate::domain::workflow::{StepKind, Workflow};
use orchestrate::dsl::load_workflow;
use orchestrate::error::EXIT_INVALID;
use orchestrate::interp::{Interpreter, RunOutcome};
use orchestrate::queue;
use orchestrate::state::{RunState, prune_runs};

fn setup_logging(common: &CommonArgs) {
    let default_level = if common.quiet {
        "warn"
    } else if common.verbose {
        "debug"
    } else {
        "info"
    };
    let directive = common
        .log_level
        .clone()
        .unwrap_or_else(|| default_level.to_string());

    let filter = tracing_subscriber::EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli.common);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let workspace = std::env::current_dir().context("cannot determine workspace")?;

    match cli.command {
        Command::Run {
            workflow,
            context,
            context_file,
            clean_processed,
            archive_processed,
        } => {
            let workflow = match load_workflow(&workflow, &workspace) {
                Ok(workflow) => workflow,
                Err(e) => {
                    error!("workflow rejected: {e}");
                    return Ok(ExitCode::from(EXIT_INVALID as u8));
                }
            };
            let settings = cli.common.settings(workspace.clone(), cli.common.debug);

            if settings.dry_run {
                print_plan(&workflow);
                return Ok(ExitCode::SUCCESS);
            }

            if clean_processed
                && let Err(e) = queue::clean_processed(&workspace, &workflow.queues.processed)
            {
                error!("{e:#}");
                return Ok(ExitCode::from(EXIT_INVALID as u8));
            }

            let mut merged = workflow.context.clone();
            if let Some(ref path) = context_file {
                merged.extend(load_context_file(path)?);
            }
            merged.extend(parse_context_pairs(&context)?);

            let state = RunState::create(&settings, &workflow, merged)?;
            let run_root = state.run_root.clone();

            let outcome = execute(&workflow, &settings, state).await?;

            if let Some(ref destination) = archive_processed {
                let destination = resolve_archive_destination(&workspace, &run_root, destination);
                if let Err(e) =
                    queue::archive_processed(&workspace, &workflow.queues.processed, &destination)
                        .await
                {
                    error!("{e:#}");
                    return Ok(ExitCode::from(EXIT_INVALID as u8));
                }
            }

            if let Some(keep) = settings.keep_runs {
                prune_runs(&settings.runs_dir(), keep)?;
            }

            Ok(exit_code_for(outcome))
        }

        Command::Resume {
            run_id,
            force_restart,
            repair,
            backup_state,
        } => {
            let settings = cli
                .common
                .settings(workspace.clone(), backup_state || cli.common.debug);

            let workflow_file = match discover_workflow_file(&settings, &run_id) {
                Ok(file) => file,
                Err(e) => {
                    error!("{e:#}");
                    return Ok(ExitCode::from(EXIT_INVALID as u8));
                }
            };
            let workflow = match load_workflow(&workspace.join(&workflow_file), &workspace) {
                Ok(workflow) => workflow,
                Err(e) => {
                    error!("workflow rejected: {e}");
                    return Ok(ExitCode::from(EXIT_INVALID as u8));
                }
            };

            let state =
                match RunState::resume(&settings, &run_id, &workflow, repair, force_restart) {
                    Ok(state) => state,
                    Err(e) => {
                        error!("{e:#}");
                        return Ok(ExitCode::from(EXIT_INVALID as u8));
                    }
                };

            if settings.dry_run {
                print_plan(&workflow);
                return Ok(ExitCode::SUCCESS);
            }

            let outcome = execute(&workflow, &settings, state).await?;
            Ok(exit_code_for(outcome))
        }
    }
}

async fn execute(
    workflow: &Workflow,
    settings: &Settings,
    state: RunState,
) -> Result<RunOutcome> {
    let (source, token) = CancelToken::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            source.cancel();
        }
    });

    let interpreter = Interpreter::new(workflow, settings, state, token);
    let (outcome, state) = interpreter.execute().await?;
    info!(run_id = %state.doc.run_id, status = %outcome.status, "run finished");
    Ok(outcome)
}

fn exit_code_for(outcome: RunOutcome) -> ExitCode {
    ExitCode::from(outcome.exit_code.clamp(0, 255) as u8)
}

fn resolve_archive_destination(workspace: &Path, run_root: &Path, raw: &str) -> PathBuf {
    if raw.is_empty() {
        queue::default_archive_path(run_root)
    } else if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        workspace.join(raw)
    }
}

/// Recover the workflow file path recorded in the run document, falling back
/// to state backups when the live document is unreadable.
fn discover_workflow_file(settings: &Settings, run_id: &str) -> Result<String> {
    let run_root = settings.runs_dir().join(run_id);
    if !run_root.exists() {
        bail!("run '{run_id}' not found under {}", settings.runs_dir().display());
    }

    let mut candidates = vec![run_root.join("state.json")];
    if let Ok(entries) = std::fs::read_dir(&run_root) {
        let mut backups: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().ends_with(".bak")))
            .collect();
        backups.sort();
        backups.reverse();
        candidates.extend(backups);
    }

    for candidate in candidates {
        let Ok(text) = std::fs::read_to_string(&candidate) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        if let Some(file) = value.get("workflow_file").and_then(|v| v.as_str())
            && !file.is_empty()
        {
            return Ok(file.to_string());
        }
    }

    bail!("cannot determine the workflow file for run '{run_id}'; its state is unreadable")
}

fn print_plan(workflow: &Workflow) {
    println!("workflow: {} (version {})", workflow.name, workflow.version);
    for step in &workflow.steps {
        print_step(step, 1);
    }
}

fn print_step(step: &orchestrate::domain::workflow::Step, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{indent}{} ({})", step.name, step.kind.label());
    if let StepKind::ForEach(spec) = &step.kind {
        for child in &spec.steps {
            print_step(child, depth + 1);
        }
    }
}
