//! Control-flow interpreter
//!
//! Walks the step list with a program counter: `when` evaluation, dependency
//! validation, dispatch to the runner / wait-for / for-each engine, outcome
//! computation, `on.*` branching with the reserved `_end` target, and the
//! strict-flow halt policy. Every state transition is persisted before the
//! interpreter consults it for branching or for the next step's variables.

mod foreach;

use eyre::{ContextCompat, Result, bail};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::capture::{CaptureConfig, CaptureMode};
use crate::config::{OnErrorPolicy, Settings};
use crate::deps::{ResolvedDeps, expand_with_scope, resolve_step_deps};
use crate::domain::run::{
    IterationEntry, RunStatus, StepEntry, StepResult, StepStatus,
};
use crate::domain::workflow::{
    Condition, GOTO_END, Step, StepKind, Workflow,
};
use crate::error::{EXIT_CANCELLED, EXIT_TIMEOUT, ErrorKind, StepError};
use crate::inject::compose_prompt;
use crate::paths;
use crate::runner::{
    ExecSpec, PROVIDER_RETRY_EXITS, RetryPlan, build_invocation, mask_secrets, resolve_secrets,
    run_child,
};
use crate::state::RunState;
use crate::vars::{Scope, substitute};
use crate::waitfor::wait_for;

/// Final outcome of a run, mapped to the process exit code by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: i32,
}

/// Stack of enclosing loop frames: (loop step name, iteration index).
type Frames = Vec<(String, usize)>;

/// What one step produced, as seen by the sequence walker.
#[derive(Debug, Clone)]
enum Disposition {
    Skipped,
    Success,
    Failure { exit_code: i32 },
    /// Reserved `_end` target reached.
    EndRun,
    /// Goto left the current scope (only possible inside a loop).
    Escape { target: String },
    /// Unrecoverable: cancellation or an unhandled strict-flow failure.
    Halt { exit_code: i32 },
}

/// How a step sequence ended.
#[derive(Debug, Clone)]
pub(crate) enum SeqResult {
    Finished,
    EndRun,
    Halt { exit_code: i32 },
    Escape { target: String },
}

/// The single-threaded workflow interpreter. Owns the run state handle;
/// exactly one step is in flight at any time.
pub struct Interpreter<'a> {
    workflow: &'a Workflow,
    settings: &'a Settings,
    pub state: RunState,
    cancel: CancelToken,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        workflow: &'a Workflow,
        settings: &'a Settings,
        state: RunState,
        cancel: CancelToken,
    ) -> Self {
        Self {
            workflow,
            settings,
            state,
            cancel,
        }
    }

    /// Drive the run to completion (or halt). Resuming a completed run is a
    /// no-op; resuming an interrupted run replays only non-terminal steps.
    pub async fn execute(mut self) -> Result<(RunOutcome, RunState)> {
        if self.state.doc.status == RunStatus::Completed {
            info!(run_id = %self.state.doc.run_id, "run already completed, nothing to do");
            return Ok((
                RunOutcome {
                    status: RunStatus::Completed,
                    exit_code: 0,
                },
                self.state,
            ));
        }

        self.state.doc.set_status(RunStatus::Running);
        self.state.persist()?;

        let workflow = self.workflow;
        let base = self.base_scope();
        let seq = self.run_sequence(&workflow.steps, Vec::new(), base).await;

        let outcome = match seq {
            Ok(SeqResult::Finished) | Ok(SeqResult::EndRun) => {
                self.state.doc.set_status(RunStatus::Completed);
                self.state.persist()?;
                info!(run_id = %self.state.doc.run_id, "run completed");
                RunOutcome {
                    status: RunStatus::Completed,
                    exit_code: 0,
                }
            }
            Ok(SeqResult::Halt { exit_code }) => {
                self.state.doc.set_status(RunStatus::Failed);
                self.state.persist()?;
                warn!(run_id = %self.state.doc.run_id, exit_code, "run failed");
                RunOutcome {
                    status: RunStatus::Failed,
                    exit_code: match exit_code {
                        EXIT_TIMEOUT => EXIT_TIMEOUT,
                        EXIT_CANCELLED => EXIT_CANCELLED,
                        _ => 1,
                    },
                }
            }
            Ok(SeqResult::Escape { target }) => {
                bail!("goto escaped the top-level scope to '{target}'");
            }
            Err(e) => {
                // Flush state before surfacing infrastructure errors so the
                // run stays resumable.
                let _ = self.state.persist();
                return Err(e);
            }
        };

        Ok((outcome, self.state))
    }

    /// Base scope: `run.*` metadata plus the frozen context.
    fn base_scope(&self) -> Scope {
        let mut run = Map::new();
        run.insert("id".to_string(), json!(self.state.doc.run_id));
        run.insert(
            "root".to_string(),
            json!(paths::workspace_relative(
                &self.settings.workspace,
                &self.state.run_root
            )),
        );
        run.insert("workflow".to_string(), json!(self.state.doc.workflow_name));
        Scope::new(run, self.state.doc.context.clone())
    }

    /// Walk one step sequence (the top level or one loop iteration body).
    /// Boxed because the for-each engine recurses back into it.
    pub(crate) fn run_sequence<'s>(
        &'s mut self,
        steps: &'a [Step],
        frames: Frames,
        base: Scope,
    ) -> Pin<Box<dyn Future<Output = Result<SeqResult>> + 's>>
    where
        'a: 's,
    {
        Box::pin(async move {
            let mut pc = 0usize;
            while pc < steps.len() {
                let step = &steps[pc];

                if self.cancel.is_cancelled() {
                    debug!(step = %step.name, "cancelled before step dispatch");
                    return Ok(SeqResult::Halt {
                        exit_code: EXIT_CANCELLED,
                    });
                }

                let disposition = self.execute_step(step, &frames, &base).await?;
                let (success, exit_code) = match disposition {
                    Disposition::Skipped => {
                        pc += 1;
                        continue;
                    }
                    Disposition::EndRun => return Ok(SeqResult::EndRun),
                    Disposition::Halt { exit_code } => return Ok(SeqResult::Halt { exit_code }),
                    Disposition::Escape { target } => {
                        // An inner loop escaped; the target may live here.
                        match steps.iter().position(|s| s.name == target) {
                            Some(index) => {
                                pc = index;
                                continue;
                            }
                            None => return Ok(SeqResult::Escape { target }),
                        }
                    }
                    Disposition::Success => (true, 0),
                    Disposition::Failure { exit_code } => (false, exit_code),
                };

                // Branching precedence: the outcome-specific handler first,
                // then `always` as the fallback for either outcome.
                let target = if success {
                    step.handlers.success.as_ref().or(step.handlers.always.as_ref())
                } else {
                    step.handlers.failure.as_ref().or(step.handlers.always.as_ref())
                };

                match target {
                    Some(target) if target == GOTO_END => {
                        debug!(step = %step.name, "goto _end");
                        return Ok(SeqResult::EndRun);
                    }
                    Some(target) => match steps.iter().position(|s| s.name == *target) {
                        Some(index) => {
                            debug!(step = %step.name, %target, "goto");
                            pc = index;
                        }
                        None => {
                            debug!(step = %step.name, %target, "goto escapes scope");
                            return Ok(SeqResult::Escape {
                                target: target.clone(),
                            });
                        }
                    },
                    None if success => pc += 1,
                    None => {
                        let halt = self.workflow.strict_flow
                            || self.settings.on_error == OnErrorPolicy::Stop;
                        if halt {
                            info!(step = %step.name, exit_code, "unhandled failure halts run");
                            return Ok(SeqResult::Halt { exit_code });
                        }
                        warn!(step = %step.name, exit_code, "unhandled failure, continuing");
                        pc += 1;
                    }
                }
            }
            Ok(SeqResult::Finished)
        })
    }

    /// Execute one step (or replay its recorded outcome on resume).
    async fn execute_step(
        &mut self,
        step: &'a Step,
        frames: &Frames,
        base: &Scope,
    ) -> Result<Disposition> {
        let label = step_label(frames, &step.name);

        // Idempotent resume: terminal steps replay their recorded outcome
        // without executing.
        if let Some(StepEntry::Single(existing)) = self.read_entry(frames, &step.name)
            && existing.status.is_terminal()
        {
            debug!(step = %label, status = %existing.status, "replaying recorded outcome");
            return Ok(match existing.status {
                StepStatus::Skipped => Disposition::Skipped,
                StepStatus::Completed => Disposition::Success,
                _ => Disposition::Failure {
                    exit_code: existing.exit_code.unwrap_or(1),
                },
            });
        }

        if self.settings.backups_enabled() {
            self.state.backup_before_step(&label);
        }

        let scope = base.with_steps(self.sink_view(frames));

        // 1. `when` gate; false skips dispatch and dependency validation.
        if let Some(ref condition) = step.when {
            match self.eval_condition(condition, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(step = %label, "condition false, skipping");
                    let mut result = StepResult::pending();
                    result.skip();
                    self.write_single(frames, &step.name, result)?;
                    return Ok(Disposition::Skipped);
                }
                Err(error) => {
                    let mut result = StepResult::pending();
                    result.start();
                    let exit_code = error.exit_code;
                    result.fail(error);
                    self.write_single(frames, &step.name, result)?;
                    return Ok(Disposition::Failure { exit_code });
                }
            }
        }

        match &step.kind {
            StepKind::ForEach(spec) => {
                return self.run_for_each(step, spec, frames, base).await;
            }
            StepKind::Wait(spec) => {
                let mut result = StepResult::pending();
                result.start();
                self.write_single(frames, &step.name, result.clone())?;

                let observed = match wait_for(&self.settings.workspace, spec, &scope, &self.cancel)
                    .await
                {
                    Ok(observed) => observed,
                    Err(error) => {
                        let exit_code = error.exit_code;
                        result.fail(error);
                        self.write_single(frames, &step.name, result)?;
                        return Ok(Disposition::Failure { exit_code });
                    }
                };

                result.files = Some(observed.files.clone());
                result.wait_duration_ms = Some(observed.wait_duration_ms);
                result.poll_count = Some(observed.poll_count);
                result.timed_out = Some(observed.timed_out);

                let disposition = if observed.satisfied() {
                    result.complete();
                    Disposition::Success
                } else {
                    let cancelled = self.cancel.is_cancelled();
                    result.fail(
                        StepError::new(
                            ErrorKind::Timeout,
                            format!("wait_for '{}' timed out", spec.glob),
                            EXIT_TIMEOUT,
                        )
                        .with_context(json!({ "timed_out": true })),
                    );
                    if cancelled {
                        Disposition::Halt {
                            exit_code: EXIT_TIMEOUT,
                        }
                    } else {
                        Disposition::Failure {
                            exit_code: EXIT_TIMEOUT,
                        }
                    }
                };
                self.write_single(frames, &step.name, result)?;
                Ok(disposition)
            }
            StepKind::Command { .. } | StepKind::Provider { .. } => {
                let mut result = StepResult::pending();
                result.start();
                self.write_single(frames, &step.name, result.clone())?;

                let (result, cancelled) = self.drive_child(step, &scope, &label, result).await?;
                let disposition = if cancelled {
                    Disposition::Halt {
                        exit_code: result.exit_code.unwrap_or(EXIT_CANCELLED),
                    }
                } else if result.status == StepStatus::Completed {
                    Disposition::Success
                } else {
                    Disposition::Failure {
                        exit_code: result.exit_code.unwrap_or(1),
                    }
                };
                self.write_single(frames, &step.name, result)?;
                Ok(disposition)
            }
        }
    }

    /// Run a command/provider child to completion: path substitution,
    /// dependency validation, prompt composition, secrets, spawn + retries,
    /// and capture mapping onto the step result.
    async fn drive_child(
        &mut self,
        step: &'a Step,
        scope: &Scope,
        label: &str,
        mut result: StepResult,
    ) -> Result<(StepResult, bool)> {
        // 2. Path-bearing fields pass substitution and the path gate.
        let input_file = match self.resolve_declared_path(step.input_file.as_deref(), scope) {
            Ok(path) => path,
            Err(error) => {
                result.fail(error);
                return Ok((result, false));
            }
        };
        let output_file = match self.resolve_declared_path(step.output_file.as_deref(), scope) {
            Ok(path) => path,
            Err(error) => {
                result.fail(error);
                return Ok((result, false));
            }
        };

        // 3. Dependency validation.
        let deps = if step.depends_on.is_empty() {
            ResolvedDeps::default()
        } else {
            match resolve_step_deps(&self.settings.workspace, &step.depends_on, scope) {
                Ok(deps) => deps,
                Err(error) => {
                    result.fail(error);
                    return Ok((result, false));
                }
            }
        };

        let composed = match compose_prompt(
            &self.settings.workspace,
            input_file.as_deref(),
            step.depends_on.inject.as_ref(),
            &deps,
        ) {
            Ok(composed) => composed,
            Err(error) => {
                result.fail(error);
                return Ok((result, false));
            }
        };
        if let Some(ref details) = composed.truncation {
            result.debug_entry("injection", json!({ "truncation_details": details }));
        }

        let secret_values = match resolve_secrets(&step.secrets) {
            Ok(values) => values,
            Err(error) => {
                result.fail(error);
                return Ok((result, false));
            }
        };

        let (argv, stdin, retry) = match &step.kind {
            StepKind::Command { command } => {
                let substituted = substitute(command, scope);
                if !substituted.unresolved.is_empty() {
                    result.fail(StepError::undefined_vars(substituted.unresolved));
                    return Ok((result, false));
                }
                let stdin = input_file.as_ref().map(|_| composed.text.clone());
                let retry = match step.retries {
                    Some(policy) => RetryPlan {
                        max_retries: policy.max,
                        delay: Duration::from_millis(
                            policy.delay_ms.unwrap_or(self.settings.retry_delay_ms),
                        ),
                        retry_on: PROVIDER_RETRY_EXITS.to_vec(),
                    },
                    None => RetryPlan::none(),
                };
                (
                    vec!["sh".to_string(), "-c".to_string(), substituted.text],
                    stdin,
                    retry,
                )
            }
            StepKind::Provider { provider, params } => {
                let template = self
                    .workflow
                    .providers
                    .get(provider)
                    .with_context(|| format!("unknown provider '{provider}'"))?;
                let invocation = match build_invocation(template, params, scope, &composed.text) {
                    Ok(invocation) => invocation,
                    Err(error) => {
                        result.fail(error);
                        return Ok((result, false));
                    }
                };
                let retry = RetryPlan {
                    max_retries: step
                        .retries
                        .map(|policy| policy.max)
                        .unwrap_or(self.settings.max_retries),
                    delay: Duration::from_millis(
                        step.retries
                            .and_then(|policy| policy.delay_ms)
                            .unwrap_or(self.settings.retry_delay_ms),
                    ),
                    retry_on: PROVIDER_RETRY_EXITS.to_vec(),
                };
                (invocation.argv, invocation.stdin, retry)
            }
            _ => bail!("drive_child called for a non-child step"),
        };

        let logs_dir = self.state.logs_dir();
        let spec = ExecSpec {
            argv,
            stdin,
            env_overlay: step
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            secret_values: secret_values.clone(),
            timeout: step.timeout_sec.map(Duration::from_secs),
            cwd: self.settings.workspace.clone(),
            capture: CaptureConfig {
                mode: step.capture,
                output_file,
                spill_path: logs_dir.join(format!("{label}.stdout")),
                allow_parse_error: step.allow_parse_error,
                output_require: step.output_require.clone(),
                output_schema: step.output_schema.clone(),
            },
            stderr_path: logs_dir.join(format!("{label}.stderr")),
        };

        if self.settings.debug {
            result.debug_entry(
                "command",
                json!(mask_secrets(&spec.argv.join(" "), &secret_values)),
            );
        }

        let outcome = run_child(&spec, &retry, &self.cancel).await?;

        // Map capture onto the mode-dependent result fields.
        result.truncated = outcome.capture.truncated;
        match step.capture {
            CaptureMode::Text => result.output = outcome.capture.output.clone(),
            CaptureMode::Lines => result.lines = outcome.capture.lines.clone(),
            CaptureMode::Json => {
                result.json = outcome.capture.json.clone();
                // allow_parse_error fallback keeps the capped raw text.
                result.output = outcome.capture.output.clone();
            }
        }
        if outcome.attempts > 1 || self.settings.debug {
            result.debug_entry("attempts", json!(outcome.attempts));
        }

        let stdout_tail = outcome.stdout_tail(&secret_values);
        let stderr_tail = outcome.stderr_tail(&secret_values);

        if outcome.cancelled {
            result.fail(
                StepError::new(
                    ErrorKind::Execution,
                    "step cancelled",
                    outcome.exit_code,
                )
                .with_tails(stdout_tail, stderr_tail),
            );
            return Ok((result, true));
        }
        if outcome.timed_out {
            result.fail(
                StepError::timeout(step.timeout_sec.unwrap_or_default())
                    .with_tails(stdout_tail, stderr_tail),
            );
            return Ok((result, false));
        }
        if outcome.exit_code != 0 {
            result.fail(
                StepError::new(
                    ErrorKind::Execution,
                    format!("child exited with code {}", outcome.exit_code),
                    outcome.exit_code,
                )
                .with_tails(stdout_tail, stderr_tail),
            );
            return Ok((result, false));
        }

        if let Some(ref reason) = outcome.capture.json_parse_error {
            if step.allow_parse_error {
                result.debug_entry("json_parse_error", json!({ "reason": reason }));
                result.json = None;
                result.complete();
                return Ok((result, false));
            }
            let error = outcome
                .capture
                .capture_error()
                .expect("parse error implies capture error")
                .with_tails(stdout_tail, stderr_tail);
            result.fail(error);
            return Ok((result, false));
        }
        if let Some(error) = outcome.capture.capture_error() {
            result.fail(error.with_tails(stdout_tail, stderr_tail));
            return Ok((result, false));
        }

        result.complete();
        Ok((result, false))
    }

    /// Substitute and gate a declared path field.
    fn resolve_declared_path(
        &self,
        raw: Option<&str>,
        scope: &Scope,
    ) -> std::result::Result<Option<PathBuf>, StepError> {
        let Some(raw) = raw else { return Ok(None) };
        let substituted = substitute(raw, scope);
        if !substituted.unresolved.is_empty() {
            return Err(StepError::undefined_vars(substituted.unresolved));
        }
        let absolute = paths::safe_join(&self.settings.workspace, &substituted.text).map_err(|e| {
            StepError::new(
                ErrorKind::Validation,
                format!("unsafe path '{}': {e}", substituted.text),
                crate::error::EXIT_INVALID,
            )
            .with_context(json!({ "unsafe_path": substituted.text }))
        })?;
        Ok(Some(absolute))
    }

    fn eval_condition(
        &self,
        condition: &Condition,
        scope: &Scope,
    ) -> std::result::Result<bool, StepError> {
        match condition {
            Condition::Equals { left, right } => {
                let left = substitute(left, scope);
                if !left.unresolved.is_empty() {
                    return Err(StepError::undefined_vars(left.unresolved));
                }
                let right = substitute(right, scope);
                if !right.unresolved.is_empty() {
                    return Err(StepError::undefined_vars(right.unresolved));
                }
                Ok(left.text == right.text)
            }
            Condition::Exists { glob } => {
                let matches = expand_with_scope(&self.settings.workspace, glob, scope)?;
                Ok(!matches.is_empty())
            }
            Condition::NotExists { glob } => {
                let matches = expand_with_scope(&self.settings.workspace, glob, scope)?;
                Ok(matches.is_empty())
            }
        }
    }

    // === Sink navigation: where step results live for the current frames ===

    /// JSON view of this scope's step results for the variable evaluator.
    /// Inside a loop iteration this is the iteration's own results only.
    pub(crate) fn sink_view(&self, frames: &Frames) -> Value {
        let mut current = &self.state.doc.steps;
        for (name, index) in frames {
            match current.get(name) {
                Some(StepEntry::Loop(iterations)) if *index < iterations.len() => {
                    current = &iterations[*index].steps;
                }
                _ => return json!({}),
            }
        }
        serde_json::to_value(current).unwrap_or_else(|_| json!({}))
    }

    pub(crate) fn read_entry(&self, frames: &Frames, name: &str) -> Option<StepEntry> {
        let mut current = &self.state.doc.steps;
        for (frame_name, index) in frames {
            match current.get(frame_name) {
                Some(StepEntry::Loop(iterations)) if *index < iterations.len() => {
                    current = &iterations[*index].steps;
                }
                _ => return None,
            }
        }
        current.get(name).cloned()
    }

    /// Write one step's result into the frame-addressed map and persist:
    /// results are durable before the interpreter branches on them.
    pub(crate) fn write_single(
        &mut self,
        frames: &Frames,
        name: &str,
        result: StepResult,
    ) -> Result<()> {
        let map = sink_map_mut(&mut self.state.doc.steps, frames);
        map.insert(name.to_string(), StepEntry::Single(result));
        self.state.persist()
    }
}

/// Navigate (and create) the mutable step map addressed by `frames`.
pub(crate) fn sink_map_mut<'d>(
    steps: &'d mut BTreeMap<String, StepEntry>,
    frames: &[(String, usize)],
) -> &'d mut BTreeMap<String, StepEntry> {
    let mut current = steps;
    for (name, index) in frames {
        let entry = current
            .entry(name.clone())
            .or_insert_with(|| StepEntry::Loop(Vec::new()));
        if matches!(entry, StepEntry::Single(_)) {
            *entry = StepEntry::Loop(Vec::new());
        }
        let StepEntry::Loop(iterations) = entry else {
            unreachable!("loop entry ensured above");
        };
        while iterations.len() <= *index {
            iterations.push(IterationEntry::default());
        }
        current = &mut iterations[*index].steps;
    }
    current
}

/// Log/spill label for a possibly-nested step: `Outer.0.Inner`.
pub(crate) fn step_label(frames: &[(String, usize)], name: &str) -> String {
    let mut label = String::new();
    for (frame_name, index) in frames {
        label.push_str(frame_name);
        label.push('.');
        label.push_str(&index.to_string());
        label.push('.');
    }
    label.push_str(name);
    label
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::loader::{checksum_hex, load_workflow_str};
    use serde_json::Map;
    use tempfile::tempdir;

    async fn run_yaml(dir: &std::path::Path, yaml: &str) -> (RunOutcome, RunState) {
        let settings = Settings::new(dir.to_path_buf());
        let workflow = load_workflow_str(yaml, checksum_hex(yaml.as_bytes()), dir).unwrap();
        let state = RunState::create(&settings, &workflow, workflow.context.clone()).unwrap();
        let interp = Interpreter::new(&workflow, &settings, state, CancelToken::never());
        interp.execute().await.unwrap()
    }

    #[tokio::test]
    async fn test_sequential_run_completes() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: seq
steps:
  - name: One
    command: echo first
  - name: Two
    command: echo second
"#;
        let (outcome, state) = run_yaml(temp.path(), yaml).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.exit_code, 0);
        let one = state.doc.step_result("One").unwrap();
        assert_eq!(one.status, StepStatus::Completed);
        assert_eq!(one.output.as_deref(), Some("first\n"));
    }

    #[tokio::test]
    async fn test_strict_flow_halts_on_failure() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: strict
steps:
  - name: Boom
    command: exit 7
  - name: Never
    command: echo unreachable
"#;
        let (outcome, state) = run_yaml(temp.path(), yaml).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(
            state.doc.step_result("Boom").unwrap().status,
            StepStatus::Failed
        );
        assert!(state.doc.step_result("Never").is_none());
    }

    #[tokio::test]
    async fn test_loose_flow_continues() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: loose
strict_flow: false
steps:
  - name: Boom
    command: exit 7
  - name: After
    command: echo survived
"#;
        let (outcome, state) = run_yaml(temp.path(), yaml).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(
            state.doc.step_result("After").unwrap().status,
            StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_on_failure_goto_recovers() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: recover
steps:
  - name: Boom
    command: exit 3
    on:
      failure:
        goto: Recover
  - name: Skipped
    command: echo not reached
    on:
      success:
        goto: _end
  - name: Recover
    command: echo recovered
"#;
        let (outcome, state) = run_yaml(temp.path(), yaml).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(
            state.doc.step_result("Recover").unwrap().status,
            StepStatus::Completed
        );
        assert!(state.doc.step_result("Skipped").is_none());
    }

    #[tokio::test]
    async fn test_goto_end_completes_run() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: early
steps:
  - name: First
    command: echo one
    on:
      success:
        goto: _end
  - name: Never
    command: echo nope
"#;
        let (outcome, state) = run_yaml(temp.path(), yaml).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(state.doc.step_result("Never").is_none());
    }

    #[tokio::test]
    async fn test_when_equals_skips() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: gated
context:
  mode: fast
steps:
  - name: OnlySlow
    command: echo slow work
    when:
      equals:
        left: "${context.mode}"
        right: slow
  - name: Tail
    command: echo done
"#;
        let (outcome, state) = run_yaml(temp.path(), yaml).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        let skipped = state.doc.step_result("OnlySlow").unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert_eq!(skipped.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_when_exists_runs() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("flag.txt"), "").unwrap();
        let yaml = r#"
version: "1.1"
name: gated
steps:
  - name: IfFlag
    command: echo flagged
    when:
      exists: "flag.txt"
"#;
        let (_, state) = run_yaml(temp.path(), yaml).await;
        assert_eq!(
            state.doc.step_result("IfFlag").unwrap().status,
            StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_json_gate_boolean_coercion() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: gate
steps:
  - name: Review
    command: "echo '{\"approved\": true}'"
    output_capture: json
  - name: Deploy
    command: echo deploying
    when:
      equals:
        left: "${steps.Review.json.approved}"
        right: "true"
"#;
        let (outcome, state) = run_yaml(temp.path(), yaml).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(
            state.doc.step_result("Deploy").unwrap().status,
            StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_lines_capture_omits_output() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: lines
steps:
  - name: List
    command: printf 'a\nb\n'
    output_capture: lines
"#;
        let (_, state) = run_yaml(temp.path(), yaml).await;

        let list = state.doc.step_result("List").unwrap();
        assert_eq!(list.lines.as_ref().unwrap(), &vec!["a", "b"]);
        assert!(list.output.is_none());
    }

    #[tokio::test]
    async fn test_failed_dep_then_recovery_branch() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: deps
steps:
  - name: Build
    command: echo building
    depends_on:
      required: ["data/missing.csv"]
    on:
      failure:
        goto: Recover
  - name: Recover
    command: echo recovered
"#;
        let (outcome, state) = run_yaml(temp.path(), yaml).await;

        assert_eq!(outcome.status, RunStatus::Completed);
        let build = state.doc.step_result("Build").unwrap();
        assert_eq!(build.status, StepStatus::Failed);
        assert_eq!(build.exit_code, Some(2));
        let error = build.error.as_ref().unwrap();
        assert_eq!(error.context["failed_deps"][0], "data/missing.csv");
        assert_eq!(
            state.doc.step_result("Recover").unwrap().status,
            StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_undefined_command_var_fails() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: vars
steps:
  - name: Bad
    command: echo ${context.nope}
"#;
        let (outcome, state) = run_yaml(temp.path(), yaml).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        let bad = state.doc.step_result("Bad").unwrap();
        assert_eq!(bad.exit_code, Some(2));
        assert_eq!(bad.error.as_ref().unwrap().context["undefined_vars"][0], "context.nope");
    }

    #[tokio::test]
    async fn test_resume_completed_run_is_noop() {
        let temp = tempdir().unwrap();
        let yaml = r#"
version: "1.1"
name: once
steps:
  - name: Stamp
    command: date +%s%N > stamp.txt
"#;
        let settings = Settings::new(temp.path().to_path_buf());
        let workflow = load_workflow_str(yaml, checksum_hex(yaml.as_bytes()), temp.path()).unwrap();
        let state = RunState::create(&settings, &workflow, Map::new()).unwrap();
        let run_id = state.doc.run_id.clone();

        let interp = Interpreter::new(&workflow, &settings, state, CancelToken::never());
        interp.execute().await.unwrap();
        let first = std::fs::read_to_string(temp.path().join("stamp.txt")).unwrap();

        let state = RunState::resume(&settings, &run_id, &workflow, false, false).unwrap();
        let interp = Interpreter::new(&workflow, &settings, state, CancelToken::never());
        let (outcome, _) = interp.execute().await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        let second = std::fs::read_to_string(temp.path().join("stamp.txt")).unwrap();
        assert_eq!(first, second, "completed step must not re-run");
    }

    #[test]
    fn test_step_label_nesting() {
        let frames = vec![("Process".to_string(), 0usize), ("Inner".to_string(), 2)];
        assert_eq!(step_label(&frames, "Impl"), "Process.0.Inner.2.Impl");
        assert_eq!(step_label(&[], "Solo"), "Solo");
    }
}
