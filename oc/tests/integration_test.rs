//! Integration tests for orchestrate
//!
//! End-to-end runs over real workspaces in temp dirs: queue processing with
//! lines capture and for_each, json gating, wait_for timeouts, dependency
//! failures with recovery branches, provider retries, path-safety load
//! rejection, and crash resume.

use assert_cmd::Command as BinCommand;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use orchestrate::cancel::CancelToken;
use orchestrate::config::Settings;
use orchestrate::dsl::loader::{checksum_hex, load_workflow_str};
use orchestrate::error::ValidationError;
use orchestrate::interp::{Interpreter, RunOutcome};
use orchestrate::state::RunState;
use orchestrate::{RunStatus, StepStatus, Workflow};

fn load(dir: &Path, yaml: &str) -> Result<Workflow, ValidationError> {
    load_workflow_str(yaml, checksum_hex(yaml.as_bytes()), dir)
}

async fn run(dir: &Path, yaml: &str) -> (RunOutcome, RunState) {
    let settings = Settings::new(dir.to_path_buf());
    let workflow = load(dir, yaml).expect("workflow should validate");
    let state = RunState::create(&settings, &workflow, workflow.context.clone()).unwrap();
    let interpreter = Interpreter::new(&workflow, &settings, state, CancelToken::never());
    interpreter.execute().await.unwrap()
}

/// Parse the on-disk state document; it must always be valid JSON with the
/// expected schema tag.
fn state_on_disk(state: &RunState) -> Value {
    let text = fs::read_to_string(state.run_root.join("state.json")).unwrap();
    let value: Value = serde_json::from_str(&text).expect("state.json must parse");
    assert_eq!(value["schema_version"], "1.1.1");
    value
}

// =============================================================================
// Scenario: lines capture feeds for_each
// =============================================================================

#[tokio::test]
async fn test_lines_capture_feeds_for_each() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("inbox")).unwrap();
    fs::write(temp.path().join("inbox/a.task"), "").unwrap();
    fs::write(temp.path().join("inbox/b.task"), "").unwrap();

    let yaml = r#"
version: "1.1"
name: queue-drain
steps:
  - name: List
    command: "find inbox -name '*.task' | sort"
    output_capture: lines
  - name: Process
    for_each:
      items_from: "steps.List.lines"
      as: task_file
      steps:
        - name: Impl
          command: echo working on ${loop.task_file}
"#;
    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let doc = state_on_disk(&state);
    assert_eq!(doc["steps"]["List"]["lines"][0], "inbox/a.task");
    assert_eq!(doc["steps"]["Process"][0]["Impl"]["status"], "completed");
    assert_eq!(doc["steps"]["Process"][1]["Impl"]["status"], "completed");
    // Loop results recorded in ascending index order
    assert_eq!(doc["loops"]["Process"]["completed_indices"][0], 0);
    assert_eq!(doc["loops"]["Process"]["completed_indices"][1], 1);
}

// =============================================================================
// Scenario: json gate with boolean coercion
// =============================================================================

#[tokio::test]
async fn test_json_gate() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
version: "1.1"
name: review-gate
steps:
  - name: Review
    command: "echo '{\"approved\": true}'"
    output_capture: json
  - name: Ship
    command: echo shipping
    when:
      equals:
        left: "${steps.Review.json.approved}"
        right: "true"
"#;
    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let ship = state.doc.step_result("Ship").unwrap();
    assert_eq!(ship.status, StepStatus::Completed);
    // json mode never stores the raw output field
    let doc = state_on_disk(&state);
    assert!(doc["steps"]["Review"].get("output").is_none());
    assert_eq!(doc["steps"]["Review"]["json"]["approved"], true);
}

// =============================================================================
// Scenario: wait_for timeout
// =============================================================================

#[tokio::test]
async fn test_wait_for_timeout() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("inbox/qa")).unwrap();

    let yaml = r#"
version: "1.1"
name: qa-wait
steps:
  - name: AwaitReview
    wait_for:
      glob: "inbox/qa/*.json"
      timeout_sec: 1
"#;
    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.exit_code, 124);
    let wait = state.doc.step_result("AwaitReview").unwrap();
    assert_eq!(wait.status, StepStatus::Failed);
    assert_eq!(wait.exit_code, Some(124));
    assert_eq!(wait.timed_out, Some(true));
    assert!(wait.poll_count.unwrap() >= 1);
    assert_eq!(wait.files.as_ref().unwrap().len(), 0);
}

// =============================================================================
// Scenario: required dependency miss routes to recovery
// =============================================================================

#[tokio::test]
async fn test_required_dependency_miss_recovers() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
version: "1.1"
name: dep-recovery
steps:
  - name: Build
    command: echo building
    depends_on:
      required: ["data/missing.csv"]
    on:
      failure:
        goto: Recover
  - name: Recover
    command: echo recovering
"#;
    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let build = state.doc.step_result("Build").unwrap();
    assert_eq!(build.exit_code, Some(2));
    assert_eq!(
        build.error.as_ref().unwrap().context["failed_deps"][0],
        "data/missing.csv"
    );
    assert_eq!(
        state.doc.step_result("Recover").unwrap().status,
        StepStatus::Completed
    );
}

// =============================================================================
// Scenario: provider retries on exit 1
// =============================================================================

#[tokio::test]
async fn test_provider_retries_then_succeeds() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
version: "1.1"
name: flaky-provider
providers:
  flaky:
    template:
      - sh
      - -c
      - "c=$(cat attempts 2>/dev/null || echo 0); c=$((c+1)); echo $c > attempts; [ $c -ge 3 ] && cat || exit 1"
    input_mode: stdin
steps:
  - name: Ask
    provider: flaky
    input_file: prompt.md
    retries:
      max: 2
      delay_ms: 0
"#;
    fs::write(temp.path().join("prompt.md"), "summarize").unwrap();

    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let ask = state.doc.step_result("Ask").unwrap();
    assert_eq!(ask.status, StepStatus::Completed);
    assert_eq!(ask.exit_code, Some(0));
    assert_eq!(ask.debug.as_ref().unwrap()["attempts"], 3);
    // The composed prompt reached the provider via stdin
    assert_eq!(ask.output.as_deref(), Some("summarize"));
}

// =============================================================================
// Scenario: path-safety rejection at load time
// =============================================================================

#[tokio::test]
async fn test_path_safety_rejects_at_load() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
version: "1.1"
name: escape-attempt
steps:
  - name: Leak
    command: cat
    input_file: "../outside.txt"
"#;
    let err = load(temp.path(), yaml).unwrap_err();
    match err {
        ValidationError::UnsafePath { location, .. } => assert!(location.contains("input_file")),
        other => panic!("expected UnsafePath, got {other}"),
    }
    // No run directory is ever created for a rejected workflow
    assert!(!temp.path().join(".orchestrate").exists());
}

// =============================================================================
// Provider prompt injection end to end
// =============================================================================

#[tokio::test]
async fn test_injection_shorthand_prepends_file_list() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("data")).unwrap();
    fs::write(temp.path().join("data/b.csv"), "").unwrap();
    fs::write(temp.path().join("data/a.csv"), "").unwrap();
    fs::write(temp.path().join("prompt.md"), "analyze the data").unwrap();

    let yaml = r#"
version: "1.1.1"
name: injected
providers:
  echoer:
    template: [sh, -c, cat]
    input_mode: stdin
steps:
  - name: Analyze
    provider: echoer
    input_file: prompt.md
    output_capture: text
    depends_on:
      required: ["data/*.csv"]
      inject: true
"#;
    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let prompt = state.doc.step_result("Analyze").unwrap().output.clone().unwrap();
    // Sorted required list, prepended before the base prompt
    let a = prompt.find("data/a.csv").unwrap();
    let b = prompt.find("data/b.csv").unwrap();
    let base = prompt.find("analyze the data").unwrap();
    assert!(a < b && b < base);
    assert!(prompt.contains("Required:"));
}

// =============================================================================
// Secrets and env overlay
// =============================================================================

#[tokio::test]
#[serial_test::serial]
async fn test_missing_secret_fails_with_context() {
    let temp = TempDir::new().unwrap();
    unsafe { std::env::remove_var("ORC_IT_MISSING_KEY") };
    let yaml = r#"
version: "1.1"
name: secretive
steps:
  - name: Call
    command: echo calling
    secrets: [ORC_IT_MISSING_KEY]
"#;
    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Failed);
    let call = state.doc.step_result("Call").unwrap();
    assert_eq!(call.exit_code, Some(2));
    assert_eq!(
        call.error.as_ref().unwrap().context["missing_secrets"][0],
        "ORC_IT_MISSING_KEY"
    );
}

// =============================================================================
// Crash resume: only non-terminal steps replay
// =============================================================================

#[tokio::test]
async fn test_resume_replays_only_non_terminal_steps() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
version: "1.1"
name: resumable
steps:
  - name: Once
    command: "echo x >> counter.txt"
  - name: Gate
    command: "test -f flag.txt"
"#;
    let settings = Settings::new(temp.path().to_path_buf());
    let workflow = load(temp.path(), yaml).unwrap();

    let state = RunState::create(&settings, &workflow, workflow.context.clone()).unwrap();
    let run_id = state.doc.run_id.clone();
    let interpreter = Interpreter::new(&workflow, &settings, state, CancelToken::never());
    let (outcome, state) = interpreter.execute().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);

    // Simulate a crash mid-step: rewrite Gate as non-terminal, run as
    // interrupted.
    let state_path = state.run_root.join("state.json");
    let mut doc: Value = serde_json::from_str(&fs::read_to_string(&state_path).unwrap()).unwrap();
    doc["status"] = Value::String("running".to_string());
    doc["steps"]["Gate"] = serde_json::json!({ "status": "running" });
    fs::write(&state_path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

    // Unblock the gate and resume.
    fs::write(temp.path().join("flag.txt"), "").unwrap();
    let resumed = RunState::resume(&settings, &run_id, &workflow, false, false).unwrap();
    let interpreter = Interpreter::new(&workflow, &settings, resumed, CancelToken::never());
    let (outcome, state) = interpreter.execute().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(
        state.doc.step_result("Gate").unwrap().status,
        StepStatus::Completed
    );
    // The terminal step did not re-run on resume.
    let counter = fs::read_to_string(temp.path().join("counter.txt")).unwrap();
    assert_eq!(counter.lines().count(), 1);
}

// =============================================================================
// Output file and spill log invariants
// =============================================================================

#[tokio::test]
async fn test_truncation_spills_full_stream() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
version: "1.1"
name: big-output
steps:
  - name: Spew
    command: "head -c 10000 /dev/zero | tr '\\0' 'x'"
    output_file: artifacts/full.txt
"#;
    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let spew = state.doc.step_result("Spew").unwrap();
    assert!(spew.truncated);
    assert_eq!(spew.output.as_ref().unwrap().len(), 8 * 1024);
    // Full stream in both the output file and the spill log
    assert_eq!(
        fs::metadata(temp.path().join("artifacts/full.txt")).unwrap().len(),
        10_000
    );
    assert_eq!(
        fs::metadata(state.run_root.join("logs/Spew.stdout")).unwrap().len(),
        10_000
    );
}

#[tokio::test]
async fn test_stderr_logged_when_nonempty() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
version: "1.1"
name: noisy
steps:
  - name: Warn
    command: "echo all good; echo complaint >&2"
"#;
    let (_, state) = run(temp.path(), yaml).await;

    let stderr_log = state.run_root.join("logs/Warn.stderr");
    assert!(stderr_log.exists());
    assert!(fs::read_to_string(stderr_log).unwrap().contains("complaint"));
}

// =============================================================================
// allow_parse_error downgrade
// =============================================================================

#[tokio::test]
async fn test_allow_parse_error_downgrades() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
version: "1.1"
name: tolerant
steps:
  - name: Scan
    command: "echo not json at all"
    output_capture: json
    allow_parse_error: true
"#;
    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let scan = state.doc.step_result("Scan").unwrap();
    assert_eq!(scan.exit_code, Some(0));
    assert!(scan.json.is_none());
    assert!(scan.output.as_ref().unwrap().contains("not json"));
    assert_eq!(scan.debug.as_ref().unwrap()["json_parse_error"]["reason"], "invalid");
}

// =============================================================================
// Timeout contract
// =============================================================================

#[tokio::test]
async fn test_command_timeout_records_124() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
version: "1.1"
name: slowpoke
steps:
  - name: Hang
    command: sleep 30
    timeout_sec: 1
"#;
    let (outcome, state) = run(temp.path(), yaml).await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.exit_code, 124);
    let hang = state.doc.step_result("Hang").unwrap();
    assert_eq!(hang.exit_code, Some(124));
    assert_eq!(hang.error.as_ref().unwrap().context["timed_out"], true);
}

// =============================================================================
// Binary smoke tests
// =============================================================================

#[test]
fn test_binary_dry_run_prints_plan() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("wf.yaml"),
        r#"
version: "1.1"
name: planned
steps:
  - name: Hello
    command: echo hi
"#,
    )
    .unwrap();

    BinCommand::cargo_bin("oc")
        .unwrap()
        .current_dir(temp.path())
        .args(["run", "--dry-run", "wf.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello (command)"));

    assert!(!temp.path().join(".orchestrate").exists());
}

#[test]
fn test_binary_rejects_invalid_workflow_with_exit_2() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("bad.yaml"),
        r#"
version: "1.1"
name: bad
steps:
  - name: Leak
    command: cat
    input_file: "../outside.txt"
"#,
    )
    .unwrap();

    BinCommand::cargo_bin("oc")
        .unwrap()
        .current_dir(temp.path())
        .args(["run", "bad.yaml"])
        .assert()
        .code(2);
}

#[test]
fn test_binary_runs_workflow_end_to_end() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("wf.yaml"),
        r#"
version: "1.1"
name: real
steps:
  - name: Make
    command: echo made > out.txt
"#,
    )
    .unwrap();

    BinCommand::cargo_bin("oc")
        .unwrap()
        .current_dir(temp.path())
        .args(["run", "--quiet", "wf.yaml"])
        .assert()
        .success();

    assert!(temp.path().join("out.txt").exists());
    assert!(temp.path().join(".orchestrate/runs").exists());
}
