//! Run document and step results
//!
//! The durable record of one workflow run. Persisted after every state
//! transition; all paths stored here are workspace-relative.

use chrono::Utc;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::StepError;

/// Schema tag written into every state document.
pub const SCHEMA_VERSION: &str = "1.1.1";

/// Current time in Unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a run id: compact UTC timestamp plus a 6-char suffix.
pub fn generate_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("{stamp}-{suffix}")
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-step status. Transitions once: pending -> running -> terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Persisted outcome of one step execution.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Raw captured text; text capture mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Captured lines; lines capture mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<String>>,
    /// Parsed value; json capture mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,

    /// Wait-for fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

impl StepResult {
    pub fn pending() -> Self {
        Self::default()
    }

    /// Transition to running and stamp the start time.
    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(now_ms());
    }

    /// Terminal success. Completed non-skipped steps always carry exit 0.
    pub fn complete(&mut self) {
        self.status = StepStatus::Completed;
        self.exit_code = Some(0);
        self.finish_timing();
    }

    /// Terminal failure with a structured error.
    pub fn fail(&mut self, error: StepError) {
        self.status = StepStatus::Failed;
        self.exit_code = Some(error.exit_code);
        self.error = Some(error);
        self.finish_timing();
    }

    /// Condition evaluated false: skipped, exit 0, no child executed.
    pub fn skip(&mut self) {
        self.status = StepStatus::Skipped;
        self.exit_code = Some(0);
        self.finish_timing();
    }

    /// Insert a key into the debug block, creating it on first use.
    pub fn debug_entry(&mut self, key: &str, value: Value) {
        let debug = self.debug.get_or_insert_with(|| Value::Object(Map::new()));
        if let Some(map) = debug.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed || self.status == StepStatus::Skipped
    }

    fn finish_timing(&mut self) {
        let now = now_ms();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some(now.saturating_sub(started).max(0) as u64);
        }
    }
}

/// Entry in the run document's `steps` map: a plain result for ordinary
/// steps, or the per-iteration result array for a `for_each` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepEntry {
    Single(StepResult),
    Loop(Vec<IterationEntry>),
}

impl StepEntry {
    pub fn as_single(&self) -> Option<&StepResult> {
        match self {
            Self::Single(result) => Some(result),
            Self::Loop(_) => None,
        }
    }

    pub fn as_loop(&self) -> Option<&Vec<IterationEntry>> {
        match self {
            Self::Loop(iterations) => Some(iterations),
            Self::Single(_) => None,
        }
    }
}

/// One loop iteration: child step entries keyed by name, flattened so the
/// document reads `steps.<Loop>[i].<Child>` (and nests arrays again for
/// inner loops), plus the v1.2 lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IterationEntry {
    #[serde(flatten)]
    pub steps: BTreeMap<String, StepEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleRecord>,
}

/// Outcome of a v1.2 `on_item_complete` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRecord {
    /// "success" or "failure" - the iteration outcome the action matched.
    pub outcome: String,
    pub action_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Loop bookkeeping kept alongside the iteration results.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoopState {
    pub items: Vec<Value>,
    pub completed_indices: Vec<usize>,
    pub current_index: usize,
}

/// The durable run document at `<run_root>/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDocument {
    pub schema_version: String,
    pub run_id: String,
    pub workflow_name: String,
    /// Workspace-relative workflow file path, for resume.
    #[serde(default)]
    pub workflow_file: String,
    pub workflow_checksum: String,
    pub status: RunStatus,
    pub started_at: i64,
    pub updated_at: i64,
    /// Context frozen at run start: workflow defaults overlaid with CLI
    /// `--context` values.
    pub context: Map<String, Value>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepEntry>,
    #[serde(default)]
    pub loops: BTreeMap<String, LoopState>,
}

impl RunDocument {
    pub fn new(
        run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        workflow_file: impl Into<String>,
        workflow_checksum: impl Into<String>,
        context: Map<String, Value>,
    ) -> Self {
        let now = now_ms();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            workflow_file: workflow_file.into(),
            workflow_checksum: workflow_checksum.into(),
            status: RunStatus::Running,
            started_at: now,
            updated_at: now,
            context,
            steps: BTreeMap::new(),
            loops: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.touch();
    }

    /// Top-level step result, if the step has run and is not a loop.
    pub fn step_result(&self, name: &str) -> Option<&StepResult> {
        self.steps.get(name).and_then(StepEntry::as_single)
    }

    /// JSON view of the `steps` map for the variable evaluator.
    pub fn steps_view(&self) -> Value {
        serde_json::to_value(&self.steps).unwrap_or(Value::Null)
    }
}
