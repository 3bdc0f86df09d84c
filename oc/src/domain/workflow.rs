//! Immutable workflow model
//!
//! Produced by the DSL loader after validation; never mutated afterwards.
//! Steps are a tagged variant over the four step kinds with shared metadata,
//! so the interpreter dispatches on the tag.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::capture::CaptureMode;
use crate::dsl::version::Version;

/// Default instruction line for dependency injection blocks.
pub const DEFAULT_INJECT_INSTRUCTION: &str =
    "The following files are available to this task.";

/// A fully validated workflow.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub version: Version,
    pub name: String,
    /// When true (the default), an unhandled step failure halts the run.
    pub strict_flow: bool,
    pub providers: BTreeMap<String, ProviderTemplate>,
    pub queues: QueueDefaults,
    /// Workflow-declared context defaults, frozen into the run at start.
    pub context: Map<String, Value>,
    pub steps: Vec<Step>,
    /// Hex SHA-256 of the workflow file bytes.
    pub checksum: String,
    /// Workspace-relative location of the workflow file, recorded in the run
    /// document so `resume` can reload it.
    pub source_path: String,
}

impl Workflow {
    /// Look up a top-level step index by name.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }
}

/// How the composed prompt reaches a provider process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    /// `${PROMPT}` is substituted into the argv template.
    #[default]
    Argv,
    /// The prompt is written to the child's standard input.
    Stdin,
}

/// An LLM-CLI invocation template.
#[derive(Debug, Clone)]
pub struct ProviderTemplate {
    /// Argv tokens; may contain `${PROMPT}` (argv mode only) and parameter
    /// placeholders.
    pub argv: Vec<String>,
    pub input_mode: InputMode,
    /// Default values for template parameters, overridable per step.
    pub defaults: Map<String, Value>,
}

/// Queue-directory defaults for the inbox/processed/failed convention.
#[derive(Debug, Clone)]
pub struct QueueDefaults {
    pub inbox: String,
    pub processed: String,
    pub failed: String,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            inbox: "inbox".to_string(),
            processed: "processed".to_string(),
            failed: "failed".to_string(),
        }
    }
}

/// One workflow step: a kind tag plus shared metadata.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub input_file: Option<String>,
    pub output_file: Option<String>,
    pub capture: CaptureMode,
    pub allow_parse_error: bool,
    /// Dotted paths that must resolve in json-mode output (version >= 1.3).
    pub output_require: Vec<String>,
    /// Minimal structural schema for json-mode output (version >= 1.3).
    pub output_schema: Option<Value>,
    pub env: BTreeMap<String, String>,
    /// Names of environment variables that must be present; values are
    /// masked in logs.
    pub secrets: Vec<String>,
    pub depends_on: DependsOn,
    pub timeout_sec: Option<u64>,
    pub retries: Option<RetryPolicy>,
    pub when: Option<Condition>,
    pub handlers: Handlers,
}

/// The selected step behavior. Exactly one per step.
#[derive(Debug, Clone)]
pub enum StepKind {
    /// Raw shell command, run via `sh -c`.
    Command { command: String },
    /// Provider invocation built from a template.
    Provider {
        provider: String,
        params: Map<String, Value>,
    },
    /// Block until a glob matches.
    Wait(WaitSpec),
    /// Iterate child steps over resolved items.
    ForEach(ForEachSpec),
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Provider { .. } => "provider",
            Self::Wait(_) => "wait_for",
            Self::ForEach(_) => "for_each",
        }
    }
}

/// Declared file dependencies plus the injection policy.
#[derive(Debug, Clone, Default)]
pub struct DependsOn {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub inject: Option<InjectPolicy>,
}

impl DependsOn {
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

/// How resolved dependencies are folded into the composed prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectPolicy {
    pub mode: InjectMode,
    pub position: InjectPosition,
    pub instruction: String,
}

impl InjectPolicy {
    /// The `inject: true` shorthand: list mode, prepended, default
    /// instruction.
    pub fn shorthand() -> Self {
        Self {
            mode: InjectMode::List,
            position: InjectPosition::Prepend,
            instruction: DEFAULT_INJECT_INSTRUCTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectMode {
    #[default]
    List,
    Content,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectPosition {
    #[default]
    Prepend,
    Append,
}

/// Retry policy for a step. `max` counts retries beyond the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max: u32,
    pub delay_ms: Option<u64>,
}

/// Wait-for parameters with spec defaults applied.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    pub glob: String,
    pub timeout_sec: u64,
    pub poll_ms: u64,
    pub min_count: usize,
}

pub const WAIT_DEFAULT_TIMEOUT_SEC: u64 = 300;
pub const WAIT_DEFAULT_POLL_MS: u64 = 500;
pub const WAIT_DEFAULT_MIN_COUNT: usize = 1;

/// For-each block: items source, loop alias, child steps, and the v1.2
/// per-item lifecycle.
#[derive(Debug, Clone)]
pub struct ForEachSpec {
    pub items: Option<Vec<Value>>,
    pub items_from: Option<ItemsPointer>,
    pub alias: String,
    pub steps: Vec<Step>,
    pub lifecycle: Option<Lifecycle>,
}

pub const DEFAULT_LOOP_ALIAS: &str = "item";

/// Per-item completion actions (version >= 1.2).
#[derive(Debug, Clone)]
pub struct Lifecycle {
    pub success: Option<LifecycleAction>,
    pub failure: Option<LifecycleAction>,
}

#[derive(Debug, Clone)]
pub struct LifecycleAction {
    /// Destination directory or path; variables are substituted with the
    /// loop scope before the path gate runs.
    pub move_to: String,
}

/// Parsed `items_from` pointer: `steps.<Name>.lines` or
/// `steps.<Name>.json[.<dotted>]`. Parsed once at load; wildcards are
/// rejected there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemsPointer {
    pub step: String,
    pub kind: PointerKind,
    pub segments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Lines,
    Json,
}

impl ItemsPointer {
    /// Parse an `items_from` reference. Errors are plain strings; the loader
    /// wraps them into its validation error.
    pub fn parse(reference: &str) -> Result<Self, String> {
        let mut parts = reference.split('.');
        if parts.next() != Some("steps") {
            return Err(format!("'{reference}' must start with 'steps.'"));
        }
        let step = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("'{reference}' is missing a step name"))?;
        let kind = match parts.next() {
            Some("lines") => PointerKind::Lines,
            Some("json") => PointerKind::Json,
            other => {
                return Err(format!(
                    "'{reference}' must select 'lines' or 'json', found {other:?}"
                ));
            }
        };

        let segments: Vec<String> = parts.map(str::to_string).collect();
        if kind == PointerKind::Lines && !segments.is_empty() {
            return Err(format!("'{reference}': 'lines' takes no trailing path"));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(format!("'{reference}' contains an empty path segment"));
            }
            if segment.contains('*') || segment.contains('?') {
                return Err(format!("'{reference}': wildcards are not supported"));
            }
        }

        Ok(Self {
            step: step.to_string(),
            kind,
            segments,
        })
    }

    /// Render back to the `steps.*` reference form for error messages.
    pub fn reference(&self) -> String {
        let mut out = format!(
            "steps.{}.{}",
            self.step,
            match self.kind {
                PointerKind::Lines => "lines",
                PointerKind::Json => "json",
            }
        );
        for segment in &self.segments {
            out.push('.');
            out.push_str(segment);
        }
        out
    }
}

/// Branch targets for the `on` block. Values are step names or `_end`.
#[derive(Debug, Clone, Default)]
pub struct Handlers {
    pub success: Option<String>,
    pub failure: Option<String>,
    pub always: Option<String>,
}

impl Handlers {
    pub fn is_empty(&self) -> bool {
        self.success.is_none() && self.failure.is_none() && self.always.is_none()
    }
}

/// Reserved goto target that completes the run.
pub const GOTO_END: &str = "_end";

/// A `when` condition.
#[derive(Debug, Clone)]
pub enum Condition {
    /// String comparison after coercion of both sides.
    Equals { left: String, right: String },
    /// Glob matches at least one path.
    Exists { glob: String },
    /// Glob matches nothing.
    NotExists { glob: String },
}
