//! Engine error taxonomy and exit-code contract
//!
//! Exit codes are part of the wire contract with child processes and the CLI:
//! 0 success, 1 retryable execution failure, 2 non-retryable invalid input,
//! 124 timeout.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Exit code for validation and other non-retryable input errors.
pub const EXIT_INVALID: i32 = 2;
/// Exit code recorded when a step times out or is cancelled during a wait.
pub const EXIT_TIMEOUT: i32 = 124;
/// Synthetic exit code for a child interrupted by user cancellation.
pub const EXIT_CANCELLED: i32 = 130;

/// Broad classification of a step failure, persisted in the run document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Substitution,
    Dependency,
    Secrets,
    Execution,
    Timeout,
    Capture,
    State,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Substitution => "substitution",
            Self::Dependency => "dependency",
            Self::Secrets => "secrets",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Capture => "capture",
            Self::State => "state",
        };
        write!(f, "{s}")
    }
}

/// Structured failure record attached to a step result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stdout_tail: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
    /// Kind-specific details, e.g. `failed_deps`, `missing_secrets`,
    /// `missing_placeholders`.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code,
            stdout_tail: Vec::new(),
            stderr_tail: Vec::new(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_tails(mut self, stdout_tail: Vec<String>, stderr_tail: Vec<String>) -> Self {
        self.stdout_tail = stdout_tail;
        self.stderr_tail = stderr_tail;
        self
    }

    pub fn failed_deps(patterns: Vec<String>) -> Self {
        Self::new(
            ErrorKind::Dependency,
            format!("required dependency matched no files: {}", patterns.join(", ")),
            EXIT_INVALID,
        )
        .with_context(json!({ "failed_deps": patterns }))
    }

    pub fn missing_secrets(names: Vec<String>) -> Self {
        Self::new(
            ErrorKind::Secrets,
            format!("missing secret environment variables: {}", names.join(", ")),
            EXIT_INVALID,
        )
        .with_context(json!({ "missing_secrets": names }))
    }

    pub fn missing_placeholders(keys: Vec<String>) -> Self {
        Self::new(
            ErrorKind::Substitution,
            format!("unresolved placeholders: {}", keys.join(", ")),
            EXIT_INVALID,
        )
        .with_context(json!({ "missing_placeholders": keys }))
    }

    pub fn undefined_vars(keys: Vec<String>) -> Self {
        Self::new(
            ErrorKind::Substitution,
            format!("undefined variables: {}", keys.join(", ")),
            EXIT_INVALID,
        )
        .with_context(json!({ "undefined_vars": keys }))
    }

    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        let reference = reference.into();
        let reason = reason.into();
        Self::new(
            ErrorKind::Substitution,
            format!("invalid reference '{reference}': {reason}"),
            EXIT_INVALID,
        )
        .with_context(json!({ "invalid_reference": reference, "reason": reason }))
    }

    pub fn timeout(timeout_sec: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("step timed out after {timeout_sec}s"),
            EXIT_TIMEOUT,
        )
        .with_context(json!({ "timed_out": true }))
    }

    pub fn invalid_prompt_placeholder() -> Self {
        Self::new(
            ErrorKind::Validation,
            "${PROMPT} is not allowed in a stdin-mode provider template",
            EXIT_INVALID,
        )
        .with_context(json!({ "invalid_prompt_placeholder": true }))
    }
}

/// Load-time workflow rejection. Always maps to process exit 2.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("failed to read workflow: {0}")]
    Read(#[from] std::io::Error),

    #[error("workflow is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported workflow version '{version}'")]
    UnsupportedVersion { version: String },

    #[error("step '{step}': field '{field}' requires version >= {required}")]
    VersionGated {
        step: String,
        field: String,
        required: String,
    },

    #[error("step '{step}': exactly one of provider, command, wait_for, for_each must be set")]
    StepKind { step: String },

    #[error("step '{step}': field '{field}' is deprecated and no longer accepted")]
    Deprecated { step: String, field: String },

    #[error("duplicate step name '{step}' in {scope}")]
    DuplicateStep { step: String, scope: String },

    #[error("step '{step}': goto target '{target}' does not name a reachable step")]
    UnknownGoto { step: String, target: String },

    #[error("step '{step}': unknown provider '{provider}'")]
    UnknownProvider { step: String, provider: String },

    #[error("provider '{provider}': stdin input mode must not reference ${{PROMPT}}")]
    PromptInStdinTemplate { provider: String },

    #[error("the env.* namespace cannot be referenced: found '{token}' in {location}")]
    EnvReference { token: String, location: String },

    #[error("{location}: unsafe path '{path}': {reason}")]
    UnsafePath {
        location: String,
        path: String,
        reason: String,
    },

    #[error("step '{step}': {message}")]
    Step { step: String, message: String },

    #[error("{0}")]
    Workflow(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_failed_deps_context() {
        let err = StepError::failed_deps(vec!["data/missing.csv".to_string()]);

        assert_eq!(err.exit_code, EXIT_INVALID);
        assert_eq!(err.kind, ErrorKind::Dependency);
        assert_eq!(err.context["failed_deps"][0], "data/missing.csv");
    }

    #[test]
    fn test_step_error_serde_roundtrip() {
        let err = StepError::missing_secrets(vec!["API_KEY".to_string()]);
        let json = serde_json::to_string(&err).unwrap();
        let back: StepError = serde_json::from_str(&json).unwrap();

        assert_eq!(back.kind, ErrorKind::Secrets);
        assert_eq!(back.context["missing_secrets"][0], "API_KEY");
    }

    #[test]
    fn test_timeout_context() {
        let err = StepError::timeout(30);
        assert_eq!(err.exit_code, EXIT_TIMEOUT);
        assert_eq!(err.context["timed_out"], true);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Validation.to_string(), "validation");
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::VersionGated {
            step: "Deploy".to_string(),
            field: "depends_on.inject".to_string(),
            required: "1.1.1".to_string(),
        };
        assert!(err.to_string().contains("depends_on.inject"));
        assert!(err.to_string().contains("1.1.1"));
    }
}
