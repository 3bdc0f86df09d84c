//! Raw YAML document types
//!
//! Mirrors the on-disk DSL one-to-one. All structs deny unknown fields so a
//! typo rejects the workflow instead of silently doing nothing. Version
//! gating and cross-field rules live in the loader, not here.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWorkflow {
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub strict_flow: Option<bool>,
    #[serde(default)]
    pub providers: BTreeMap<String, RawProvider>,
    #[serde(default)]
    pub queues: Option<RawQueues>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawProvider {
    pub template: Vec<String>,
    #[serde(default)]
    pub input_mode: Option<RawInputMode>,
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawInputMode {
    Argv,
    Stdin,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawQueues {
    #[serde(default)]
    pub inbox: Option<String>,
    #[serde(default)]
    pub processed: Option<String>,
    #[serde(default)]
    pub failed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStep {
    pub name: String,

    // Step kind - exactly one must be present.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub provider_params: Option<Map<String, Value>>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub wait_for: Option<RawWaitFor>,
    #[serde(default)]
    pub for_each: Option<RawForEach>,

    /// Accepted by the parser so the loader can reject it with a precise
    /// deprecation error instead of a generic unknown-field one.
    #[serde(default)]
    pub command_override: Option<Value>,

    #[serde(default)]
    pub input_file: Option<String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub output_capture: Option<RawCaptureMode>,
    #[serde(default)]
    pub allow_parse_error: Option<bool>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub output_require: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub secrets: Option<Vec<String>>,
    #[serde(default)]
    pub depends_on: Option<RawDependsOn>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retries: Option<RawRetries>,
    #[serde(default)]
    pub when: Option<RawWhen>,
    #[serde(default)]
    pub on: Option<RawHandlers>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawCaptureMode {
    Text,
    Lines,
    Json,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDependsOn {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub inject: Option<RawInject>,
}

/// `inject: true` shorthand or the full policy object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawInject {
    Flag(bool),
    Policy(RawInjectPolicy),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawInjectPolicy {
    #[serde(default)]
    pub mode: Option<RawInjectMode>,
    #[serde(default)]
    pub position: Option<RawInjectPosition>,
    #[serde(default)]
    pub instruction: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawInjectMode {
    List,
    Content,
    None,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawInjectPosition {
    Prepend,
    Append,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRetries {
    pub max: u32,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWaitFor {
    pub glob: String,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub poll_ms: Option<u64>,
    #[serde(default)]
    pub min_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawForEach {
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    #[serde(default)]
    pub items_from: Option<String>,
    #[serde(rename = "as", default)]
    pub alias: Option<String>,
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub on_item_complete: Option<RawLifecycle>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLifecycle {
    #[serde(default)]
    pub success: Option<RawLifecycleAction>,
    #[serde(default)]
    pub failure: Option<RawLifecycleAction>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLifecycleAction {
    pub move_to: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWhen {
    #[serde(default)]
    pub equals: Option<RawEquals>,
    #[serde(default)]
    pub exists: Option<String>,
    #[serde(default)]
    pub not_exists: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEquals {
    pub left: String,
    pub right: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHandlers {
    #[serde(default)]
    pub success: Option<RawHandler>,
    #[serde(default)]
    pub failure: Option<RawHandler>,
    #[serde(default)]
    pub always: Option<RawHandler>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHandler {
    pub goto: String,
}
