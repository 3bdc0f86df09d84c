//! Domain types shared across the engine
//!
//! - [`workflow`] - the immutable workflow loaded from YAML
//! - [`run`] - the durable run document and step results

pub mod run;
pub mod workflow;

pub use run::{
    IterationEntry, LifecycleRecord, LoopState, RunDocument, RunStatus, SCHEMA_VERSION, StepEntry,
    StepResult, StepStatus, generate_run_id, now_ms,
};
pub use workflow::{
    Condition, DependsOn, ForEachSpec, Handlers, InjectMode, InjectPolicy, InjectPosition, InputMode,
    ItemsPointer, Lifecycle, LifecycleAction, PointerKind, ProviderTemplate, QueueDefaults, RetryPolicy,
    Step, StepKind, WaitSpec, Workflow,
};
