//! Orchestrate - deterministic YAML workflow engine
//!
//! Executes declarative, single-threaded workflows: ordered steps that spawn
//! child processes (raw commands or LLM-CLI providers), block on filesystem
//! predicates, or iterate over data produced by earlier steps. State is
//! durable and runs are crash-resumable.
//!
//! # Core Concepts
//!
//! - **Deterministic by construction**: glob results are sorted, variable
//!   substitution is single-pass, and step results persist in program order
//! - **State in one document**: every transition is an atomic rename of
//!   `state.json`; a resumed run replays only non-terminal steps
//! - **Paths never escape**: every declared path passes the safety gate at
//!   load time and again before each filesystem operation
//! - **Exit codes are the contract**: 0 success, 1 retryable, 2 invalid
//!   input, 124 timeout
//!
//! # Modules
//!
//! - [`dsl`] - YAML schema, version gates, loading and validation
//! - [`vars`] - variable scopes and `${...}` substitution
//! - [`interp`] - the control-flow interpreter and for-each engine
//! - [`runner`] - child process lifecycle, retries, timeouts
//! - [`capture`] - stdout capture pipeline (text/lines/json)
//! - [`state`] - durable run documents over the `runstore` crate

pub mod cancel;
pub mod capture;
pub mod cli;
pub mod config;
pub mod deps;
pub mod domain;
pub mod dsl;
pub mod error;
pub mod inject;
pub mod interp;
pub mod paths;
pub mod queue;
pub mod runner;
pub mod state;
pub mod vars;
pub mod waitfor;

// Re-export commonly used types
pub use cancel::{CancelSource, CancelToken};
pub use capture::{CaptureMode, CaptureOutcome};
pub use config::{OnErrorPolicy, Settings};
pub use domain::run::{RunDocument, RunStatus, StepEntry, StepResult, StepStatus};
pub use domain::workflow::{Step, StepKind, Workflow};
pub use dsl::{Version, load_workflow};
pub use error::{ErrorKind, StepError, ValidationError};
pub use interp::{Interpreter, RunOutcome};
pub use state::RunState;
