//! Workflow DSL: YAML schema, version gating, loading and validation
//!
//! The loader is strict: unknown fields, deprecated fields, bad goto targets
//! and version-gated features all reject the workflow at load time with
//! exit 2, before any run directory exists.

pub mod loader;
pub mod schema;
pub mod version;

pub use loader::{load_workflow, load_workflow_str};
pub use version::Version;
