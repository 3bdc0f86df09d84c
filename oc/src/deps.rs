//! Dependency resolver
//!
//! Expands POSIX-style globs (`*`, `?`; globstar is rejected) relative to the
//! workspace. Variables are substituted before expansion, matches falling
//! outside the workspace are dropped by the path gate, and results are
//! sorted byte-wise so every run sees the same order.

use glob::MatchOptions;
use std::path::Path;
use tracing::debug;

use crate::error::{EXIT_INVALID, ErrorKind, StepError};
use crate::domain::workflow::DependsOn;
use crate::paths;
use crate::vars::{Scope, substitute};

/// Dependency matches for one step, workspace-relative and sorted.
#[derive(Debug, Default, Clone)]
pub struct ResolvedDeps {
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl ResolvedDeps {
    /// All matched paths, required first, preserving each list's order.
    pub fn all(&self) -> Vec<String> {
        let mut all = self.required.clone();
        all.extend(self.optional.iter().cloned());
        all
    }
}

/// Expand one already-substituted pattern. Hidden names match only when the
/// pattern component explicitly starts with a dot; case sensitivity follows
/// the host filesystem's actual entries.
pub fn expand_pattern(workspace: &Path, pattern: &str) -> Result<Vec<String>, StepError> {
    paths::check_lexical(pattern).map_err(|e| {
        StepError::new(
            ErrorKind::Validation,
            format!("unsafe glob pattern '{pattern}': {e}"),
            EXIT_INVALID,
        )
    })?;
    if pattern.contains("**") {
        return Err(StepError::new(
            ErrorKind::Validation,
            format!("globstar is not supported: '{pattern}'"),
            EXIT_INVALID,
        ));
    }

    let full = workspace.join(pattern);
    let full = full.to_string_lossy();
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };

    let entries = glob::glob_with(&full, options).map_err(|e| {
        StepError::new(
            ErrorKind::Validation,
            format!("invalid glob pattern '{pattern}': {e}"),
            EXIT_INVALID,
        )
    })?;

    let mut matches = Vec::new();
    for entry in entries.flatten() {
        let relative = paths::workspace_relative(workspace, &entry);
        // Symlinks are followed; drop anything whose target escapes.
        if paths::safe_join(workspace, &relative).is_ok() {
            matches.push(relative);
        } else {
            debug!(path = %relative, "dropping unsafe glob match");
        }
    }

    matches.sort();
    matches.dedup();
    Ok(matches)
}

/// Substitute and expand one pattern; unresolved variables fail the step.
pub fn expand_with_scope(
    workspace: &Path,
    pattern: &str,
    scope: &Scope,
) -> Result<Vec<String>, StepError> {
    let substituted = substitute(pattern, scope);
    if !substituted.unresolved.is_empty() {
        return Err(StepError::undefined_vars(substituted.unresolved));
    }
    expand_pattern(workspace, &substituted.text)
}

/// Resolve a step's `depends_on` block. Any required pattern with zero
/// matches fails the step, recording every unmatched pattern.
pub fn resolve_step_deps(
    workspace: &Path,
    depends_on: &DependsOn,
    scope: &Scope,
) -> Result<ResolvedDeps, StepError> {
    let mut resolved = ResolvedDeps::default();
    let mut failed: Vec<String> = Vec::new();

    for pattern in &depends_on.required {
        let substituted = substitute(pattern, scope);
        if !substituted.unresolved.is_empty() {
            return Err(StepError::undefined_vars(substituted.unresolved));
        }
        let matches = expand_pattern(workspace, &substituted.text)?;
        if matches.is_empty() {
            debug!(pattern = %substituted.text, "required dependency matched nothing");
            failed.push(substituted.text);
        } else {
            resolved.required.extend(matches);
        }
    }

    for pattern in &depends_on.optional {
        let substituted = substitute(pattern, scope);
        if !substituted.unresolved.is_empty() {
            return Err(StepError::undefined_vars(substituted.unresolved));
        }
        // Optional patterns contribute nothing when unmatched.
        resolved.optional.extend(expand_pattern(workspace, &substituted.text)?);
    }

    if !failed.is_empty() {
        return Err(StepError::failed_deps(failed));
    }

    resolved.required.sort();
    resolved.required.dedup();
    resolved.optional.sort();
    resolved.optional.dedup();
    Ok(resolved)
}
