//! Path safety gate
//!
//! Every path named by a workflow resolves relative to the workspace root and
//! must stay inside it. The gate runs at load time over declared paths and
//! again immediately before each filesystem operation, after variable
//! substitution.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Why a path was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("absolute paths are not allowed: {path}")]
    Absolute { path: String },

    #[error("path contains a parent ('..') segment: {path}")]
    ParentEscape { path: String },

    #[error("path resolves outside the workspace: {path}")]
    EscapesWorkspace { path: String },

    #[error("cannot resolve path {path}: {message}")]
    Unresolvable { path: String, message: String },
}

/// Textual checks only: empty, absolute, and `..` segments. Used by the
/// loader on declared paths that still contain `${...}` placeholders, where
/// filesystem resolution is not yet possible.
pub fn check_lexical(raw: &str) -> Result<(), PathError> {
    if raw.is_empty() {
        return Err(PathError::Empty);
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(PathError::Absolute { path: raw.to_string() });
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(PathError::ParentEscape { path: raw.to_string() });
        }
    }
    Ok(())
}

/// Full gate: lexical checks plus symlink resolution. Returns the absolute
/// in-workspace path. The target itself may not exist yet (output files);
/// the deepest existing ancestor is canonicalized and the remainder
/// re-appended before the prefix check.
pub fn safe_join(workspace: &Path, raw: &str) -> Result<PathBuf, PathError> {
    check_lexical(raw)?;

    let joined = workspace.join(raw);
    let workspace_real = workspace.canonicalize().map_err(|e| PathError::Unresolvable {
        path: workspace.display().to_string(),
        message: e.to_string(),
    })?;

    let resolved = resolve_existing_prefix(&joined)?;
    if !resolved.starts_with(&workspace_real) {
        debug!(path = raw, resolved = %resolved.display(), "path escapes workspace");
        return Err(PathError::EscapesWorkspace { path: raw.to_string() });
    }

    Ok(joined)
}

/// Render an absolute in-workspace path as the workspace-relative string form
/// stored in the run document.
pub fn workspace_relative(workspace: &Path, path: &Path) -> String {
    path.strip_prefix(workspace)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// non-existing remainder. Follows symlinks on the existing part.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf, PathError> {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(real) => {
                let mut result = real;
                for part in remainder.iter().rev() {
                    result.push(part);
                }
                return Ok(result);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match (existing.file_name(), existing.parent()) {
                    (Some(name), Some(parent)) => {
                        remainder.push(name.to_os_string());
                        existing = parent.to_path_buf();
                    }
                    _ => {
                        return Err(PathError::Unresolvable {
                            path: path.display().to_string(),
                            message: "no existing ancestor".to_string(),
                        });
                    }
                }
            }
            Err(e) => {
                return Err(PathError::Unresolvable {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
}
