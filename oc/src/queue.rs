//! Queue hygiene helpers
//!
//! The inbox/processed/failed queue convention is a protocol between
//! workflow authors and producers; the orchestrator only touches those
//! directories through the guarded CLI operations here (and through the
//! v1.2 lifecycle in the for-each engine). Archiving delegates to the
//! external `zip` collaborator as a child process.

use eyre::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::paths;

/// Remove `*.task` and `*.tmp` files from the processed directory. Refused
/// unless the directory resolves inside the workspace.
pub fn clean_processed(workspace: &Path, processed_dir: &str) -> Result<usize> {
    let dir = paths::safe_join(workspace, processed_dir)
        .map_err(|e| eyre::eyre!("--clean-processed refused: {e}"))?;
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "processed directory absent, nothing to clean");
        return Ok(0);
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".task") || name.ends_with(".tmp") {
            std::fs::remove_file(entry.path())
                .with_context(|| format!("failed to remove {name}"))?;
            removed += 1;
        }
    }

    info!(dir = %dir.display(), removed, "cleaned processed directory");
    Ok(removed)
}

/// Zip the processed directory to `destination`. Destinations inside the
/// processed directory itself are refused (the archive would try to include
/// itself).
pub async fn archive_processed(
    workspace: &Path,
    processed_dir: &str,
    destination: &Path,
) -> Result<()> {
    let processed = paths::safe_join(workspace, processed_dir)
        .map_err(|e| eyre::eyre!("--archive-processed refused: {e}"))?;
    if !processed.is_dir() {
        bail!("processed directory '{processed_dir}' does not exist");
    }

    let processed_real = processed
        .canonicalize()
        .context("cannot resolve processed directory")?;
    let dest_parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let dest_parent_real = dest_parent
        .canonicalize()
        .unwrap_or_else(|_| dest_parent.to_path_buf());
    if dest_parent_real.starts_with(&processed_real) {
        bail!(
            "--archive-processed refused: destination {} is inside the processed directory",
            destination.display()
        );
    }

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).context("cannot create archive destination dir")?;
    }

    let output = tokio::process::Command::new("zip")
        .arg("-r")
        .arg("-q")
        .arg(destination)
        .arg(processed_dir)
        .current_dir(workspace)
        .output()
        .await
        .context("failed to spawn zip")?;

    if !output.status.success() {
        bail!(
            "zip exited with {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    info!(archive = %destination.display(), "archived processed directory");
    Ok(())
}

/// Default archive destination for a run.
pub fn default_archive_path(run_root: &Path) -> PathBuf {
    run_root.join("processed.zip")
}
