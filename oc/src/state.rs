//! Run-state persistence
//!
//! Layers the run-document semantics over the generic [`runstore`] document
//! store: run-root layout, per-step backups, and the resume paths (checksum
//! comparison, `--repair` rollback to the newest valid backup,
//! `--force-restart` fresh run).

use eyre::{Context, Result, bail};
use runstore::{DocumentStore, StoreError};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::domain::run::{RunDocument, SCHEMA_VERSION, generate_run_id};
use crate::domain::workflow::Workflow;

/// Handle to one run's durable state.
#[derive(Debug)]
pub struct RunState {
    pub doc: RunDocument,
    store: DocumentStore<RunDocument>,
    pub run_root: PathBuf,
}

impl RunState {
    /// Create a fresh run: new run id, run-root layout, initial document.
    pub fn create(
        settings: &Settings,
        workflow: &Workflow,
        context: Map<String, Value>,
    ) -> Result<Self> {
        let run_id = generate_run_id();
        let run_root = settings.runs_dir().join(&run_id);
        std::fs::create_dir_all(run_root.join("logs")).context("failed to create run logs dir")?;
        std::fs::create_dir_all(run_root.join("artifacts"))
            .context("failed to create run artifacts dir")?;

        let doc = RunDocument::new(
            &run_id,
            &workflow.name,
            &workflow.source_path,
            &workflow.checksum,
            context,
        );
        let store = DocumentStore::open(run_root.join("state.json"));
        store.save(&doc).context("failed to write initial run state")?;

        info!(run_id = %run_id, run_root = %run_root.display(), "created run");
        Ok(Self { doc, store, run_root })
    }

    /// Resume an existing run. A corrupt document or a workflow checksum
    /// mismatch is recovered via `--repair` (newest valid backup) or
    /// `--force-restart` (fresh run id); otherwise it is fatal.
    pub fn resume(
        settings: &Settings,
        run_id: &str,
        workflow: &Workflow,
        repair: bool,
        force_restart: bool,
    ) -> Result<Self> {
        let run_root = settings.runs_dir().join(run_id);
        let store: DocumentStore<RunDocument> = DocumentStore::open(run_root.join("state.json"));

        let loaded = match store.load() {
            Ok(doc) => {
                if doc.schema_version != SCHEMA_VERSION {
                    warn!(run_id, found = %doc.schema_version, "unexpected state schema version");
                    None
                } else if doc.workflow_checksum != workflow.checksum {
                    warn!(run_id, "workflow checksum does not match run state");
                    None
                } else {
                    Some(doc)
                }
            }
            Err(StoreError::Missing { path }) => {
                bail!("run '{run_id}' not found (no state at {})", path.display());
            }
            Err(StoreError::Corrupt { path, source }) => {
                warn!(run_id, path = %path.display(), error = %source, "run state is corrupt");
                None
            }
            Err(e) => return Err(e).context("failed to load run state"),
        };

        if let Some(doc) = loaded {
            info!(run_id, status = %doc.status, "resuming run");
            return Ok(Self { doc, store, run_root });
        }

        if repair {
            match store.restore_latest_backup() {
                Ok(doc) if doc.workflow_checksum == workflow.checksum => {
                    info!(run_id, "repaired run state from backup");
                    return Ok(Self { doc, store, run_root });
                }
                Ok(_) => {
                    bail!(
                        "repair found a backup for run '{run_id}', but it belongs to a \
                         different workflow; use --force-restart"
                    );
                }
                Err(e) => {
                    bail!("repair failed for run '{run_id}': {e}; use --force-restart");
                }
            }
        }

        if force_restart {
            info!(run_id, "force-restart: starting a fresh run");
            return Self::create(settings, workflow, workflow.context.clone());
        }

        bail!(
            "run '{run_id}' state is corrupt or belongs to a different workflow; \
             pass --repair or --force-restart"
        );
    }

    /// Persist the document: bump `updated_at`, then atomic write-and-rename.
    pub fn persist(&mut self) -> Result<()> {
        self.doc.touch();
        self.store
            .save(&self.doc)
            .context("failed to persist run state")
    }

    /// Copy the current document aside before a step runs. Backup file names
    /// carry the step name; the last three are retained.
    pub fn backup_before_step(&self, step_label: &str) {
        if !self.store.exists() {
            return;
        }
        let label = format!("step_{}", sanitize_label(step_label));
        if let Err(e) = self.store.backup(&label) {
            warn!(step = step_label, error = %e, "state backup failed");
        } else {
            debug!(step = step_label, "state backed up");
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_root.join("logs")
    }
}

/// Keep backup file names filesystem-safe.
fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

/// Delete the oldest run roots beyond the newest `keep`.
pub fn prune_runs(runs_dir: &Path, keep: usize) -> Result<usize> {
    if !runs_dir.exists() {
        return Ok(0);
    }

    let mut runs: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(runs_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            runs.push((entry.metadata()?.modified()?, entry.path()));
        }
    }
    runs.sort();

    let mut removed = 0;
    if runs.len() > keep {
        for (_, path) in &runs[..runs.len() - keep] {
            info!(run_root = %path.display(), "pruning old run");
            std::fs::remove_dir_all(path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::loader::{checksum_hex, load_workflow_str};
    use tempfile::tempdir;

    const YAML: &str = r#"
version: "1.1"
name: smoke
steps:
  - name: Hello
    command: echo hello
"#;

    fn fixture(dir: &Path) -> (Settings, Workflow) {
        let settings = Settings::new(dir.to_path_buf());
        let workflow = load_workflow_str(YAML, checksum_hex(YAML.as_bytes()), dir).unwrap();
        (settings, workflow)
    }

    #[test]
    fn test_create_lays_out_run_root() {
        let temp = tempdir().unwrap();
        let (settings, workflow) = fixture(temp.path());

        let state = RunState::create(&settings, &workflow, Map::new()).unwrap();

        assert!(state.run_root.join("state.json").exists());
        assert!(state.run_root.join("logs").is_dir());
        assert!(state.run_root.join("artifacts").is_dir());
        assert_eq!(state.doc.schema_version, SCHEMA_VERSION);
        assert_eq!(state.doc.workflow_checksum, workflow.checksum);
    }

    #[test]
    fn test_resume_roundtrip() {
        let temp = tempdir().unwrap();
        let (settings, workflow) = fixture(temp.path());

        let mut state = RunState::create(&settings, &workflow, Map::new()).unwrap();
        let run_id = state.doc.run_id.clone();
        state.persist().unwrap();

        let resumed = RunState::resume(&settings, &run_id, &workflow, false, false).unwrap();
        assert_eq!(resumed.doc.run_id, run_id);
    }

    #[test]
    fn test_resume_unknown_run_fails() {
        let temp = tempdir().unwrap();
        let (settings, workflow) = fixture(temp.path());

        let err = RunState::resume(&settings, "nope", &workflow, false, false).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_checksum_mismatch_requires_flag() {
        let temp = tempdir().unwrap();
        let (settings, workflow) = fixture(temp.path());

        let state = RunState::create(&settings, &workflow, Map::new()).unwrap();
        let run_id = state.doc.run_id.clone();

        let edited = YAML.replace("echo hello", "echo changed");
        let changed = load_workflow_str(&edited, checksum_hex(edited.as_bytes()), temp.path()).unwrap();

        let err = RunState::resume(&settings, &run_id, &changed, false, false).unwrap_err();
        assert!(err.to_string().contains("--repair") || err.to_string().contains("--force-restart"));
    }

    #[test]
    fn test_corrupt_state_repaired_from_backup() {
        let temp = tempdir().unwrap();
        let (settings, workflow) = fixture(temp.path());

        let mut state = RunState::create(&settings, &workflow, Map::new()).unwrap();
        let run_id = state.doc.run_id.clone();
        state.persist().unwrap();
        state.backup_before_step("Hello");

        std::fs::write(state.run_root.join("state.json"), "{broken").unwrap();

        let repaired = RunState::resume(&settings, &run_id, &workflow, true, false).unwrap();
        assert_eq!(repaired.doc.run_id, run_id);
    }

    #[test]
    fn test_force_restart_gets_new_run_id() {
        let temp = tempdir().unwrap();
        let (settings, workflow) = fixture(temp.path());

        let state = RunState::create(&settings, &workflow, Map::new()).unwrap();
        let run_id = state.doc.run_id.clone();
        std::fs::write(state.run_root.join("state.json"), "{broken").unwrap();

        let fresh = RunState::resume(&settings, &run_id, &workflow, false, true).unwrap();
        assert_ne!(fresh.doc.run_id, run_id);
        assert!(fresh.run_root.join("state.json").exists());
    }

    #[test]
    fn test_prune_runs_keeps_newest() {
        let temp = tempdir().unwrap();
        let runs = temp.path().join("runs");
        for i in 0..5 {
            let dir = runs.join(format!("run-{i}"));
            std::fs::create_dir_all(&dir).unwrap();
            // Stagger mtimes so ordering is deterministic
            std::thread::sleep(std::time::Duration::from_millis(10));
            std::fs::write(dir.join("state.json"), "{}").unwrap();
        }

        let removed = prune_runs(&runs, 2).unwrap();
        assert_eq!(removed, 3);
        assert!(!runs.join("run-0").exists());
        assert!(runs.join("run-3").exists());
        assert!(runs.join("run-4").exists());
    }
}
