//! Core DocumentStore implementation

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// How many backup copies of a document are retained.
pub const BACKUP_RETENTION: usize = 3;

/// Errors raised by a [`DocumentStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {path}")]
    Missing { path: PathBuf },

    #[error("document is corrupt: {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no valid backup found for {path}")]
    NoValidBackup { path: PathBuf },
}

/// Stores one JSON document of type `T` at a fixed path.
///
/// Saves are atomic: serialize, write to a sibling temp file, fsync, rename.
/// The document is never edited in place.
#[derive(Debug, Clone)]
pub struct DocumentStore<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> DocumentStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Bind a store to a document path. The parent directory must exist
    /// before the first save.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        debug!(path = %path.display(), "DocumentStore::open");
        Self {
            path,
            _marker: PhantomData,
        }
    }

    /// The document path this store is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the document exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomically persist the document.
    pub fn save(&self, document: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(document).map_err(StoreError::Encode)?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "saved document");
        Ok(())
    }

    /// Load and parse the document.
    pub fn load(&self) -> Result<T, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Copy the current document to `<path>.<label>.bak`, keeping only the
    /// most recent [`BACKUP_RETENTION`] backups. Backups are copies, never
    /// renames: the live document stays in place.
    pub fn backup(&self, label: &str) -> Result<PathBuf, StoreError> {
        let backup_path = self.backup_path(label);
        fs::copy(&self.path, &backup_path)?;
        debug!(backup = %backup_path.display(), "wrote backup");

        self.prune_backups()?;
        Ok(backup_path)
    }

    /// Newest backup whose contents still parse as `T`. Used for repair when
    /// the live document is corrupt.
    pub fn latest_valid_backup(&self) -> Result<(PathBuf, T), StoreError> {
        let mut backups = self.list_backups()?;
        // Newest first
        backups.reverse();

        for path in backups {
            match fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<T>(&text) {
                    Ok(document) => return Ok((path, document)),
                    Err(e) => {
                        warn!(backup = %path.display(), error = %e, "backup does not parse, skipping");
                    }
                },
                Err(e) => {
                    warn!(backup = %path.display(), error = %e, "backup unreadable, skipping");
                }
            }
        }

        Err(StoreError::NoValidBackup {
            path: self.path.clone(),
        })
    }

    /// Replace the live document with the newest valid backup.
    pub fn restore_latest_backup(&self) -> Result<T, StoreError> {
        let (backup_path, document) = self.latest_valid_backup()?;
        self.save(&document)?;
        debug!(backup = %backup_path.display(), "restored document from backup");
        Ok(document)
    }

    fn backup_path(&self, label: &str) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.path.with_file_name(format!("{file_name}.{label}.bak"))
    }

    /// All backups for this document, oldest first (by modification time).
    fn list_backups(&self) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let prefix = format!("{file_name}.");

        let mut backups = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".bak") {
                let modified = entry.metadata()?.modified()?;
                backups.push((modified, entry.path()));
            }
        }

        backups.sort();
        Ok(backups.into_iter().map(|(_, p)| p).collect())
    }

    fn prune_backups(&self) -> Result<(), StoreError> {
        let backups = self.list_backups()?;
        if backups.len() > BACKUP_RETENTION {
            for stale in &backups[..backups.len() - BACKUP_RETENTION] {
                debug!(backup = %stale.display(), "pruning stale backup");
                fs::remove_file(stale)?;
            }
        }
        Ok(())
    }
}
