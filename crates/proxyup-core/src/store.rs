//! Identity state storage
//!
//! Keeps the identity record as pretty-printed JSON so it survives restarts
//! of the supervisor and stays readable in a diff.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::identity::{IdentityRecord, PersistedIdentity};

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persisted identity state at a fixed path
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted state.
    ///
    /// Never fails: a missing file yields empty state silently, any other
    /// read or parse problem is logged and also yields empty state.
    pub fn load(&self) -> PersistedIdentity {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted state, starting fresh");
                return PersistedIdentity::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read state file, starting fresh");
                return PersistedIdentity::default();
            }
        };

        match serde_json::from_str(&json) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse state file, starting fresh");
                PersistedIdentity::default()
            }
        }
    }

    /// Replace the state file with the full current record.
    ///
    /// Fields already in the file that the record does not manage are kept.
    pub fn persist(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let mut snapshot = record.to_persisted();

        // Pick up foreign keys written since we loaded
        let on_disk = self.load();
        for (key, value) in on_disk.extra {
            snapshot.extra.entry(key).or_insert(value);
        }

        let json = serde_json::to_string_pretty(&snapshot)?;
        write_atomic(&self.path, json.as_bytes())
    }
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, contents).map_err(io_err)?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(e));
    }
    Ok(())
}
