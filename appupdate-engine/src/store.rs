//! On-disk update state
//!
//! Layout under the update root:
//!
//! ```text
//! <update_dir>/
//! ├── update.status        single line status token
//! ├── active-update.json   ready/downloading records, history, attempts
//! ├── patch/update.mar     ready-to-apply patch
//! └── downloading/update.mar
//! ```
//!
//! Reads never fail: anything missing, unreadable or unparseable comes back
//! as `none` or as an absent record. Writes go to a temp file in the same
//! directory and are renamed over the canonical path.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::record::{MarRole, UpdateRecord};
use crate::status::StatusToken;

/// Name of the status marker file
pub const STATUS_FILE: &str = "update.status";
/// Name of the update metadata document
pub const METADATA_FILE: &str = "active-update.json";
/// Name of the patch file inside a role directory
pub const MAR_FILE: &str = "update.mar";

/// Everything the store persists, as one value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Contents of the status marker; not part of the metadata document
    #[serde(skip)]
    pub status: StatusToken,

    /// Update whose patch is fully downloaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<UpdateRecord>,

    /// Update currently being fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloading: Option<UpdateRecord>,

    /// Finished updates, newest first
    #[serde(default)]
    pub history: Vec<UpdateRecord>,

    /// Consecutive failed download attempts
    #[serde(default)]
    pub download_attempts: u32,
}

/// Reads and writes the status marker, the metadata document and the
/// patch directories of one update root.
#[derive(Debug, Clone)]
pub struct PersistedStateStore {
    root: PathBuf,
}

impl PersistedStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn patch_dir(&self, role: MarRole) -> PathBuf {
        self.root.join(role.dir_name())
    }

    /// Canonical mar location for a role.
    pub fn mar_path(&self, role: MarRole) -> PathBuf {
        self.patch_dir(role).join(MAR_FILE)
    }

    /// Whether the mar for `role` exists on disk.
    pub fn patch_mar_exists(&self, role: MarRole) -> bool {
        self.mar_path(role).is_file()
    }

    /// Read the status marker and the metadata document independently.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn read(&self) -> PersistedState {
        let mut state = self.read_metadata();
        state.status = self.read_status();
        debug!(
            status = %state.status,
            ready = state.ready.is_some(),
            downloading = state.downloading.is_some(),
            history = state.history.len(),
            "Read persisted update state"
        );
        state
    }

    /// Read only the status marker.
    pub fn read_status(&self) -> StatusToken {
        let path = self.status_path();
        match fs::read_to_string(&path) {
            Ok(content) => {
                let line = content.lines().next().unwrap_or_default();
                let token = StatusToken::parse(line);
                if let StatusToken::Unrecognized(raw) = &token {
                    warn!(path = %path.display(), raw = %raw, "Unrecognized status marker");
                }
                token
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => StatusToken::None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read status marker");
                StatusToken::None
            }
        }
    }

    fn read_metadata(&self) -> PersistedState {
        let path = self.metadata_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return PersistedState::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read update metadata");
                return PersistedState::default();
            }
        };

        let document: Value = match serde_json::from_str(&content) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) => {
                warn!(path = %path.display(), "Update metadata is not an object, ignoring");
                return PersistedState::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt update metadata, ignoring");
                return PersistedState::default();
            }
        };

        PersistedState {
            status: StatusToken::None,
            ready: parse_entry(&document, "ready"),
            downloading: parse_entry(&document, "downloading"),
            history: parse_entry(&document, "history").unwrap_or_default(),
            download_attempts: parse_entry(&document, "download_attempts").unwrap_or_default(),
        }
    }

    /// Persist the metadata document, then the status marker.
    ///
    /// Each file is replaced atomically; a reader sees either the old or the
    /// new contents of each, never a partial write.
    #[instrument(skip(self, state), fields(status = %state.status))]
    pub fn write(&self, state: &PersistedState) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        let document = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.metadata_path(), &document)?;
        write_atomic(&self.status_path(), format!("{}\n", state.status).as_bytes())?;

        debug!(
            ready = state.ready.is_some(),
            downloading = state.downloading.is_some(),
            "Persisted update state"
        );
        Ok(())
    }

    /// Create the directory for a role and return the mar path inside it.
    pub fn prepare_patch_dir(&self, role: MarRole) -> Result<PathBuf> {
        fs::create_dir_all(self.patch_dir(role))?;
        Ok(self.mar_path(role))
    }

    /// Remove a role directory and everything in it. Missing is fine.
    pub fn remove_patch_dir(&self, role: MarRole) -> Result<()> {
        let dir = self.patch_dir(role);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(dir = %dir.display(), role = %role, "Removed patch directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the downloaded mar into the ready directory, replacing whatever
    /// was there, and drop the downloading directory.
    pub fn promote_downloading(&self) -> Result<PathBuf> {
        self.remove_patch_dir(MarRole::Ready)?;
        let dest = self.prepare_patch_dir(MarRole::Ready)?;
        fs::rename(self.mar_path(MarRole::Downloading), &dest)?;
        self.remove_patch_dir(MarRole::Downloading)?;
        info!(mar = %dest.display(), "Promoted downloaded patch to ready");
        Ok(dest)
    }

    /// Undo [`promote_downloading`](Self::promote_downloading): move the
    /// ready mar back so the download can be reported again.
    pub fn restore_downloading(&self) -> Result<PathBuf> {
        let dest = self.prepare_patch_dir(MarRole::Downloading)?;
        fs::rename(self.mar_path(MarRole::Ready), &dest)?;
        self.remove_patch_dir(MarRole::Ready)?;
        info!(mar = %dest.display(), "Returned patch to downloading directory");
        Ok(dest)
    }
}

fn parse_entry<T: serde::de::DeserializeOwned>(document: &Value, key: &str) -> Option<T> {
    let value = document.get(key)?;
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(entry = key, error = %e, "Corrupt update metadata entry, ignoring");
            None
        }
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PatchKind, PatchRecord};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(version: &str, state: StatusToken) -> UpdateRecord {
        UpdateRecord {
            target_version: version.to_string(),
            state: state.clone(),
            release_notes_uri: None,
            patches: vec![PatchRecord {
                url: format!("https://updates.example.com/{}.mar", version),
                patch_kind: PatchKind::Complete,
                state,
                mar_path: None,
                size: Some(4),
                sha256: None,
                selected: true,
            }],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_root_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path().join("missing"));

        let state = store.read();
        assert_eq!(state, PersistedState::default());
        assert!(!store.patch_mar_exists(MarRole::Ready));
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path());

        let state = PersistedState {
            status: StatusToken::Failed(7),
            ready: Some(record("2.0", StatusToken::Pending)),
            downloading: Some(record("3.0", StatusToken::Downloading)),
            history: vec![record("1.0", StatusToken::Succeeded)],
            download_attempts: 1,
        };
        store.write(&state).unwrap();

        assert_eq!(
            fs::read_to_string(store.status_path()).unwrap(),
            "failed:7\n"
        );
        assert_eq!(store.read(), state);
    }

    #[test]
    fn test_corrupt_files_read_as_none() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path());
        fs::write(store.metadata_path(), "{ not json").unwrap();
        fs::write(store.status_path(), [0xff, 0xfe, 0x00]).unwrap();

        let state = store.read();
        assert_eq!(state.status, StatusToken::None);
        assert!(state.ready.is_none());
        assert!(state.downloading.is_none());
    }

    #[test]
    fn test_corrupt_entry_does_not_poison_document() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path());
        let good = serde_json::to_value(record("3.0", StatusToken::Downloading)).unwrap();
        let document = serde_json::json!({
            "ready": { "target_version": 12 },
            "downloading": good,
        });
        fs::write(store.metadata_path(), document.to_string()).unwrap();
        fs::write(store.status_path(), "downloading\n").unwrap();

        let state = store.read();
        assert_eq!(state.status, StatusToken::Downloading);
        assert!(state.ready.is_none());
        assert_eq!(state.downloading.unwrap().target_version, "3.0");
    }

    #[test]
    fn test_unrecognized_marker_is_kept() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path());
        fs::write(store.status_path(), "half-writ\n").unwrap();

        assert_eq!(
            store.read_status(),
            StatusToken::Unrecognized("half-writ".to_string())
        );
    }

    #[test]
    fn test_promote_downloading() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path());
        let old = store.prepare_patch_dir(MarRole::Ready).unwrap();
        fs::write(&old, b"old").unwrap();
        let partial = store.prepare_patch_dir(MarRole::Downloading).unwrap();
        fs::write(&partial, b"new").unwrap();

        let ready = store.promote_downloading().unwrap();

        assert_eq!(fs::read(&ready).unwrap(), b"new");
        assert!(!store.patch_dir(MarRole::Downloading).exists());
        assert!(store.patch_mar_exists(MarRole::Ready));
    }

    #[test]
    fn test_restore_downloading() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path());
        let partial = store.prepare_patch_dir(MarRole::Downloading).unwrap();
        fs::write(&partial, b"MAR1").unwrap();
        store.promote_downloading().unwrap();

        let restored = store.restore_downloading().unwrap();

        assert_eq!(restored, store.mar_path(MarRole::Downloading));
        assert_eq!(fs::read(&restored).unwrap(), b"MAR1");
        assert!(!store.patch_dir(MarRole::Ready).exists());
    }

    #[test]
    fn test_remove_missing_dir_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path());
        assert!(store.remove_patch_dir(MarRole::Downloading).is_ok());
    }
}
