//! Update records and patch descriptors
//!
//! An [`UpdateRecord`] is what the metadata document remembers about one
//! update. At most two are live at once: the ready one, whose patch is fully
//! downloaded, and the downloading one, which is the next update being
//! fetched while the ready one waits.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};
use crate::status::StatusToken;

/// Kind of patch: a full replacement or a delta against the installed build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Complete,
    Partial,
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchKind::Complete => write!(f, "complete"),
            PatchKind::Partial => write!(f, "partial"),
        }
    }
}

/// Role an update record plays. Each role owns its own patch directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarRole {
    /// Fully downloaded, waiting to be staged or applied
    Ready,
    /// Being fetched
    Downloading,
}

impl MarRole {
    /// Directory name under the update root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            MarRole::Ready => "patch",
            MarRole::Downloading => "downloading",
        }
    }
}

impl fmt::Display for MarRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarRole::Ready => write!(f, "ready"),
            MarRole::Downloading => write!(f, "downloading"),
        }
    }
}

/// One patch of an update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    /// Where the patch is fetched from
    pub url: String,

    /// Complete or partial
    pub patch_kind: PatchKind,

    /// Phase of this patch, in the status token vocabulary
    pub state: StatusToken,

    /// Last known location of the mar file. Existence is checked against
    /// the role's directory, never taken from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mar_path: Option<PathBuf>,

    /// Expected size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Expected SHA256 of the mar, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Whether this is the patch being downloaded or applied
    #[serde(default)]
    pub selected: bool,
}

/// Result of the self-consistency check run before reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRecordValidity {
    Valid,
    /// The record's own stored state contradicts its role
    InvalidSelfState,
}

/// An update as remembered by the metadata document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Version the update installs
    pub target_version: String,

    /// Phase of the update, in the status token vocabulary
    pub state: StatusToken,

    /// Link to release notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes_uri: Option<String>,

    /// Patches offered for this update
    #[serde(default)]
    pub patches: Vec<PatchRecord>,

    /// Last time this record changed
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl UpdateRecord {
    /// The patch that is being downloaded or applied.
    pub fn selected_patch(&self) -> Option<&PatchRecord> {
        self.patches
            .iter()
            .find(|p| p.selected)
            .or_else(|| self.patches.first())
    }

    fn selected_patch_mut(&mut self) -> Option<&mut PatchRecord> {
        let index = self.patches.iter().position(|p| p.selected).unwrap_or(0);
        self.patches.get_mut(index)
    }

    /// Set the record state and the selected patch's state together.
    ///
    /// A no-op, timestamp included, when both already hold `state`.
    pub fn set_state(&mut self, state: StatusToken) {
        let unchanged = self.state == state
            && self
                .selected_patch()
                .map(|p| p.state == state)
                .unwrap_or(true);
        if unchanged {
            return;
        }
        if let Some(patch) = self.selected_patch_mut() {
            patch.state = state.clone();
        }
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Point the selected patch at its mar location.
    pub fn set_mar_path(&mut self, path: PathBuf) {
        if let Some(patch) = self.selected_patch_mut() {
            patch.mar_path = Some(path);
        }
    }

    /// Check the record against the role it was found in.
    ///
    /// A downloading record must say `downloading`. A ready record's state is
    /// rewritten during reconciliation, so only its shape is checked here.
    pub fn validity(&self, role: MarRole) -> UpdateRecordValidity {
        if self.patches.is_empty() {
            return UpdateRecordValidity::InvalidSelfState;
        }
        match role {
            MarRole::Downloading if self.state != StatusToken::Downloading => {
                UpdateRecordValidity::InvalidSelfState
            }
            _ => UpdateRecordValidity::Valid,
        }
    }

    /// Whether `self` installs a newer version than `other`.
    pub fn is_newer_than(&self, other: &UpdateRecord) -> bool {
        compare_versions(&self.target_version, &other.target_version) == Ordering::Greater
    }
}

/// A patch as offered by an update check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDescriptor {
    pub url: String,
    pub patch_kind: PatchKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// An update as offered by an update check, before anything is persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    pub target_version: String,
    #[serde(default)]
    pub release_notes_uri: Option<String>,
    pub patches: Vec<PatchDescriptor>,
}

impl UpdateDescriptor {
    /// Build the downloading record for this offer.
    ///
    /// A partial patch is preferred over a complete one when both are offered.
    pub fn into_downloading_record(self) -> Result<UpdateRecord> {
        if self.target_version.trim().is_empty() {
            return Err(UpdateError::InvalidDescriptor(
                "target version is empty".to_string(),
            ));
        }
        if self.patches.is_empty() {
            return Err(UpdateError::InvalidDescriptor(format!(
                "update {} offers no patches",
                self.target_version
            )));
        }

        let selected = self
            .patches
            .iter()
            .position(|p| p.patch_kind == PatchKind::Partial)
            .unwrap_or(0);

        let patches = self
            .patches
            .into_iter()
            .enumerate()
            .map(|(index, patch)| PatchRecord {
                url: patch.url,
                patch_kind: patch.patch_kind,
                state: if index == selected {
                    StatusToken::Downloading
                } else {
                    StatusToken::None
                },
                mar_path: None,
                size: patch.size,
                sha256: patch.sha256,
                selected: index == selected,
            })
            .collect();

        Ok(UpdateRecord {
            target_version: self.target_version,
            state: StatusToken::Downloading,
            release_notes_uri: self.release_notes_uri,
            patches,
            updated_at: Utc::now(),
        })
    }
}

/// Compare dotted version strings component by component.
///
/// Numeric components compare numerically; anything else compares as text.
/// Missing trailing components count as zero, so `1.0` equals `1.0.0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.trim().split('.').collect();
    let right: Vec<&str> = b.trim().split('.').collect();

    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).copied().unwrap_or("0");
        let r = right.get(i).copied().unwrap_or("0");
        let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => l.cmp(r),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kinds: &[PatchKind]) -> UpdateDescriptor {
        UpdateDescriptor {
            target_version: "2.0.0".to_string(),
            release_notes_uri: None,
            patches: kinds
                .iter()
                .map(|kind| PatchDescriptor {
                    url: format!("https://updates.example.com/2.0.0-{}.mar", kind),
                    patch_kind: *kind,
                    size: None,
                    sha256: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_version_comparison() {
        assert_eq!(compare_versions("1.0.0", "0.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("0.1.0", "0.0.99"), Ordering::Greater);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("0.0.1", "0.0.2"), Ordering::Less);
    }

    #[test]
    fn test_partial_patch_preferred() {
        let record = descriptor(&[PatchKind::Complete, PatchKind::Partial])
            .into_downloading_record()
            .unwrap();

        let selected = record.selected_patch().unwrap();
        assert_eq!(selected.patch_kind, PatchKind::Partial);
        assert_eq!(selected.state, StatusToken::Downloading);
        assert_eq!(record.patches[0].state, StatusToken::None);
        assert_eq!(record.state, StatusToken::Downloading);
    }

    #[test]
    fn test_descriptor_without_patches_rejected() {
        let err = descriptor(&[]).into_downloading_record().unwrap_err();
        assert!(matches!(err, UpdateError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_downloading_validity_checks_own_state() {
        let mut record = descriptor(&[PatchKind::Complete])
            .into_downloading_record()
            .unwrap();
        assert_eq!(record.validity(MarRole::Downloading), UpdateRecordValidity::Valid);

        record.state = StatusToken::None;
        assert_eq!(
            record.validity(MarRole::Downloading),
            UpdateRecordValidity::InvalidSelfState
        );
        // The ready role does not care about the stored state.
        assert_eq!(record.validity(MarRole::Ready), UpdateRecordValidity::Valid);
    }

    #[test]
    fn test_set_state_updates_selected_patch() {
        let mut record = descriptor(&[PatchKind::Complete, PatchKind::Partial])
            .into_downloading_record()
            .unwrap();
        record.set_state(StatusToken::Pending);

        assert_eq!(record.state, StatusToken::Pending);
        assert_eq!(record.patches[1].state, StatusToken::Pending);
        assert_eq!(record.patches[0].state, StatusToken::None);
    }
}
