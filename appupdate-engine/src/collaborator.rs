//! External collaborators of the state machine.
//!
//! The engine never talks to the network or launches the updater itself.
//! Downloading and applying are delegated through these traits and report
//! back with a byte count or an [`OperationFailure`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OperationFailure;
use crate::record::PatchRecord;
use crate::status::DownloadProgress;

/// Called with progress updates while a patch downloads.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// How the ready patch is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Apply to a copy of the installation, swapped in on next restart
    Stage,
    /// Apply over the running installation
    Install,
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyMode::Stage => write!(f, "stage"),
            ApplyMode::Install => write!(f, "install"),
        }
    }
}

/// Everything the applier needs to act on the ready patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub target_version: String,
    pub mar_path: PathBuf,
    pub mode: ApplyMode,
    pub use_service: bool,
}

/// Fetches a patch into the downloading directory.
#[async_trait]
pub trait PatchDownloader: Send + Sync {
    /// Download `patch` to `dest`, returning the number of bytes on disk.
    ///
    /// `dest` may already hold a partial file from an earlier session.
    /// Integrity checks against the record happen in the engine once this
    /// returns.
    async fn download(
        &self,
        target_version: &str,
        patch: &PatchRecord,
        dest: &Path,
        progress: ProgressCallback,
    ) -> Result<u64, OperationFailure>;
}

/// Stages or installs the ready patch.
#[async_trait]
pub trait PatchApplier: Send + Sync {
    async fn apply(&self, request: &ApplyRequest) -> Result<(), OperationFailure>;
}
