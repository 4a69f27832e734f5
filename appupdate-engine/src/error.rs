//! Error types for the update engine.
//!
//! Corrupt and inconsistent on-disk state is never reported through these
//! types; the store and the reconciler recover from it locally. What remains
//! are refused operations and write failures.

use std::fmt;

use thiserror::Error;

use crate::status::AppUpdateState;

/// Numeric failure code persisted as `failed:<code>` and reported by collaborators.
pub type FailureCode = i32;

/// Errors returned by the update engine.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Filesystem operation failed while persisting state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The metadata document could not be serialized.
    #[error("Metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The requested operation is not valid in the current state.
    #[error("Cannot {operation} while {from}")]
    InvalidTransition {
        from: AppUpdateState,
        operation: &'static str,
    },

    /// Staging and applying cannot be cancelled once started.
    #[error("Update is being applied and cannot be interrupted")]
    NotInterruptible,

    /// No ready update exists.
    #[error("No ready update")]
    NoReadyUpdate,

    /// No download is in progress.
    #[error("No download in progress")]
    NoDownload,

    /// A staged update is waiting for restart.
    #[error("A staged update is waiting for restart")]
    StagedUpdatePending,

    /// Staging was requested but is disabled by configuration.
    #[error("Staging is disabled")]
    StagingDisabled,

    /// The update engine is disabled by configuration.
    #[error("Updates are disabled")]
    Disabled,

    /// An offered update is not newer than the ready one.
    #[error("Offered update {offered} is not newer than ready update {ready}")]
    NotNewer { ready: String, offered: String },

    /// The ready patch file is missing on disk.
    #[error("Patch file for the ready update is missing")]
    MissingMar,

    /// A background operation reported back after being superseded.
    #[error("Operation was superseded")]
    StaleOperation,

    /// An offered update cannot be downloaded as described.
    #[error("Invalid update descriptor: {0}")]
    InvalidDescriptor(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The state machine was dropped while a caller was waiting on it.
    #[error("Update manager shut down")]
    ShutDown,
}

/// Result type alias for update engine operations.
pub type Result<T> = std::result::Result<T, UpdateError>;

// ============================================================================
// Failure Codes
// ============================================================================

/// Failure codes written into `failed:<code>` and carried by `DownloadFailed`.
pub mod codes {
    use super::FailureCode;

    // Download failures (1-99)
    pub const NETWORK_ERROR: FailureCode = 1;
    pub const HTTP_ERROR: FailureCode = 2;
    pub const WRITE_ERROR: FailureCode = 7;
    pub const CHECKSUM_MISMATCH: FailureCode = 11;
    pub const SIZE_MISMATCH: FailureCode = 12;

    // Apply failures (100-199)
    pub const UPDATER_LAUNCH_FAILED: FailureCode = 100;
    pub const UPDATER_EXIT_FAILURE: FailureCode = 101;
    pub const MAR_MISSING: FailureCode = 102;
    pub const APPLY_INTERRUPTED: FailureCode = 103;

    /// Human-readable name of a failure code, for logs and UI surfaces.
    pub fn name(code: FailureCode) -> &'static str {
        match code {
            NETWORK_ERROR => "NETWORK_ERROR",
            HTTP_ERROR => "HTTP_ERROR",
            WRITE_ERROR => "WRITE_ERROR",
            CHECKSUM_MISMATCH => "CHECKSUM_MISMATCH",
            SIZE_MISMATCH => "SIZE_MISMATCH",
            UPDATER_LAUNCH_FAILED => "UPDATER_LAUNCH_FAILED",
            UPDATER_EXIT_FAILURE => "UPDATER_EXIT_FAILURE",
            MAR_MISSING => "MAR_MISSING",
            APPLY_INTERRUPTED => "APPLY_INTERRUPTED",
            _ => "UNKNOWN_FAILURE",
        }
    }
}

/// Failure reported by an external collaborator (downloader or applier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    /// Failure code persisted with the outcome
    pub code: FailureCode,
    /// Detail for logs
    pub message: String,
}

impl OperationFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", codes::name(self.code), self.code, self.message)
    }
}

impl std::error::Error for OperationFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        let failure = OperationFailure::new(codes::CHECKSUM_MISMATCH, "expected abc, got def");
        assert_eq!(
            failure.to_string(),
            "CHECKSUM_MISMATCH (11): expected abc, got def"
        );
    }

    #[test]
    fn test_unknown_code_name() {
        assert_eq!(codes::name(4242), "UNKNOWN_FAILURE");
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = UpdateError::InvalidTransition {
            from: AppUpdateState::Swap,
            operation: "start a download",
        };
        assert_eq!(err.to_string(), "Cannot start a download while swap");
    }
}
