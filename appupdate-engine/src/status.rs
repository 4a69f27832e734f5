//! Update status tracking
//!
//! Two vocabularies live here. [`StatusToken`] is what gets written to the
//! status marker on disk by whichever component acted last. [`AppUpdateState`]
//! is the single in-memory state the rest of the application observes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FailureCode;

/// Symbolic update status persisted as a single line of text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StatusToken {
    /// Nothing in flight
    None,
    /// A patch is being fetched
    Downloading,
    /// A patch is downloaded and waits to be staged or applied
    Pending,
    /// Same as `Pending`, to be applied through the service helper
    PendingService,
    /// Staging or applying was started
    Applying,
    /// The patch was staged and waits for restart
    Applied,
    /// Same as `Applied`, staged through the service helper
    AppliedService,
    /// The update was installed
    Succeeded,
    /// The last download failed
    DownloadFailed,
    /// The last apply failed with a code
    Failed(FailureCode),
    /// Anything else found in the marker; treated as corrupt
    Unrecognized(String),
}

impl StatusToken {
    /// Parse a status marker line. Never fails: unknown text is kept as
    /// [`StatusToken::Unrecognized`].
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "none" => StatusToken::None,
            "downloading" => StatusToken::Downloading,
            "pending" => StatusToken::Pending,
            "pending-service" => StatusToken::PendingService,
            "applying" => StatusToken::Applying,
            "applied" => StatusToken::Applied,
            "applied-service" => StatusToken::AppliedService,
            "succeeded" => StatusToken::Succeeded,
            "download-failed" => StatusToken::DownloadFailed,
            _ => match line.strip_prefix("failed:") {
                Some(code) => code
                    .trim()
                    .parse()
                    .map(StatusToken::Failed)
                    .unwrap_or_else(|_| StatusToken::Unrecognized(line.to_string())),
                None => StatusToken::Unrecognized(line.to_string()),
            },
        }
    }

    /// The token a completed download persists.
    pub fn pending(use_service: bool) -> Self {
        if use_service {
            StatusToken::PendingService
        } else {
            StatusToken::Pending
        }
    }

    /// The token a successful stage persists.
    pub fn applied(use_service: bool) -> Self {
        if use_service {
            StatusToken::AppliedService
        } else {
            StatusToken::Applied
        }
    }

    /// Whether this token describes a downloaded update waiting for the
    /// next phase (`pending`, `pending-service`, `applied`, `applied-service`).
    pub fn is_ready_phase(&self) -> bool {
        matches!(
            self,
            StatusToken::Pending
                | StatusToken::PendingService
                | StatusToken::Applied
                | StatusToken::AppliedService
        )
    }
}

impl Default for StatusToken {
    fn default() -> Self {
        StatusToken::None
    }
}

impl fmt::Display for StatusToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusToken::None => write!(f, "none"),
            StatusToken::Downloading => write!(f, "downloading"),
            StatusToken::Pending => write!(f, "pending"),
            StatusToken::PendingService => write!(f, "pending-service"),
            StatusToken::Applying => write!(f, "applying"),
            StatusToken::Applied => write!(f, "applied"),
            StatusToken::AppliedService => write!(f, "applied-service"),
            StatusToken::Succeeded => write!(f, "succeeded"),
            StatusToken::DownloadFailed => write!(f, "download-failed"),
            StatusToken::Failed(code) => write!(f, "failed:{}", code),
            StatusToken::Unrecognized(raw) => write!(f, "{}", raw),
        }
    }
}

impl From<String> for StatusToken {
    fn from(s: String) -> Self {
        StatusToken::parse(&s)
    }
}

impl From<StatusToken> for String {
    fn from(token: StatusToken) -> Self {
        token.to_string()
    }
}

/// The externally visible update state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "code", rename_all = "snake_case")]
pub enum AppUpdateState {
    /// Nothing in flight
    #[default]
    Idle,
    /// A patch is being fetched
    Downloading,
    /// A downloaded patch waits to be staged or applied
    Pending,
    /// Staging or applying in place
    Swap,
    /// Staged; transient, collapses to `Idle` once observed
    Applied,
    /// Installed; transient, collapses to `Idle` once observed
    Succeeded,
    /// Apply failed; transient, collapses to `Idle` once observed
    Failed(FailureCode),
}

impl AppUpdateState {
    /// Whether this is one of the transient terminal signals.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppUpdateState::Applied | AppUpdateState::Succeeded | AppUpdateState::Failed(_)
        )
    }

    /// Whether a mutating operation is running in the background.
    pub fn is_busy(&self) -> bool {
        matches!(self, AppUpdateState::Downloading | AppUpdateState::Swap)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: AppUpdateState) -> bool {
        use AppUpdateState::{Applied, Downloading, Failed, Idle, Pending, Succeeded, Swap};
        matches!(
            (self, target),
            (Idle, Downloading)
                | (Downloading, Pending | Idle)
                | (Pending, Pending | Downloading | Swap | Idle)
                | (Swap, Applied | Succeeded | Failed(_))
                | (Applied | Succeeded | Failed(_), Idle)
        )
    }
}

impl fmt::Display for AppUpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppUpdateState::Idle => write!(f, "idle"),
            AppUpdateState::Downloading => write!(f, "downloading"),
            AppUpdateState::Pending => write!(f, "pending"),
            AppUpdateState::Swap => write!(f, "swap"),
            AppUpdateState::Applied => write!(f, "applied"),
            AppUpdateState::Succeeded => write!(f, "succeeded"),
            AppUpdateState::Failed(code) => write!(f, "failed({})", code),
        }
    }
}

/// Progress information for an ongoing download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Target version of the update being fetched
    pub target_version: String,

    /// Bytes downloaded so far
    pub downloaded_bytes: u64,

    /// Total bytes to download, when known
    pub total_bytes: Option<u64>,

    /// Percentage complete (0-100), 0 when the total is unknown
    pub percentage: u8,
}

impl DownloadProgress {
    pub fn new(target_version: impl Into<String>, downloaded: u64, total: Option<u64>) -> Self {
        let percentage = match total {
            Some(total) if total > 0 => ((downloaded as f64 / total as f64) * 100.0).min(100.0) as u8,
            _ => 0,
        };

        Self {
            target_version: target_version.into(),
            downloaded_bytes: downloaded,
            total_bytes: total,
            percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_tokens() {
        assert_eq!(StatusToken::parse("pending-service\n"), StatusToken::PendingService);
        assert_eq!(StatusToken::parse("  applied "), StatusToken::Applied);
        assert_eq!(StatusToken::parse("download-failed"), StatusToken::DownloadFailed);
        assert_eq!(StatusToken::parse("failed:7"), StatusToken::Failed(7));
        assert_eq!(StatusToken::parse("failed: 42"), StatusToken::Failed(42));
    }

    #[test]
    fn test_parse_corrupt_tokens() {
        assert_eq!(
            StatusToken::parse("failed:"),
            StatusToken::Unrecognized("failed:".to_string())
        );
        assert_eq!(
            StatusToken::parse("failed:abc"),
            StatusToken::Unrecognized("failed:abc".to_string())
        );
        assert_eq!(
            StatusToken::parse("PENDING"),
            StatusToken::Unrecognized("PENDING".to_string())
        );
        assert_eq!(StatusToken::parse(""), StatusToken::Unrecognized(String::new()));
    }

    #[test]
    fn test_token_serde_uses_marker_text() {
        let json = serde_json::to_string(&StatusToken::Failed(3)).unwrap();
        assert_eq!(json, "\"failed:3\"");
        let token: StatusToken = serde_json::from_str("\"applied-service\"").unwrap();
        assert_eq!(token, StatusToken::AppliedService);
    }

    #[test]
    fn test_ready_phase_tokens() {
        assert!(StatusToken::Pending.is_ready_phase());
        assert!(StatusToken::AppliedService.is_ready_phase());
        assert!(!StatusToken::Applying.is_ready_phase());
        assert!(!StatusToken::Failed(1).is_ready_phase());
        assert_eq!(StatusToken::pending(true), StatusToken::PendingService);
        assert_eq!(StatusToken::applied(false), StatusToken::Applied);
    }

    #[test]
    fn test_state_transitions() {
        assert!(AppUpdateState::Idle.can_transition_to(AppUpdateState::Downloading));
        assert!(AppUpdateState::Pending.can_transition_to(AppUpdateState::Swap));
        assert!(AppUpdateState::Pending.can_transition_to(AppUpdateState::Downloading));
        assert!(AppUpdateState::Swap.can_transition_to(AppUpdateState::Failed(3)));
        assert!(AppUpdateState::Applied.can_transition_to(AppUpdateState::Idle));

        assert!(!AppUpdateState::Idle.can_transition_to(AppUpdateState::Swap));
        assert!(!AppUpdateState::Swap.can_transition_to(AppUpdateState::Idle));
        assert!(!AppUpdateState::Downloading.can_transition_to(AppUpdateState::Swap));
    }

    #[test]
    fn test_progress_percentage() {
        assert_eq!(DownloadProgress::new("2.0", 50, Some(200)).percentage, 25);
        assert_eq!(DownloadProgress::new("2.0", 50, None).percentage, 0);
        assert_eq!(DownloadProgress::new("2.0", 500, Some(200)).percentage, 100);
    }
}
