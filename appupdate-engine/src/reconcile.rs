//! Startup reconciliation
//!
//! Three records survive a previous session independently: the status
//! marker, the metadata document, and the patch files themselves. Any of them
//! may be stale or corrupt after a crash or power loss. [`decide`] merges
//! them into one [`AppUpdateState`] plus the records worth keeping;
//! [`StateReconciler::reconcile`] runs that decision against a store and
//! writes the result back.
//!
//! The status token is the primary discriminant:
//!
//! | token                                  | keeps                                   | state         |
//! |----------------------------------------|-----------------------------------------|---------------|
//! | `downloading`                          | valid downloading, only if no ready     | `Downloading` |
//! | `pending*` / `applied*`                | ready with mar, plus valid downloading  | `Pending`     |
//! | `applying`                             | valid downloading, only if ready mar    | `Downloading` |
//! | anything else, or a row not satisfied  | nothing                                 | `Idle`        |
//!
//! A kept ready record has its state overwritten with the token. A
//! downloading record is only ever valid when its own state says
//! `downloading`; that check runs before the table.

use std::fmt;

use tracing::{info, instrument, warn};

use crate::record::{MarRole, UpdateRecord, UpdateRecordValidity};
use crate::status::{AppUpdateState, StatusToken};
use crate::store::{PersistedState, PersistedStateStore};

/// Everything the decision looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileInput {
    pub status: StatusToken,
    pub ready: Option<UpdateRecord>,
    pub downloading: Option<UpdateRecord>,
    pub ready_mar_exists: bool,
    /// Not consulted by the table; a missing partial mar just restarts the
    /// download from zero.
    pub downloading_mar_exists: bool,
}

/// Why a record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The record's own state contradicts its role
    InvalidSelfState,
    /// The ready record's patch file is gone
    MarMissing,
    /// The status token does not allow keeping this record
    StatusMismatch,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::InvalidSelfState => write!(f, "record state contradicts its role"),
            DiscardReason::MarMissing => write!(f, "patch file missing"),
            DiscardReason::StatusMismatch => write!(f, "status does not allow it"),
        }
    }
}

/// A record dropped by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discard {
    pub role: MarRole,
    pub target_version: String,
    pub reason: DiscardReason,
}

/// Output of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub state: AppUpdateState,
    pub ready: Option<UpdateRecord>,
    pub downloading: Option<UpdateRecord>,
    pub discarded: Vec<Discard>,
}

/// Apply the decision table to one set of inputs.
///
/// Pure: touches neither the filesystem nor the clock.
pub fn decide(input: ReconcileInput) -> Decision {
    let ReconcileInput {
        status,
        ready,
        downloading,
        ready_mar_exists,
        ..
    } = input;

    let downloading_validity = downloading
        .as_ref()
        .map(|record| record.validity(MarRole::Downloading));
    let downloading_valid = downloading_validity == Some(UpdateRecordValidity::Valid);
    let ready_valid = ready
        .as_ref()
        .map(|record| record.validity(MarRole::Ready) == UpdateRecordValidity::Valid)
        .unwrap_or(false);

    let (state, keep_ready, keep_downloading) = match &status {
        StatusToken::Downloading => {
            if downloading_valid && ready.is_none() {
                (AppUpdateState::Downloading, false, true)
            } else {
                (AppUpdateState::Idle, false, false)
            }
        }
        token if token.is_ready_phase() => {
            if ready_valid && ready_mar_exists {
                (AppUpdateState::Pending, true, downloading_valid)
            } else {
                (AppUpdateState::Idle, false, false)
            }
        }
        StatusToken::Applying => {
            if downloading_valid && ready_mar_exists {
                (AppUpdateState::Downloading, false, true)
            } else {
                (AppUpdateState::Idle, false, false)
            }
        }
        _ => (AppUpdateState::Idle, false, false),
    };

    let mut discarded = Vec::new();

    let ready = match ready {
        Some(mut record) if keep_ready => {
            record.set_state(status.clone());
            Some(record)
        }
        Some(record) => {
            let reason = if !ready_valid {
                DiscardReason::InvalidSelfState
            } else if status.is_ready_phase() && !ready_mar_exists {
                DiscardReason::MarMissing
            } else {
                DiscardReason::StatusMismatch
            };
            discarded.push(Discard {
                role: MarRole::Ready,
                target_version: record.target_version,
                reason,
            });
            None
        }
        None => None,
    };

    let downloading = match downloading {
        Some(record) if keep_downloading => Some(record),
        Some(record) => {
            let reason = if downloading_valid {
                DiscardReason::StatusMismatch
            } else {
                DiscardReason::InvalidSelfState
            };
            discarded.push(Discard {
                role: MarRole::Downloading,
                target_version: record.target_version,
                reason,
            });
            None
        }
        None => None,
    };

    Decision {
        state,
        ready,
        downloading,
        discarded,
    }
}

/// Result of reconciling a store at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// State the state machine starts in
    pub state: AppUpdateState,
    /// Status token found on disk before reconciliation
    pub previous_status: StatusToken,
    /// What is now persisted
    pub persisted: PersistedState,
    /// Records dropped on the way
    pub discarded: Vec<Discard>,
}

/// Runs the decision against a store and persists the result.
#[derive(Debug, Clone)]
pub struct StateReconciler {
    history_limit: usize,
}

impl StateReconciler {
    pub fn new(history_limit: usize) -> Self {
        Self { history_limit }
    }

    /// Read, decide, clean up discarded patch directories, and write back a
    /// normalized state.
    ///
    /// Never fails. A write failure is logged and the decision still stands;
    /// the next startup will reach the same decision from the same files.
    #[instrument(skip(self, store), fields(root = %store.root().display()))]
    pub fn reconcile(&self, store: &PersistedStateStore) -> ReconcileOutcome {
        let persisted = store.read();
        let previous_status = persisted.status.clone();

        let input = ReconcileInput {
            status: persisted.status.clone(),
            ready: persisted.ready.clone(),
            downloading: persisted.downloading.clone(),
            ready_mar_exists: store.patch_mar_exists(MarRole::Ready),
            downloading_mar_exists: store.patch_mar_exists(MarRole::Downloading),
        };

        info!(
            status = %input.status,
            ready = input.ready.is_some(),
            downloading = input.downloading.is_some(),
            ready_mar = input.ready_mar_exists,
            downloading_mar = input.downloading_mar_exists,
            "Reconciling update state"
        );

        let decision = decide(input);

        for discard in &decision.discarded {
            warn!(
                role = %discard.role,
                version = %discard.target_version,
                reason = %discard.reason,
                "Discarding update record"
            );
        }

        let mut history = persisted.history;
        if let (StatusToken::Succeeded | StatusToken::Failed(_), Some(mut finished)) =
            (&previous_status, persisted.ready)
        {
            finished.set_state(previous_status.clone());
            history.insert(0, finished);
        }
        history.truncate(self.history_limit);

        if decision.ready.is_none() {
            if let Err(e) = store.remove_patch_dir(MarRole::Ready) {
                warn!(error = %e, "Failed to remove discarded ready patch");
            }
        }
        if decision.downloading.is_none() {
            if let Err(e) = store.remove_patch_dir(MarRole::Downloading) {
                warn!(error = %e, "Failed to remove discarded partial download");
            }
        }

        let status = match decision.state {
            AppUpdateState::Pending => previous_status.clone(),
            AppUpdateState::Downloading => StatusToken::Downloading,
            _ => StatusToken::None,
        };

        let normalized = PersistedState {
            status,
            ready: decision.ready,
            downloading: decision.downloading,
            history,
            download_attempts: persisted.download_attempts,
        };

        if let Err(e) = store.write(&normalized) {
            warn!(error = %e, "Failed to persist reconciled update state");
        }

        info!(
            state = %decision.state,
            previous = %previous_status,
            discarded = decision.discarded.len(),
            "Update state reconciled"
        );

        ReconcileOutcome {
            state: decision.state,
            previous_status,
            persisted: normalized,
            discarded: decision.discarded,
        }
    }
}
