//! Application update state machine
//!
//! ```text
//! Idle --start download--> Downloading
//! Downloading --complete & verified--> Pending
//! Downloading --fail(code)--> Idle          (download-failed persisted)
//! Downloading --cancel--> Idle              (partial mar deleted)
//! Pending --newer offer--> Pending          (ready + downloading coexist)
//! Pending --stage/apply--> Swap
//! Swap --stage ok--> Applied --observed--> Idle
//! Swap --apply ok--> Succeeded --observed--> Idle
//! Swap --fail(code)--> Failed --observed--> Idle
//! ```
//!
//! Every mutation writes the new `(status, records)` tuple to the store
//! before the in-memory state moves. A failed write leaves memory untouched,
//! so disk never lags memory. The one exception is collapsing a terminal
//! state to `Idle` once observed, which only changes memory; the terminal
//! tuple left on disk reconciles to `Idle` at the next startup anyway.
//!
//! The machine is synchronous and does no I/O beyond the store. Download and
//! apply work happens elsewhere and reports back through
//! [`complete_download`](ApplicationUpdateStateMachine::complete_download),
//! [`fail_download`](ApplicationUpdateStateMachine::fail_download) and
//! [`finish_swap`](ApplicationUpdateStateMachine::finish_swap). Downloads are
//! tagged with a generation so reports from a cancelled download are
//! rejected as stale.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::collaborator::{ApplyMode, ApplyRequest};
use crate::config::UpdateConfig;
use crate::error::{codes, FailureCode, OperationFailure, Result, UpdateError};
use crate::reconcile::ReconcileOutcome;
use crate::record::{MarRole, PatchRecord, UpdateRecord};
use crate::status::{AppUpdateState, DownloadProgress, StatusToken};
use crate::store::{PersistedState, PersistedStateStore};

const TRANSITION_CAPACITY: usize = 32;

/// The parts of [`UpdateConfig`] the state machine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSettings {
    pub use_service: bool,
    pub staging_enabled: bool,
    pub max_download_attempts: u32,
    pub history_limit: usize,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from(&UpdateConfig::default())
    }
}

impl From<&UpdateConfig> for MachineSettings {
    fn from(config: &UpdateConfig) -> Self {
        Self {
            use_service: config.use_service,
            staging_enabled: config.staging_enabled,
            max_download_attempts: config.max_download_attempts,
            history_limit: config.history_limit,
        }
    }
}

/// A download the caller should now run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTicket {
    /// Identifies this download when reporting back
    pub generation: u64,
    pub target_version: String,
    pub patch: PatchRecord,
    /// Where the patch goes; may already hold a partial file
    pub dest: PathBuf,
}

pub struct ApplicationUpdateStateMachine {
    store: PersistedStateStore,
    settings: MachineSettings,
    state: AppUpdateState,
    persisted: PersistedState,
    last_outcome: StatusToken,
    generation: u64,
    active_download: Option<u64>,
    swap_mode: Option<ApplyMode>,
    transitions: broadcast::Sender<AppUpdateState>,
    progress: watch::Sender<Option<DownloadProgress>>,
}

impl ApplicationUpdateStateMachine {
    /// Start from the result of startup reconciliation.
    pub fn new(
        store: PersistedStateStore,
        settings: MachineSettings,
        outcome: ReconcileOutcome,
    ) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (progress, _) = watch::channel(None);
        Self {
            store,
            settings,
            state: outcome.state,
            persisted: outcome.persisted,
            last_outcome: outcome.previous_status,
            generation: 0,
            active_download: None,
            swap_mode: None,
            transitions,
            progress,
        }
    }

    pub fn state(&self) -> AppUpdateState {
        self.state
    }

    pub fn ready(&self) -> Option<&UpdateRecord> {
        self.persisted.ready.as_ref()
    }

    pub fn downloading(&self) -> Option<&UpdateRecord> {
        self.persisted.downloading.as_ref()
    }

    pub fn history(&self) -> &[UpdateRecord] {
        &self.persisted.history
    }

    pub fn download_attempts(&self) -> u32 {
        self.persisted.download_attempts
    }

    /// Most recent outcome: the token consumed at startup, or the last
    /// download failure or swap result since.
    pub fn last_outcome(&self) -> &StatusToken {
        &self.last_outcome
    }

    /// Whether an external scheduler may start another download attempt.
    pub fn should_retry_download(&self) -> bool {
        self.persisted.download_attempts < self.settings.max_download_attempts
    }

    /// Whether a download has been handed out and not yet reported back.
    pub fn download_running(&self) -> bool {
        self.active_download.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppUpdateState> {
        self.transitions.subscribe()
    }

    pub fn progress(&self) -> watch::Receiver<Option<DownloadProgress>> {
        self.progress.subscribe()
    }

    /// Whether `generation` is the download the machine is waiting on.
    pub fn expects_download(&self, generation: u64) -> bool {
        self.active_download == Some(generation)
    }

    /// Publish progress for a running download. Stale reports are dropped.
    pub fn report_progress(&self, generation: u64, progress: DownloadProgress) {
        if self.expects_download(generation) {
            self.progress.send_replace(Some(progress));
        }
    }

    /// Collapse a terminal state to `Idle` once its outcome has been seen.
    ///
    /// Disk is left alone: a terminal tuple already reconciles to the right
    /// state on the next startup.
    pub fn observe(&mut self) -> AppUpdateState {
        if self.state.is_terminal() {
            debug!(outcome = %self.state, "Terminal update state observed");
            self.enter(AppUpdateState::Idle);
        }
        self.state
    }

    /// Begin downloading an offered update.
    ///
    /// From `Idle` this enters `Downloading`. From `Pending` the offer must be
    /// newer than the ready update; it then downloads alongside the ready one
    /// and the state stays `Pending`.
    pub fn begin_download(&mut self, mut record: UpdateRecord) -> Result<DownloadTicket> {
        self.observe();
        match self.state {
            AppUpdateState::Idle => {
                if self.persisted.ready.is_some() {
                    return Err(UpdateError::StagedUpdatePending);
                }
                self.store.remove_patch_dir(MarRole::Downloading)?;
                let dest = self.store.prepare_patch_dir(MarRole::Downloading)?;
                record.set_state(StatusToken::Downloading);
                record.set_mar_path(dest);

                let next = PersistedState {
                    status: StatusToken::Downloading,
                    ready: None,
                    downloading: Some(record),
                    ..self.persisted.clone()
                };
                self.advance(next, AppUpdateState::Downloading)?;
            }
            AppUpdateState::Pending => {
                if self.persisted.downloading.is_some() {
                    return Err(UpdateError::InvalidTransition {
                        from: self.state,
                        operation: "start a second download",
                    });
                }
                let ready = self.persisted.ready.as_ref().ok_or(UpdateError::NoReadyUpdate)?;
                if !record.is_newer_than(ready) {
                    return Err(UpdateError::NotNewer {
                        ready: ready.target_version.clone(),
                        offered: record.target_version,
                    });
                }
                self.store.remove_patch_dir(MarRole::Downloading)?;
                let dest = self.store.prepare_patch_dir(MarRole::Downloading)?;
                record.set_state(StatusToken::Downloading);
                record.set_mar_path(dest);

                info!(
                    ready = %ready.target_version,
                    offered = %record.target_version,
                    "Downloading newer update alongside ready update"
                );
                let next = PersistedState {
                    downloading: Some(record),
                    ..self.persisted.clone()
                };
                self.advance(next, AppUpdateState::Pending)?;
            }
            from => {
                return Err(UpdateError::InvalidTransition {
                    from,
                    operation: "start a download",
                })
            }
        }
        self.hand_out_download()
    }

    /// Hand out the persisted download again, keeping any partial file.
    pub fn resume_download(&mut self) -> Result<DownloadTicket> {
        match self.state {
            AppUpdateState::Downloading | AppUpdateState::Pending => {}
            from => {
                return Err(UpdateError::InvalidTransition {
                    from,
                    operation: "resume a download",
                })
            }
        }
        if self.persisted.downloading.is_none() {
            return Err(UpdateError::NoDownload);
        }
        if self.active_download.is_some() {
            return Err(UpdateError::InvalidTransition {
                from: self.state,
                operation: "resume a running download",
            });
        }
        self.store.prepare_patch_dir(MarRole::Downloading)?;
        self.hand_out_download()
    }

    fn hand_out_download(&mut self) -> Result<DownloadTicket> {
        let record = self.persisted.downloading.as_ref().ok_or(UpdateError::NoDownload)?;
        let patch = record
            .selected_patch()
            .cloned()
            .ok_or_else(|| UpdateError::InvalidDescriptor("update has no patches".to_string()))?;

        self.generation += 1;
        self.active_download = Some(self.generation);
        self.progress.send_replace(Some(DownloadProgress::new(
            record.target_version.clone(),
            0,
            patch.size,
        )));

        Ok(DownloadTicket {
            generation: self.generation,
            target_version: record.target_version.clone(),
            patch,
            dest: self.store.mar_path(MarRole::Downloading),
        })
    }

    fn check_generation(&self, generation: u64) -> Result<()> {
        if !self.expects_download(generation) {
            debug!(generation, active = ?self.active_download, "Ignoring stale download report");
            return Err(UpdateError::StaleOperation);
        }
        Ok(())
    }

    /// Promote a finished and verified download to the ready update.
    ///
    /// A ready update it was downloaded alongside is superseded. Once the
    /// generation is accepted the download no longer counts as running, so
    /// after a failed write the machine can be resumed.
    pub fn complete_download(&mut self, generation: u64) -> Result<AppUpdateState> {
        self.check_generation(generation)?;
        self.active_download = None;
        let mut record = self.persisted.downloading.clone().ok_or(UpdateError::NoDownload)?;

        if let Some(superseded) = &self.persisted.ready {
            info!(
                superseded = %superseded.target_version,
                version = %record.target_version,
                "Newer download supersedes ready update"
            );
            // Drop the old ready update first so a crash mid-promotion
            // reconciles to a resumable download.
            let next = PersistedState {
                status: StatusToken::Downloading,
                ready: None,
                ..self.persisted.clone()
            };
            self.store.write(&next)?;
            self.persisted = next;
        }

        let mar = match self.store.promote_downloading() {
            Ok(mar) => mar,
            Err(e) => {
                warn!(error = %e, "Failed to promote downloaded patch");
                return self.record_download_failure(codes::WRITE_ERROR);
            }
        };

        let token = StatusToken::pending(self.settings.use_service);
        record.set_state(token.clone());
        record.set_mar_path(mar);
        let version = record.target_version.clone();

        let next = PersistedState {
            status: token,
            ready: Some(record),
            downloading: None,
            download_attempts: 0,
            ..self.persisted.clone()
        };
        if let Err(e) = self.advance(next, AppUpdateState::Pending) {
            warn!(error = %e, version = %version, "Failed to record finished download");
            if let Err(e) = self.store.restore_downloading() {
                warn!(error = %e, "Failed to return patch to downloading directory");
            }
            if self.persisted.ready.is_none() && self.state == AppUpdateState::Pending {
                // The superseded ready update is already gone from disk.
                self.enter(AppUpdateState::Downloading);
            }
            return Err(e);
        }

        info!(version = %version, "Update downloaded and ready");
        Ok(self.state)
    }

    /// Record a failed download. The partial file is deleted.
    pub fn fail_download(&mut self, generation: u64, code: FailureCode) -> Result<AppUpdateState> {
        self.check_generation(generation)?;
        self.active_download = None;
        self.record_download_failure(code)
    }

    fn record_download_failure(&mut self, code: FailureCode) -> Result<AppUpdateState> {
        let attempts = self.persisted.download_attempts.saturating_add(1);

        if self.persisted.ready.is_some() {
            let next = PersistedState {
                downloading: None,
                download_attempts: attempts,
                ..self.persisted.clone()
            };
            self.advance(next, AppUpdateState::Pending)?;
        } else {
            let next = PersistedState {
                status: StatusToken::DownloadFailed,
                ready: None,
                downloading: None,
                download_attempts: attempts,
                ..self.persisted.clone()
            };
            self.advance(next, AppUpdateState::Idle)?;
            self.last_outcome = StatusToken::DownloadFailed;
        }
        self.discard_partial();

        warn!(
            code,
            reason = codes::name(code),
            attempts,
            "Update download failed"
        );
        Ok(self.state)
    }

    /// Cancel the download, in either `Downloading` or alongside a ready
    /// update. Staging and applying cannot be cancelled.
    pub fn cancel_download(&mut self) -> Result<AppUpdateState> {
        if self.state == AppUpdateState::Swap {
            return Err(UpdateError::NotInterruptible);
        }
        if self.persisted.downloading.is_none() {
            return Err(UpdateError::NoDownload);
        }

        let (status, state) = match self.state {
            AppUpdateState::Pending => (self.persisted.status.clone(), AppUpdateState::Pending),
            _ => (StatusToken::None, AppUpdateState::Idle),
        };
        let next = PersistedState {
            status,
            downloading: None,
            download_attempts: 0,
            ..self.persisted.clone()
        };
        self.advance(next, state)?;
        self.active_download = None;
        self.discard_partial();

        info!(state = %self.state, "Update download cancelled");
        Ok(self.state)
    }

    fn discard_partial(&self) {
        if let Err(e) = self.store.remove_patch_dir(MarRole::Downloading) {
            warn!(error = %e, "Failed to remove partial download");
        }
        self.progress.send_replace(None);
    }

    /// Move `Pending` to `Swap` and describe the work for the applier.
    ///
    /// A download running alongside the ready update is cancelled. If the
    /// ready patch has vanished from disk the update is discarded, the state
    /// returns to `Idle`, and [`UpdateError::MissingMar`] is returned.
    pub fn begin_swap(&mut self, mode: ApplyMode) -> Result<ApplyRequest> {
        self.observe();
        let operation = match mode {
            ApplyMode::Stage => "stage an update",
            ApplyMode::Install => "apply an update",
        };
        match self.state {
            AppUpdateState::Pending => {}
            AppUpdateState::Idle if self.persisted.ready.is_some() => {
                return Err(UpdateError::StagedUpdatePending)
            }
            AppUpdateState::Idle => return Err(UpdateError::NoReadyUpdate),
            from => return Err(UpdateError::InvalidTransition { from, operation }),
        }
        if mode == ApplyMode::Stage && !self.settings.staging_enabled {
            return Err(UpdateError::StagingDisabled);
        }
        let mut ready = self.persisted.ready.clone().ok_or(UpdateError::NoReadyUpdate)?;
        let had_download = self.persisted.downloading.is_some();

        if !self.store.patch_mar_exists(MarRole::Ready) {
            warn!(version = %ready.target_version, "Ready patch missing, discarding update");
            let next = PersistedState {
                status: StatusToken::None,
                ready: None,
                downloading: None,
                ..self.persisted.clone()
            };
            self.advance(next, AppUpdateState::Idle)?;
            self.active_download = None;
            self.discard_partial();
            if let Err(e) = self.store.remove_patch_dir(MarRole::Ready) {
                warn!(error = %e, "Failed to remove ready patch directory");
            }
            return Err(UpdateError::MissingMar);
        }

        ready.set_state(StatusToken::Applying);
        let request = ApplyRequest {
            target_version: ready.target_version.clone(),
            mar_path: self.store.mar_path(MarRole::Ready),
            mode,
            use_service: self.settings.use_service,
        };

        let next = PersistedState {
            status: StatusToken::Applying,
            ready: Some(ready),
            downloading: None,
            download_attempts: if had_download {
                0
            } else {
                self.persisted.download_attempts
            },
            ..self.persisted.clone()
        };
        self.advance(next, AppUpdateState::Swap)?;
        if had_download {
            info!("Cancelled download running alongside the ready update");
            self.active_download = None;
            self.discard_partial();
        }
        self.swap_mode = Some(mode);

        info!(version = %request.target_version, mode = %mode, "Swapping in update");
        Ok(request)
    }

    /// Record the applier's result.
    ///
    /// A successful stage keeps the ready update on disk, waiting for
    /// restart. An install or any failure moves it to history.
    pub fn finish_swap(
        &mut self,
        result: std::result::Result<(), OperationFailure>,
    ) -> Result<AppUpdateState> {
        if self.state != AppUpdateState::Swap {
            return Err(UpdateError::StaleOperation);
        }
        let mode = self.swap_mode.unwrap_or(ApplyMode::Install);
        let mut ready = self.persisted.ready.clone().ok_or(UpdateError::NoReadyUpdate)?;
        let version = ready.target_version.clone();

        match (mode, result) {
            (ApplyMode::Stage, Ok(())) => {
                let token = StatusToken::applied(self.settings.use_service);
                ready.set_state(token.clone());
                let next = PersistedState {
                    status: token.clone(),
                    ready: Some(ready),
                    ..self.persisted.clone()
                };
                self.advance(next, AppUpdateState::Applied)?;
                self.last_outcome = token;
                info!(version = %version, "Update staged, waiting for restart");
            }
            (ApplyMode::Install, Ok(())) => {
                self.retire_ready(ready, StatusToken::Succeeded, AppUpdateState::Succeeded)?;
                info!(version = %version, "Update installed");
            }
            (_, Err(failure)) => {
                let code = failure.code;
                self.retire_ready(ready, StatusToken::Failed(code), AppUpdateState::Failed(code))?;
                warn!(version = %version, mode = %mode, error = %failure, "Update failed to apply");
            }
        }
        self.swap_mode = None;
        Ok(self.state)
    }

    fn retire_ready(
        &mut self,
        mut ready: UpdateRecord,
        token: StatusToken,
        state: AppUpdateState,
    ) -> Result<()> {
        ready.set_state(token.clone());
        let mut history = self.persisted.history.clone();
        history.insert(0, ready);
        history.truncate(self.settings.history_limit);

        let next = PersistedState {
            status: token.clone(),
            ready: None,
            downloading: None,
            history,
            ..self.persisted.clone()
        };
        self.advance(next, state)?;
        self.last_outcome = token;
        if let Err(e) = self.store.remove_patch_dir(MarRole::Ready) {
            warn!(error = %e, "Failed to remove applied patch");
        }
        Ok(())
    }

    /// Replace everything with a fresh reconciliation result.
    pub fn reset(&mut self, outcome: ReconcileOutcome) {
        self.generation += 1;
        self.active_download = None;
        self.swap_mode = None;
        self.persisted = outcome.persisted;
        self.last_outcome = outcome.previous_status;
        self.progress.send_replace(None);
        self.state = outcome.state;
        let _ = self.transitions.send(self.state);
        info!(state = %self.state, "Update state re-synchronized");
    }

    fn advance(&mut self, next: PersistedState, state: AppUpdateState) -> Result<()> {
        self.store.write(&next)?;
        self.persisted = next;
        self.enter(state);
        Ok(())
    }

    fn enter(&mut self, state: AppUpdateState) {
        debug_assert!(
            self.state.can_transition_to(state),
            "illegal transition {} -> {}",
            self.state,
            state
        );
        info!(from = %self.state, to = %state, "Update state transition");
        self.state = state;
        // No receivers is fine.
        let _ = self.transitions.send(state);
    }
}

/// Check a downloaded patch against the size and checksum its record carries.
///
/// Returns the size on disk.
pub fn verify_patch(path: &Path, patch: &PatchRecord) -> std::result::Result<u64, OperationFailure> {
    let unreadable = |e: io::Error| {
        OperationFailure::new(
            codes::WRITE_ERROR,
            format!("cannot read {}: {}", path.display(), e),
        )
    };

    let size = std::fs::metadata(path).map_err(unreadable)?.len();
    if let Some(expected) = patch.size {
        if size != expected {
            return Err(OperationFailure::new(
                codes::SIZE_MISMATCH,
                format!("expected {} bytes, got {}", expected, size),
            ));
        }
    }

    if let Some(expected) = &patch.sha256 {
        let mut file = File::open(path).map_err(unreadable)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher).map_err(unreadable)?;
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(OperationFailure::new(
                codes::CHECKSUM_MISMATCH,
                format!("expected {}, got {}", expected, actual),
            ));
        }
    }

    Ok(size)
}
