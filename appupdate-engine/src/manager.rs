//! Update manager facade
//!
//! One [`UpdateManager`] exists per process. Constructing it reconciles the
//! on-disk state once, synchronously; after that every mutation goes through
//! the state machine behind a single lock, and download and apply work runs
//! on spawned tasks that report back into it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborator::{ApplyMode, PatchApplier, PatchDownloader, ProgressCallback};
use crate::config::UpdateConfig;
use crate::error::{codes, OperationFailure, Result, UpdateError};
use crate::machine::{verify_patch, ApplicationUpdateStateMachine, DownloadTicket, MachineSettings};
use crate::reconcile::{ReconcileOutcome, StateReconciler};
use crate::record::{UpdateDescriptor, UpdateRecord};
use crate::status::{AppUpdateState, DownloadProgress, StatusToken};
use crate::store::{PersistedState, PersistedStateStore};

/// Entry point for the rest of the application.
///
/// Cheap to clone; clones share one state machine.
#[derive(Clone)]
pub struct UpdateManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: UpdateConfig,
    store: PersistedStateStore,
    reconciler: StateReconciler,
    machine: Mutex<ApplicationUpdateStateMachine>,
    downloader: Arc<dyn PatchDownloader>,
    applier: Arc<dyn PatchApplier>,
    download_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UpdateManager {
    /// Validate the configuration and reconcile the update directory.
    ///
    /// When updates are disabled nothing on disk is read or written and the
    /// manager stays `Idle`.
    #[instrument(skip_all, fields(update_dir = %config.update_dir.display()))]
    pub fn new(
        config: UpdateConfig,
        downloader: Arc<dyn PatchDownloader>,
        applier: Arc<dyn PatchApplier>,
    ) -> Result<Self> {
        config.validate().map_err(UpdateError::Config)?;

        let store = PersistedStateStore::new(&config.update_dir);
        let reconciler = StateReconciler::new(config.history_limit);

        let outcome = if config.is_active() {
            reconciler.reconcile(&store)
        } else {
            info!(
                enabled = config.enabled,
                disabled_for_testing = config.disabled_for_testing,
                "Updates inactive, skipping reconciliation"
            );
            ReconcileOutcome {
                state: AppUpdateState::Idle,
                previous_status: StatusToken::None,
                persisted: PersistedState::default(),
                discarded: Vec::new(),
            }
        };

        let machine = ApplicationUpdateStateMachine::new(
            store.clone(),
            MachineSettings::from(&config),
            outcome,
        );

        info!(
            state = %machine.state(),
            channel = %config.channel,
            "Update manager initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                reconciler,
                machine: Mutex::new(machine),
                downloader,
                applier,
                download_task: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.inner.config
    }

    /// Current state. Terminal states stay visible until [`acknowledge`]d
    /// or until the next mutation.
    ///
    /// [`acknowledge`]: UpdateManager::acknowledge
    pub fn current_state(&self) -> AppUpdateState {
        self.inner.machine().state()
    }

    /// Collapse a terminal state to `Idle` and return the resulting state.
    pub fn acknowledge(&self) -> AppUpdateState {
        self.inner.machine().observe()
    }

    /// Resolves with the next state transition after this call.
    ///
    /// The subscription is taken when this is called, not when the future is
    /// first polled, so a transition triggered right after cannot be missed.
    pub fn state_transition(&self) -> impl Future<Output = Result<AppUpdateState>> + Send + 'static {
        let mut rx = self.inner.machine().subscribe();
        async move {
            loop {
                match rx.recv().await {
                    Ok(state) => return Ok(state),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "State transition receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(UpdateError::ShutDown),
                }
            }
        }
    }

    /// Every transition from now on, for callers that follow a whole
    /// operation rather than one step.
    pub fn transitions(&self) -> broadcast::Receiver<AppUpdateState> {
        self.inner.machine().subscribe()
    }

    pub fn get_ready_update(&self) -> Option<UpdateRecord> {
        self.inner.machine().ready().cloned()
    }

    pub fn get_downloading_update(&self) -> Option<UpdateRecord> {
        self.inner.machine().downloading().cloned()
    }

    /// Finished updates, newest first.
    pub fn history(&self) -> Vec<UpdateRecord> {
        self.inner.machine().history().to_vec()
    }

    /// Outcome of the previous session, or of the last finished operation.
    pub fn last_outcome(&self) -> StatusToken {
        self.inner.machine().last_outcome().clone()
    }

    /// Whether the download retry budget allows another attempt.
    pub fn should_retry_download(&self) -> bool {
        self.inner.config.is_active() && self.inner.machine().should_retry_download()
    }

    /// Latest progress of the running download, if any.
    pub fn progress(&self) -> watch::Receiver<Option<DownloadProgress>> {
        self.inner.machine().progress()
    }

    /// Start downloading an offered update in the background.
    #[instrument(skip(self, descriptor), fields(version = %descriptor.target_version))]
    pub fn start_download(&self, descriptor: UpdateDescriptor) -> Result<AppUpdateState> {
        self.inner.ensure_active()?;
        let record = descriptor.into_downloading_record()?;

        let mut machine = self.inner.machine();
        let ticket = machine.begin_download(record)?;
        self.inner.spawn_download(&machine, ticket);
        Ok(machine.state())
    }

    /// Restart the persisted download, e.g. after startup reconciled to
    /// `Downloading`.
    #[instrument(skip(self))]
    pub fn resume_download(&self) -> Result<AppUpdateState> {
        self.inner.ensure_active()?;
        let mut machine = self.inner.machine();
        let ticket = machine.resume_download()?;
        info!(version = %ticket.target_version, "Resuming update download");
        self.inner.spawn_download(&machine, ticket);
        Ok(machine.state())
    }

    /// Stage the ready update for the next restart.
    pub fn stage(&self) -> Result<AppUpdateState> {
        self.inner.swap(ApplyMode::Stage)
    }

    /// Apply the ready update in place.
    pub fn apply(&self) -> Result<AppUpdateState> {
        self.inner.swap(ApplyMode::Install)
    }

    /// Cancel the running download. Refused while staging or applying.
    #[instrument(skip(self))]
    pub fn cancel(&self) -> Result<AppUpdateState> {
        self.inner.ensure_active()?;
        let mut machine = self.inner.machine();
        let state = machine.cancel_download()?;
        self.inner.abort_download(&machine);
        Ok(state)
    }

    /// Drop in-memory state and reconcile the update directory again.
    #[instrument(skip(self))]
    pub fn resync(&self) -> Result<AppUpdateState> {
        self.inner.ensure_active()?;
        let mut machine = self.inner.machine();
        if machine.state() == AppUpdateState::Swap {
            return Err(UpdateError::NotInterruptible);
        }
        self.inner.abort_download_task();
        let outcome = self.inner.reconciler.reconcile(&self.inner.store);
        machine.reset(outcome);
        Ok(machine.state())
    }
}

impl Inner {
    fn machine(&self) -> MutexGuard<'_, ApplicationUpdateStateMachine> {
        lock(&self.machine)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.config.is_active() {
            Ok(())
        } else {
            Err(UpdateError::Disabled)
        }
    }

    /// Abort the download task once the machine no longer expects it to
    /// report. Takes the machine so callers hold its lock.
    fn abort_download(&self, machine: &ApplicationUpdateStateMachine) {
        if !machine.download_running() {
            self.abort_download_task();
        }
    }

    fn abort_download_task(&self) {
        if let Some(task) = lock(&self.download_task).take() {
            task.abort();
        }
    }

    /// Run the download for `ticket`. Takes the machine so callers hold its
    /// lock; a ticket it no longer expects is dropped.
    fn spawn_download(self: &Arc<Self>, machine: &ApplicationUpdateStateMachine, ticket: DownloadTicket) {
        if !machine.expects_download(ticket.generation) {
            debug!(generation = ticket.generation, "Dropping superseded download ticket");
            return;
        }
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.run_download(ticket).await });
        if let Some(previous) = lock(&self.download_task).replace(task) {
            previous.abort();
        }
    }

    async fn run_download(self: Arc<Self>, ticket: DownloadTicket) {
        let generation = ticket.generation;
        let reporter = Arc::clone(&self);
        let progress: ProgressCallback =
            Arc::new(move |p: DownloadProgress| reporter.machine().report_progress(generation, p));

        info!(
            version = %ticket.target_version,
            url = %ticket.patch.url,
            kind = %ticket.patch.patch_kind,
            "Downloading update patch"
        );

        let result = match self
            .downloader
            .download(&ticket.target_version, &ticket.patch, &ticket.dest, progress)
            .await
        {
            Ok(_) => {
                let dest = ticket.dest.clone();
                let patch = ticket.patch.clone();
                tokio::task::spawn_blocking(move || verify_patch(&dest, &patch))
                    .await
                    .unwrap_or_else(|e| Err(OperationFailure::new(codes::WRITE_ERROR, e.to_string())))
            }
            Err(failure) => Err(failure),
        };

        let mut machine = self.machine();
        let reported = match result {
            Ok(bytes) => {
                info!(version = %ticket.target_version, bytes, "Patch downloaded and verified");
                machine.complete_download(generation)
            }
            Err(failure) => {
                warn!(version = %ticket.target_version, error = %failure, "Patch download failed");
                machine.fail_download(generation, failure.code)
            }
        };

        match reported {
            Ok(_) | Err(UpdateError::StaleOperation) => {}
            Err(e) => error!(error = %e, "Failed to record download result"),
        }
    }

    fn swap(self: &Arc<Self>, mode: ApplyMode) -> Result<AppUpdateState> {
        self.ensure_active()?;
        let request = {
            let mut machine = self.machine();
            let request = machine.begin_swap(mode);
            // Any download running alongside was cancelled by the transition.
            self.abort_download(&machine);
            request?
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let applier = Arc::clone(&inner.applier);
            let result = match tokio::spawn(async move { applier.apply(&request).await }).await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Applier task ended without a result");
                    Err(OperationFailure::new(codes::APPLY_INTERRUPTED, e.to_string()))
                }
            };
            if let Err(e) = inner.machine().finish_swap(result) {
                error!(error = %e, "Failed to record apply result");
            }
        });

        Ok(AppUpdateState::Swap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::ApplyRequest;
    use crate::record::{MarRole, PatchDescriptor, PatchKind, PatchRecord};
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    struct NoopDownloader;

    #[async_trait]
    impl PatchDownloader for NoopDownloader {
        async fn download(
            &self,
            _target_version: &str,
            _patch: &PatchRecord,
            _dest: &Path,
            _progress: ProgressCallback,
        ) -> std::result::Result<u64, OperationFailure> {
            Err(OperationFailure::new(codes::NETWORK_ERROR, "offline"))
        }
    }

    struct NoopApplier;

    #[async_trait]
    impl PatchApplier for NoopApplier {
        async fn apply(&self, _request: &ApplyRequest) -> std::result::Result<(), OperationFailure> {
            Ok(())
        }
    }

    /// Writes the target version as the patch once released.
    #[derive(Default)]
    struct GatedDownloader {
        gate: Notify,
    }

    #[async_trait]
    impl PatchDownloader for GatedDownloader {
        async fn download(
            &self,
            target_version: &str,
            _patch: &PatchRecord,
            dest: &Path,
            _progress: ProgressCallback,
        ) -> std::result::Result<u64, OperationFailure> {
            self.gate.notified().await;
            tokio::fs::write(dest, target_version.as_bytes())
                .await
                .map_err(|e| OperationFailure::new(codes::WRITE_ERROR, e.to_string()))?;
            Ok(target_version.len() as u64)
        }
    }

    struct PanickingApplier;

    #[async_trait]
    impl PatchApplier for PanickingApplier {
        async fn apply(&self, _request: &ApplyRequest) -> std::result::Result<(), OperationFailure> {
            panic!("updater crashed")
        }
    }

    fn descriptor(version: &str) -> UpdateDescriptor {
        UpdateDescriptor {
            target_version: version.to_string(),
            release_notes_uri: None,
            patches: vec![PatchDescriptor {
                url: format!("https://updates.example.com/{}.mar", version),
                patch_kind: PatchKind::Complete,
                size: None,
                sha256: None,
            }],
        }
    }

    async fn wait_for(rx: &mut broadcast::Receiver<AppUpdateState>, target: AppUpdateState) {
        timeout(Duration::from_secs(5), async {
            while rx.recv().await.unwrap() != target {}
        })
        .await
        .expect("transition timed out");
    }

    fn manager(config: UpdateConfig) -> Result<UpdateManager> {
        UpdateManager::new(config, Arc::new(NoopDownloader), Arc::new(NoopApplier))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = UpdateConfig::with_update_dir("/tmp/appupdate");
        config.channel = "stable".to_string();
        assert!(matches!(manager(config), Err(UpdateError::Config(_))));
    }

    #[test]
    fn test_disabled_manager_does_not_touch_disk() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path());
        std::fs::write(store.status_path(), "applying\n").unwrap();

        let mut config = UpdateConfig::with_update_dir(dir.path());
        config.disabled_for_testing = true;
        let manager = manager(config).unwrap();

        assert_eq!(manager.current_state(), AppUpdateState::Idle);
        assert!(matches!(manager.stage(), Err(UpdateError::Disabled)));
        assert!(matches!(manager.cancel(), Err(UpdateError::Disabled)));
        assert!(!manager.should_retry_download());
        assert_eq!(store.read_status(), StatusToken::Applying);
    }

    #[test]
    fn test_new_reconciles_once() {
        let dir = TempDir::new().unwrap();
        let store = PersistedStateStore::new(dir.path());
        std::fs::write(store.status_path(), "failed:101\n").unwrap();

        let manager = manager(UpdateConfig::with_update_dir(dir.path())).unwrap();

        assert_eq!(manager.current_state(), AppUpdateState::Idle);
        assert_eq!(manager.last_outcome(), StatusToken::Failed(101));
        assert_eq!(store.read_status(), StatusToken::None);
    }

    #[tokio::test]
    async fn test_stage_without_ready_update() {
        let dir = TempDir::new().unwrap();
        let manager = manager(UpdateConfig::with_update_dir(dir.path())).unwrap();

        assert!(matches!(manager.stage(), Err(UpdateError::NoReadyUpdate)));
        assert!(matches!(manager.cancel(), Err(UpdateError::NoDownload)));
    }

    #[tokio::test]
    async fn test_overtaken_download_ticket_is_dropped() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(GatedDownloader::default());
        let manager = UpdateManager::new(
            UpdateConfig::with_update_dir(dir.path()),
            downloader.clone(),
            Arc::new(NoopApplier),
        )
        .unwrap();

        // One caller begins 2.0, then another cancels it and starts 3.0
        // before the first gets to spawn its download.
        let overtaken = manager
            .inner
            .machine()
            .begin_download(descriptor("2.0").into_downloading_record().unwrap())
            .unwrap();
        manager.cancel().unwrap();
        manager.start_download(descriptor("3.0")).unwrap();
        {
            let machine = manager.inner.machine();
            manager.inner.spawn_download(&machine, overtaken);
        }

        let next = manager.state_transition();
        downloader.gate.notify_one();
        let state = timeout(Duration::from_secs(5), next).await.unwrap().unwrap();

        assert_eq!(state, AppUpdateState::Pending);
        assert_eq!(manager.get_ready_update().unwrap().target_version, "3.0");
        assert_eq!(
            std::fs::read(manager.inner.store.mar_path(MarRole::Ready)).unwrap(),
            b"3.0"
        );
        assert!(!manager.inner.machine().download_running());
    }

    #[tokio::test]
    async fn test_panicking_applier_fails_swap() {
        let dir = TempDir::new().unwrap();
        let downloader = Arc::new(GatedDownloader::default());
        let manager = UpdateManager::new(
            UpdateConfig::with_update_dir(dir.path()),
            downloader.clone(),
            Arc::new(PanickingApplier),
        )
        .unwrap();
        let mut transitions = manager.transitions();

        manager.start_download(descriptor("2.0")).unwrap();
        downloader.gate.notify_one();
        wait_for(&mut transitions, AppUpdateState::Pending).await;

        assert_eq!(manager.apply().unwrap(), AppUpdateState::Swap);
        let failed = AppUpdateState::Failed(codes::APPLY_INTERRUPTED);
        wait_for(&mut transitions, failed).await;

        assert_eq!(manager.current_state(), failed);
        assert_eq!(
            manager.last_outcome(),
            StatusToken::Failed(codes::APPLY_INTERRUPTED)
        );
        assert_eq!(manager.history()[0].target_version, "2.0");
        assert_eq!(
            manager.inner.store.read_status(),
            StatusToken::Failed(codes::APPLY_INTERRUPTED)
        );
    }
}
