//! # appupdate Engine
//!
//! Crash-consistent self-update state for an application.
//!
//! On startup the engine merges three independently persisted pieces of
//! evidence into one state:
//! - **Status marker** - single line token written by whoever acted last
//! - **Metadata document** - the ready and downloading update records
//! - **Patch files** - `patch/update.mar` and `downloading/update.mar`
//!
//! From there a state machine drives updates forward, persisting every
//! transition before it becomes visible.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             UpdateManager               │
//! │  (start_download, stage, apply, cancel) │
//! └──────────┬─────────────────┬────────────┘
//!            │ once at startup │ every mutation
//!            ▼                 ▼
//! ┌───────────────────┐ ┌─────────────────────────┐
//! │  StateReconciler  │ │ ApplicationUpdate-      │
//! │  (decision table) │ │ StateMachine            │
//! └─────────┬─────────┘ └──────┬───────────┬──────┘
//!           │                  │           │ spawned tasks
//!           ▼                  ▼           ▼
//! ┌─────────────────────────────────┐ ┌──────────────────┐
//! │       PersistedStateStore       │ │ PatchDownloader  │
//! │  update.status, metadata, mars  │ │ PatchApplier     │
//! └─────────────────────────────────┘ └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use appupdate_engine::{UpdateConfig, UpdateManager};
//!
//! let manager = UpdateManager::new(config, downloader, applier)?;
//! let next = manager.state_transition();
//! manager.start_download(descriptor)?;
//! let state = next.await?;
//! ```

pub mod collaborator;
pub mod config;
pub mod error;
pub mod machine;
pub mod manager;
pub mod reconcile;
pub mod record;
pub mod status;
pub mod store;

pub use collaborator::{ApplyMode, ApplyRequest, PatchApplier, PatchDownloader, ProgressCallback};
pub use config::UpdateConfig;
pub use error::{codes, FailureCode, OperationFailure, Result, UpdateError};
pub use machine::{ApplicationUpdateStateMachine, DownloadTicket, MachineSettings};
pub use manager::UpdateManager;
pub use reconcile::{decide, ReconcileInput, ReconcileOutcome, StateReconciler};
pub use record::{
    compare_versions, MarRole, PatchDescriptor, PatchKind, PatchRecord, UpdateDescriptor,
    UpdateRecord, UpdateRecordValidity,
};
pub use status::{AppUpdateState, DownloadProgress, StatusToken};
pub use store::{PersistedState, PersistedStateStore};
