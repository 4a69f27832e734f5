//! Patch applier - launches the updater executable
//!
//! The updater is invoked as
//!
//! ```text
//! <updater_path> <configured args...> --mode <stage|install> --target-version <v> [--service] <mar>
//! ```
//!
//! and its exit status decides the outcome.

use appupdate_engine::{codes, ApplyRequest, OperationFailure, PatchApplier};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::config::ApplierConfig;

/// Applies patches through an external updater process
pub struct CommandPatchApplier {
    config: ApplierConfig,
}

impl CommandPatchApplier {
    /// Create a new applier
    pub fn new(config: ApplierConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &ApplyRequest) -> Command {
        let mut command = Command::new(&self.config.updater_path);
        command
            .args(&self.config.args)
            .arg("--mode")
            .arg(request.mode.to_string())
            .arg("--target-version")
            .arg(&request.target_version);
        if request.use_service {
            command.arg("--service");
        }
        command.arg(&request.mar_path);
        command
    }
}

#[async_trait]
impl PatchApplier for CommandPatchApplier {
    #[instrument(skip(self, request), fields(version = %request.target_version, mode = %request.mode))]
    async fn apply(&self, request: &ApplyRequest) -> Result<(), OperationFailure> {
        if !request.mar_path.is_file() {
            return Err(OperationFailure::new(
                codes::MAR_MISSING,
                format!("{} not found", request.mar_path.display()),
            ));
        }

        info!(
            updater = %self.config.updater_path.display(),
            mar = %request.mar_path.display(),
            "Launching updater"
        );

        let status = self.command(request).status().await.map_err(|e| {
            OperationFailure::new(
                codes::UPDATER_LAUNCH_FAILED,
                format!("{}: {}", self.config.updater_path.display(), e),
            )
        })?;

        if !status.success() {
            warn!(status = %status, "Updater exited with failure");
            return Err(OperationFailure::new(
                codes::UPDATER_EXIT_FAILURE,
                format!("updater exited with {}", status),
            ));
        }

        info!("Updater finished");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use appupdate_engine::ApplyMode;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn shell(script: &str) -> CommandPatchApplier {
        CommandPatchApplier::new(ApplierConfig {
            updater_path: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string(), "updater".to_string()],
        })
    }

    fn request(dir: &TempDir, mode: ApplyMode) -> ApplyRequest {
        let mar_path = dir.path().join("update.mar");
        std::fs::write(&mar_path, b"MAR1").unwrap();
        ApplyRequest {
            target_version: "2.0".to_string(),
            mar_path,
            mode,
            use_service: false,
        }
    }

    #[tokio::test]
    async fn test_arguments_passed() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("args.txt");
        let script = format!("echo \"$@\" > {}", out.display());
        let request = request(&dir, ApplyMode::Stage);

        shell(&script).apply(&request).await.unwrap();

        let args = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            args.trim(),
            format!(
                "--mode stage --target-version 2.0 {}",
                request.mar_path.display()
            )
        );
    }

    #[tokio::test]
    async fn test_exit_failure() {
        let dir = TempDir::new().unwrap();
        let failure = shell("exit 3")
            .apply(&request(&dir, ApplyMode::Install))
            .await
            .unwrap_err();
        assert_eq!(failure.code, codes::UPDATER_EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let dir = TempDir::new().unwrap();
        let applier = CommandPatchApplier::new(ApplierConfig {
            updater_path: PathBuf::from("/nonexistent/updater"),
            args: Vec::new(),
        });
        let failure = applier
            .apply(&request(&dir, ApplyMode::Install))
            .await
            .unwrap_err();
        assert_eq!(failure.code, codes::UPDATER_LAUNCH_FAILED);
    }

    #[tokio::test]
    async fn test_missing_mar() {
        let dir = TempDir::new().unwrap();
        let mut request = request(&dir, ApplyMode::Install);
        request.mar_path = dir.path().join("gone.mar");
        let failure = shell("exit 0").apply(&request).await.unwrap_err();
        assert_eq!(failure.code, codes::MAR_MISSING);
    }
}
