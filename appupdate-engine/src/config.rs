//! Update configuration
//!
//! Usually embedded in the agent configuration under the `updates` section.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Channels an application can follow
pub const CHANNELS: &[&str] = &["release", "beta", "nightly", "esr"];

/// Update engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Whether updates are enabled
    pub enabled: bool,

    /// Set by test harnesses to keep the engine from touching disk
    pub disabled_for_testing: bool,

    /// Update channel (release, beta, nightly, esr)
    pub channel: String,

    /// Root holding the status marker, metadata document and patch directories
    pub update_dir: PathBuf,

    /// Whether `stage` is allowed
    pub staging_enabled: bool,

    /// Whether updates go through the privileged service helper
    pub use_service: bool,

    /// Download attempts before the scheduler should give up
    pub max_download_attempts: u32,

    /// Finished updates kept in history
    pub history_limit: usize,
}

fn default_update_dir() -> PathBuf {
    PathBuf::from("/var/lib/appupdate")
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_for_testing: false,
            channel: "release".to_string(),
            update_dir: default_update_dir(),
            staging_enabled: true,
            use_service: false,
            max_download_attempts: 2,
            history_limit: 10,
        }
    }
}

impl UpdateConfig {
    /// Configuration rooted at `update_dir`, everything else default.
    pub fn with_update_dir(update_dir: impl Into<PathBuf>) -> Self {
        Self {
            update_dir: update_dir.into(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.update_dir.as_os_str().is_empty() {
            return Err("Update directory cannot be empty".to_string());
        }

        if !CHANNELS.contains(&self.channel.as_str()) {
            return Err(format!(
                "Invalid channel '{}'. Must be one of {}",
                self.channel,
                CHANNELS.join(", ")
            ));
        }

        if self.max_download_attempts == 0 {
            return Err("max_download_attempts must be at least 1".to_string());
        }

        Ok(())
    }

    /// Whether reconciliation and the state machine run at all.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.disabled_for_testing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = UpdateConfig::default();
        assert!(config.validate().is_ok());

        config.channel = "stable".to_string();
        assert!(config.validate().is_err());

        config.channel = "esr".to_string();
        config.max_download_attempts = 0;
        assert!(config.validate().is_err());

        config.max_download_attempts = 1;
        config.update_dir = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_active() {
        let mut config = UpdateConfig::default();
        assert!(config.is_active());

        config.disabled_for_testing = true;
        assert!(!config.is_active());

        config.disabled_for_testing = false;
        config.enabled = false;
        assert!(!config.is_active());
    }
}
