//! Configuration management for the agent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use appupdate_common::LogFormat;
use appupdate_engine::UpdateConfig;
use serde::{Deserialize, Serialize};

use crate::cli::Args;

/// Default configuration path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/appupdate/agent.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (pretty, json)
    pub log_format: String,
    /// Update engine configuration
    pub updates: UpdateConfig,
    /// Patch download settings
    pub download: DownloadConfig,
    /// Updater executable settings
    pub applier: ApplierConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            updates: UpdateConfig::default(),
            download: DownloadConfig::default(),
            applier: ApplierConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.log_level = level.clone();
        }

        if let Some(ref format) = args.log_format {
            self.log_format = format.clone();
        }

        if let Some(ref dir) = args.update_dir {
            self.updates.update_dir = dir.clone();
        }

        if let Some(ref channel) = args.channel {
            self.updates.channel = channel.clone();
        }

        if args.use_service {
            self.updates.use_service = true;
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.log_format.parse::<LogFormat>()?;
        self.updates
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid updates section: {}", e))?;
        self.download.validate()?;
        Ok(())
    }
}

/// Patch download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            timeout_secs: 300,
        }
    }
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 || self.timeout_secs == 0 {
            anyhow::bail!("Download timeouts must be greater than zero");
        }
        Ok(())
    }
}

/// Updater executable settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplierConfig {
    /// Updater executable
    pub updater_path: PathBuf,
    /// Arguments passed before the generated ones
    pub args: Vec<String>,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            updater_path: PathBuf::from("/usr/lib/appupdate/updater"),
            args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_yaml_parsing() {
        let yaml = r#"
log_level: debug
log_format: json

updates:
  channel: beta
  update_dir: /var/lib/myapp/updates
  staging_enabled: false

download:
  timeout_secs: 60

applier:
  updater_path: /opt/myapp/updater
  args:
    - --quiet
"#;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = AgentConfig::load(&path).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.updates.channel, "beta");
        assert!(!config.updates.staging_enabled);
        assert_eq!(config.updates.max_download_attempts, 2);
        assert_eq!(config.download.timeout_secs, 60);
        assert_eq!(config.download.connect_timeout_secs, 30);
        assert_eq!(config.applier.args, vec!["--quiet".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        assert!(AgentConfig::load("/nonexistent/agent.yaml").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "appupdate-agent",
            "--update-dir",
            "/tmp/updates",
            "--channel",
            "nightly",
            "--log-format",
            "json",
            "status",
        ]);
        let config = AgentConfig::default().with_cli_overrides(&args);

        assert_eq!(config.updates.update_dir, PathBuf::from("/tmp/updates"));
        assert_eq!(config.updates.channel, "nightly");
        assert_eq!(config.log_format, "json");
    }

    #[test]
    fn test_invalid_values() {
        let mut config = AgentConfig::default();
        config.log_format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.download.timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
