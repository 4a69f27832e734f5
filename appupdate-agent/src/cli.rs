//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// appupdate agent - drives application self-updates
#[derive(Parser, Debug)]
#[command(name = "appupdate-agent")]
#[command(about = "appupdate agent - drives application self-updates")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "APPUPDATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "APPUPDATE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, env = "APPUPDATE_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Update directory holding the status marker, metadata and patches
    #[arg(long, env = "APPUPDATE_DIR")]
    pub update_dir: Option<PathBuf>,

    /// Update channel (release, beta, nightly, esr)
    #[arg(long)]
    pub channel: Option<String>,

    /// Use the privileged service helper
    #[arg(long)]
    pub use_service: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the reconciled update state as JSON
    Status,

    /// Download an update described by a JSON descriptor file
    Download {
        /// Path to the update descriptor
        descriptor: PathBuf,
    },

    /// Resume the download left over from a previous session
    Resume,

    /// Stage the ready update for the next restart
    Stage,

    /// Apply the ready update in place
    Apply,

    /// Cancel the download left over from a previous session
    Cancel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_download() {
        let args = Args::parse_from([
            "appupdate-agent",
            "--update-dir",
            "/tmp/updates",
            "download",
            "offer.json",
        ]);
        assert_eq!(args.update_dir, Some(PathBuf::from("/tmp/updates")));
        assert_eq!(
            args.command,
            Command::Download {
                descriptor: PathBuf::from("offer.json")
            }
        );
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from(["appupdate-agent", "--use-service", "-l", "debug", "apply"]);
        assert!(args.use_service);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.command, Command::Apply);
    }
}
