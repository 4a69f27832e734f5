//! # appupdate Agent
//!
//! Drives application self-updates from the command line. Each invocation
//! reconciles the update directory once, runs one operation, and waits for
//! it to settle.
//!
//! ## Usage
//! ```bash
//! appupdate-agent --config /etc/appupdate/agent.yaml status
//! appupdate-agent download offer.json
//! appupdate-agent apply
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use appupdate_common::LogFormat;
use appupdate_engine::{AppUpdateState, StatusToken, UpdateDescriptor, UpdateManager};
use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

mod applier;
mod cli;
mod config;
mod downloader;

use applier::CommandPatchApplier;
use cli::{Args, Command};
use config::{AgentConfig, DEFAULT_CONFIG_PATH};
use downloader::HttpPatchDownloader;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let (config, source) = match &args.config {
        Some(path) => (
            AgentConfig::load(path)?.with_cli_overrides(&args),
            Some(path.display().to_string()),
        ),
        None => match AgentConfig::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => (cfg.with_cli_overrides(&args), Some(DEFAULT_CONFIG_PATH.to_string())),
            Err(_) => (AgentConfig::default().with_cli_overrides(&args), None),
        },
    };
    config.validate()?;

    // Initialize logging
    match config.log_format.parse::<LogFormat>()? {
        LogFormat::Pretty => appupdate_common::init_logging(&config.log_level)?,
        LogFormat::Json => appupdate_common::init_logging_json(&config.log_level)?,
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = source.as_deref().unwrap_or("defaults"),
        "Starting appupdate agent"
    );

    if let Err(e) = run(config, args.command).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }

    Ok(())
}

async fn run(config: AgentConfig, command: Command) -> Result<()> {
    let downloader = Arc::new(HttpPatchDownloader::new(&config.download)?);
    let applier = Arc::new(CommandPatchApplier::new(config.applier.clone()));
    let manager = UpdateManager::new(config.updates.clone(), downloader, applier)
        .context("Failed to initialize update manager")?;

    let mut transitions = manager.transitions();

    match command {
        Command::Status => {}
        Command::Download { descriptor } => {
            let descriptor = load_descriptor(&descriptor)?;
            manager.start_download(descriptor)?;
            watch_progress(&manager);
            wait_for_download(&manager, &mut transitions).await?;
        }
        Command::Resume => {
            manager.resume_download()?;
            watch_progress(&manager);
            wait_for_download(&manager, &mut transitions).await?;
        }
        Command::Stage => {
            manager.stage()?;
            wait_for_swap(&mut transitions).await?;
        }
        Command::Apply => {
            manager.apply()?;
            wait_for_swap(&mut transitions).await?;
        }
        Command::Cancel => {
            manager.cancel()?;
        }
    }

    print_status(&manager)
}

fn load_descriptor(path: &Path) -> Result<UpdateDescriptor> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read descriptor: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse descriptor: {}", path.display()))
}

fn watch_progress(manager: &UpdateManager) {
    let mut progress = manager.progress();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            if let Some(p) = progress.borrow_and_update().clone() {
                info!(
                    version = %p.target_version,
                    downloaded = p.downloaded_bytes,
                    total = ?p.total_bytes,
                    percentage = p.percentage,
                    "Download progress"
                );
            }
        }
    });
}

/// Wait until the download handed out has reported back.
async fn wait_for_download(
    manager: &UpdateManager,
    transitions: &mut broadcast::Receiver<AppUpdateState>,
) -> Result<()> {
    while manager.get_downloading_update().is_some() {
        match transitions.recv().await {
            Ok(state) => info!(state = %state, "Update state changed"),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    if manager.last_outcome() == StatusToken::DownloadFailed && !manager.should_retry_download() {
        warn!("Download attempts exhausted");
    }
    Ok(())
}

/// Wait until staging or applying finishes.
async fn wait_for_swap(transitions: &mut broadcast::Receiver<AppUpdateState>) -> Result<()> {
    loop {
        match transitions.recv().await {
            Ok(state) if state.is_terminal() => {
                info!(state = %state, "Update swap finished");
                return Ok(());
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("Update manager shut down before the swap finished")
            }
        }
    }
}

fn print_status(manager: &UpdateManager) -> Result<()> {
    let status = json!({
        "state": manager.current_state(),
        "last_outcome": manager.last_outcome().to_string(),
        "ready": manager.get_ready_update(),
        "downloading": manager.get_downloading_update(),
        "history": manager.history(),
        "should_retry_download": manager.should_retry_download(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
