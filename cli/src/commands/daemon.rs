// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon lifecycle commands
//!
//! Commands: start, status

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ConvoyConfig;
use crate::daemon::{base_url, check_daemon_running, init_logging, start_daemon, DaemonStatus};

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground until Ctrl+C or SIGTERM
    Start {
        /// Override the configured listen port
        #[arg(long, env = "CONVOY_PORT")]
        port: Option<u16>,
    },

    /// Check whether a daemon answers at the configured address
    Status {
        /// Daemon base URL (default: from configuration)
        #[arg(long)]
        url: Option<String>,
    },
}

pub async fn handle_command(
    command: DaemonCommand,
    config_path: Option<PathBuf>,
    log_level: Option<String>,
) -> Result<()> {
    match command {
        DaemonCommand::Start { port } => start(config_path, log_level, port).await,
        DaemonCommand::Status { url } => status(config_path, log_level, url).await,
    }
}

async fn start(
    config_path: Option<PathBuf>,
    log_level: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let mut config =
        ConvoyConfig::load_or_default(config_path).context("Failed to load configuration")?;
    if let Some(port) = port {
        config.spec.network.port = port;
        config.spec.coordinator.local_node.port = port;
    }

    let logging = &config.spec.observability.logging;
    init_logging(log_level.as_deref().unwrap_or(&logging.level), logging.format)?;

    config
        .validate()
        .context("Configuration validation failed")?;
    info!(
        name = %config.metadata.name,
        storage = ?config.spec.storage.resolve(),
        "Configuration loaded"
    );

    let url = base_url(&config.spec.network.bind_address, config.spec.network.port);
    match check_daemon_running(&url).await {
        Ok(DaemonStatus::Running { .. }) => {
            println!("{}", format!("✓ Daemon already running at {}", url).green());
            return Ok(());
        }
        Ok(DaemonStatus::Unhealthy { error }) => {
            anyhow::bail!("Address {} is taken by an unhealthy service: {}", url, error);
        }
        Ok(DaemonStatus::Stopped) => {}
        Err(e) => warn!("Failed to check daemon status: {}", e),
    }

    start_daemon(config).await
}

async fn status(
    config_path: Option<PathBuf>,
    log_level: Option<String>,
    url: Option<String>,
) -> Result<()> {
    init_logging(
        log_level.as_deref().unwrap_or("warn"),
        crate::config::LogFormat::Compact,
    )?;

    let url = match url {
        Some(url) => url,
        None => {
            let config = ConvoyConfig::load_or_default(config_path)
                .context("Failed to load configuration")?;
            base_url(&config.spec.network.bind_address, config.spec.network.port)
        }
    };

    match check_daemon_running(&url).await {
        Ok(DaemonStatus::Running { uptime }) => {
            println!("{}", "✓ Daemon is running".green());
            println!("  URL: {}", url);
            if let Some(uptime) = uptime {
                println!(
                    "  Uptime: {}",
                    humantime_serde::re::humantime::format_duration(Duration::from_secs(uptime))
                );
            }
            if let Some(stats) = fetch_stats(&url).await {
                println!(
                    "  Nodes: {} online / {} total",
                    stats["nodes"]["online"], stats["nodes"]["total"]
                );
                println!(
                    "  Tasks: {} running, {} queued, {} completed, {} failed",
                    stats["tasks"]["running"],
                    stats["tasks"]["queued"],
                    stats["tasks"]["completed"],
                    stats["tasks"]["failed"]
                );
            }
        }
        Ok(DaemonStatus::Stopped) => {
            println!("{}", "✗ Daemon is not running".red());
        }
        Ok(DaemonStatus::Unhealthy { error }) => {
            println!("{}", "⚠ Daemon unhealthy".yellow());
            println!("  HTTP health check failed: {}", error);
        }
        Err(e) => {
            println!("{}", format!("✗ Failed to check status: {}", e).red());
            return Err(e);
        }
    }

    Ok(())
}

async fn fetch_stats(url: &str) -> Option<serde_json::Value> {
    let response = reqwest::Client::new()
        .get(format!("{}/distributed/stats", url))
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .ok()?;
    response.json().await.ok()
}
