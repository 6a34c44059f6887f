// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon mode implementation
//!
//! Handles:
//! - Logging setup
//! - Service wiring (bus, sessions, supervisor, coordinator)
//! - The HTTP worker API and graceful shutdown
//! - HTTP health checks against a running daemon

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::LogFormat;

pub mod agents;
pub mod context;
pub mod executor;
pub mod server;

pub use context::AppContext;
pub use server::{router, start_daemon};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { uptime: Option<u64> },
    Stopped,
    Unhealthy { error: String },
}

/// Initialize tracing subscriber for logging
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let result = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}

/// `http://host:port`, keeping an explicit scheme if one is given.
pub fn base_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host, port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

/// Check if a daemon answers the HTTP health check at `base_url`.
pub async fn check_daemon_running(base_url: &str) -> Result<DaemonStatus> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()?;

    let health_url = format!("{}/health", base_url);

    match client.get(&health_url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let uptime = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["uptime_seconds"].as_u64());
            Ok(DaemonStatus::Running { uptime })
        }
        Ok(resp) => Ok(DaemonStatus::Unhealthy {
            error: format!("HTTP {}", resp.status()),
        }),
        Err(e) if e.is_connect() || e.is_timeout() => Ok(DaemonStatus::Stopped),
        Err(e) => Ok(DaemonStatus::Unhealthy {
            error: e.to_string(),
        }),
    }
}
