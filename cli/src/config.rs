// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Daemon Configuration - Kubernetes-style manifest for a convoy host
//
// Defines the configuration schema for a convoy daemon:
// - apiVersion/kind/metadata/spec manifest envelope
// - Message bus, orchestrator and distributed coordinator tuning
// - Storage backend selection
// - Network binding and observability settings
//
// Durations are written in humantime form ("30s", "500ms").

use anyhow::Context;
use convoy_core::application::{BridgeConfig, BusConfig, OrchestratorConfig};
use convoy_core::domain::repository::StorageBackend;
use convoy_swarm::application::CoordinatorConfig;
use convoy_swarm::LoadBalanceStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const API_VERSION: &str = "convoy/v1";
pub const KIND: &str = "ConvoyConfig";
pub const CONFIG_PATH_ENV: &str = "CONVOY_CONFIG_PATH";

/// Top-level configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoyConfig {
    /// API version (must be "convoy/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ConvoyConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: ConvoySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable host name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoySpec {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,

    /// Database directory for the sled backend (default: ~/.convoy/data)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve(&self) -> StorageBackend {
        match self.backend {
            StorageKind::Memory => StorageBackend::InMemory,
            StorageKind::Sled => StorageBackend::Sled {
                path: self.path.clone().unwrap_or_else(default_data_dir),
            },
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".convoy")
        .join("data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP port serving the worker endpoints
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Expose a Prometheus scrape endpoint
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "convoy".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: ConvoySpec::default(),
        }
    }
}

impl ConvoyConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Standard locations, in precedence order, after the `--config` flag.
    pub fn discovery_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from("./convoy-config.yaml"));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".convoy").join("config.yaml"));
        }
        #[cfg(unix)]
        paths.push(PathBuf::from("/etc/convoy/config.yaml"));
        #[cfg(windows)]
        paths.push(PathBuf::from("C:\\ProgramData\\Convoy\\config.yaml"));
        paths
    }

    /// First existing file among [`Self::discovery_paths`].
    pub fn discover_config() -> Option<PathBuf> {
        Self::discovery_paths().into_iter().find(|p| p.exists())
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse.
        if let Some(path) = cli_path {
            tracing::info!(path = %path.display(), "Loading configuration from explicit path");
            let mut config = Self::from_yaml_file(&path)?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading configuration from discovered path");
                Self::from_yaml_file(path)?
            }
            None => {
                tracing::warn!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variable overrides for container deployments
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CONVOY_MAX_CONCURRENT_AGENTS") {
            match val.parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: CONVOY_MAX_CONCURRENT_AGENTS={}", n);
                    self.spec.orchestrator.max_concurrent_agents = n;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for CONVOY_MAX_CONCURRENT_AGENTS: '{}'. Expected a number. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("CONVOY_LB_STRATEGY") {
            match val.parse::<LoadBalanceStrategy>() {
                Ok(strategy) => {
                    tracing::info!("Environment override: CONVOY_LB_STRATEGY={}", strategy);
                    self.spec.coordinator.strategy = strategy;
                }
                Err(e) => tracing::warn!("{}. Ignoring CONVOY_LB_STRATEGY.", e),
            }
        }

        if let Ok(val) = std::env::var("CONVOY_REDIS_URL") {
            tracing::info!("Environment override: CONVOY_REDIS_URL set, bridging the message bus");
            let bridge = self.spec.bus.bridge.get_or_insert_with(BridgeConfig::default);
            bridge.url = val;
        }

        if let Ok(val) = std::env::var("CONVOY_STORAGE_PATH") {
            tracing::info!("Environment override: CONVOY_STORAGE_PATH={}", val);
            self.spec.storage.backend = StorageKind::Sled;
            self.spec.storage.path = Some(PathBuf::from(val));
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let orchestrator = &self.spec.orchestrator;
        if orchestrator.max_concurrent_agents == 0 {
            anyhow::bail!("spec.orchestrator.max_concurrent_agents must be at least 1");
        }

        let coordinator = &self.spec.coordinator;
        if coordinator.local_node.max_capacity == 0 {
            anyhow::bail!("spec.coordinator.local_node.max_capacity must be at least 1");
        }
        if coordinator.liveness_threshold <= coordinator.heartbeat_interval {
            anyhow::bail!(
                "spec.coordinator.liveness_threshold ({:?}) must be longer than heartbeat_interval ({:?})",
                coordinator.liveness_threshold,
                coordinator.heartbeat_interval
            );
        }

        if self.spec.bus.history_size == 0 {
            anyhow::bail!("spec.bus.history_size must be at least 1");
        }
        if let Some(bridge) = &self.spec.bus.bridge {
            if bridge.channel.is_empty() {
                anyhow::bail!("spec.bus.bridge.channel cannot be empty");
            }
        }

        Ok(())
    }
}
