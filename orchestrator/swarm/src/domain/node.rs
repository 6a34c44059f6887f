// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Worker Nodes
//!
//! A [`WorkerNode`] is a process able to execute distributed tasks. Nodes
//! announce themselves through registration and stay eligible for work only
//! while their heartbeats are fresh.
//!
//! ```text
//! online ⇄ busy          (load reaches / drops below capacity)
//! online → offline       (heartbeat older than the liveness threshold)
//! offline → online       (heartbeat received again)
//! any → draining         (deregistration in progress)
//! ```

use chrono::{DateTime, Utc};
use convoy_core::domain::prefixed_id;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default number of concurrent tasks a node accepts.
pub const DEFAULT_MAX_CAPACITY: u32 = 5;

/// Node identifier, `node_<8 hex>` when generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(prefixed_id("node_", 8))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Busy,
    /// Not accepting new work; finishing what it has.
    Draining,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Busy => "busy",
            NodeStatus::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// What kind of work a node can take. Serialized as a bare string, so
/// `"research"` and `"gpu"` both round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    Research,
    Code,
    Chat,
    Custom(String),
}

impl Capability {
    pub fn as_str(&self) -> &str {
        match self {
            Capability::Research => "research",
            Capability::Code => "code",
            Capability::Chat => "chat",
            Capability::Custom(name) => name,
        }
    }

    /// Capabilities of a node when none are configured.
    pub fn defaults() -> BTreeSet<Capability> {
        [Capability::Research, Capability::Code, Capability::Chat]
            .into_iter()
            .collect()
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "research" => Capability::Research,
            "code" => Capability::Code,
            "chat" => Capability::Chat,
            _ => Capability::Custom(value.trim().to_string()),
        }
    }
}

impl From<String> for Capability {
    fn from(value: String) -> Self {
        Capability::from(value.as_str())
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Capability::from(s))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: NodeId,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    pub capabilities: BTreeSet<Capability>,
    pub current_load: u32,
    pub max_capacity: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl WorkerNode {
    pub fn new(
        id: NodeId,
        hostname: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        capabilities: BTreeSet<Capability>,
        max_capacity: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            hostname: hostname.into(),
            address: address.into(),
            port,
            status: NodeStatus::Online,
            capabilities,
            current_load: 0,
            max_capacity,
            last_heartbeat: now,
            registered_at: now,
            metadata: BTreeMap::new(),
        }
    }

    pub fn available_capacity(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_load)
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// Online, with spare capacity, and heard from within `threshold`.
    pub fn is_available(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status == NodeStatus::Online
            && self.available_capacity() > 0
            && self.heartbeat_age(now) < threshold
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Base URL of the node's worker endpoint.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// Take one unit of load.
    pub fn acquire_slot(&mut self) {
        self.current_load = self.current_load.saturating_add(1);
        self.refresh_status();
    }

    /// Give back one unit of load. Never drops below zero.
    pub fn release_slot(&mut self) {
        self.current_load = self.current_load.saturating_sub(1);
        self.refresh_status();
    }

    /// Record a heartbeat, optionally overriding the reported load.
    /// Returns true if the node came back from `offline`.
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>, load: Option<u32>) -> bool {
        self.last_heartbeat = at;
        if let Some(load) = load {
            self.current_load = load;
        }
        let revived = self.status == NodeStatus::Offline;
        if revived {
            self.status = NodeStatus::Online;
        }
        self.refresh_status();
        revived
    }

    /// Toggle between `online` and `busy` as capacity fills and frees.
    /// `offline` and `draining` are left alone.
    pub fn refresh_status(&mut self) {
        match self.status {
            NodeStatus::Online if self.available_capacity() == 0 => {
                self.status = NodeStatus::Busy
            }
            NodeStatus::Busy if self.available_capacity() > 0 => self.status = NodeStatus::Online,
            _ => {}
        }
    }
}
