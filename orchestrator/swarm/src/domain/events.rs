// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::node::{Capability, NodeId};
use super::task::TaskId;

pub const DISTRIBUTED_TOPIC_PREFIX: &str = "distributed.";

/// Topic carrying node heartbeats, local and remote.
pub const HEARTBEAT_TOPIC: &str = "distributed.heartbeat";

/// Coordinator events, published on `distributed.<event>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DistributedEvent {
    Heartbeat {
        node_id: NodeId,
        timestamp: DateTime<Utc>,
        load: Option<u32>,
    },
    NodeRegistered {
        node_id: NodeId,
        hostname: String,
        address: String,
        port: u16,
        capabilities: BTreeSet<Capability>,
        max_capacity: u32,
    },
    NodeDeregistered {
        node_id: NodeId,
        requeued: usize,
    },
    NodeOffline {
        node_id: NodeId,
        last_heartbeat: DateTime<Utc>,
        requeued: usize,
    },
    TaskSubmitted {
        task_id: TaskId,
        task_type: String,
        required_capability: Option<Capability>,
    },
    TaskAssigned {
        task_id: TaskId,
        node_id: NodeId,
    },
    TaskCompleted {
        task_id: TaskId,
        node_id: Option<NodeId>,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        retries: u32,
    },
    TaskRequeued {
        task_id: TaskId,
        retries: u32,
        reason: String,
    },
}

impl DistributedEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DistributedEvent::Heartbeat { .. } => "heartbeat",
            DistributedEvent::NodeRegistered { .. } => "node_registered",
            DistributedEvent::NodeDeregistered { .. } => "node_deregistered",
            DistributedEvent::NodeOffline { .. } => "node_offline",
            DistributedEvent::TaskSubmitted { .. } => "task_submitted",
            DistributedEvent::TaskAssigned { .. } => "task_assigned",
            DistributedEvent::TaskCompleted { .. } => "task_completed",
            DistributedEvent::TaskFailed { .. } => "task_failed",
            DistributedEvent::TaskRequeued { .. } => "task_requeued",
        }
    }

    pub fn topic(&self) -> String {
        format!("{DISTRIBUTED_TOPIC_PREFIX}{}", self.name())
    }
}
