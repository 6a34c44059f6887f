// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Port for handing an assigned task to its worker node.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::node::{NodeId, WorkerNode};
use super::task::{DistributedTask, TaskId};

/// Body a worker node receives on `POST /distributed/execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    /// Node the coordinator handed this attempt to. Echoed back in the
    /// [`TaskResultReport`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Base URL of the coordinator expecting the outcome, when it is not the
    /// worker itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl From<&DistributedTask> for DispatchRequest {
    fn from(task: &DistributedTask) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            node_id: task.assigned_node.clone(),
            reply_to: None,
        }
    }
}

/// Body of `POST /distributed/tasks/complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultReport {
    pub task_id: TaskId,
    /// Reporting node. Failures from a node that no longer holds the task
    /// are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Node rejected task with status {0}")]
    Rejected(u16),

    #[error("Dispatch timed out")]
    Timeout,
}

/// Delivers a task to a node. `Ok` means the node accepted it; the outcome
/// arrives later through `complete_task`.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, node: &WorkerNode, task: &DistributedTask) -> Result<(), DispatchError>;
}
