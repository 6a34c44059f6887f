// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Distributed tasks and their retry bookkeeping.
//!
//! Tasks are never deleted. `completed` and `failed` are terminal and kept
//! for audit; everything else can still move.

use chrono::{DateTime, Utc};
use convoy_core::domain::prefixed_id;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::node::{Capability, NodeId};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task identifier, `dtask_<12 hex>` when generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(prefixed_id("dtask_", 12))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Holding a slot on its assigned node.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happened after a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `pending`, waiting in the queue.
    Requeued,
    /// Retries exhausted; the task is `failed`.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedTask {
    pub id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    /// Kept across re-queues so reassignment honours the same constraint.
    pub required_capability: Option<Capability>,
    pub assigned_node: Option<NodeId>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub retries: u32,
    pub max_retries: u32,
}

impl DistributedTask {
    pub fn new(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        required_capability: Option<Capability>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            required_capability,
            assigned_node: None,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn assign(&mut self, node: NodeId) {
        self.assigned_node = Some(node);
        self.status = TaskStatus::Assigned;
    }

    /// The node accepted the task.
    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.started_at = Some(at);
    }

    /// Detach from the node and return to `pending`. Yields the node that held it.
    pub fn reset(&mut self) -> Option<NodeId> {
        self.status = TaskStatus::Pending;
        self.assigned_node.take()
    }

    /// Count a failed attempt. Below `max_retries` the task is reset for
    /// another round; otherwise it is marked `failed` with `error` recorded.
    pub fn record_failure(&mut self, error: &str, at: DateTime<Utc>) -> FailureOutcome {
        self.retries += 1;
        if self.retries < self.max_retries {
            self.status = TaskStatus::Pending;
            FailureOutcome::Requeued
        } else {
            self.status = TaskStatus::Failed;
            self.result = Some(serde_json::json!({ "error": error }));
            self.completed_at = Some(at);
            FailureOutcome::Exhausted
        }
    }

    pub fn complete(&mut self, result: serde_json::Value, at: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_requeues_until_retries_exhausted() {
        let mut task = DistributedTask::new("research", json!({}), None);
        task.assign(NodeId::from("node_a"));

        assert_eq!(task.record_failure("refused", Utc::now()), FailureOutcome::Requeued);
        assert_eq!(task.reset(), Some(NodeId::from("node_a")));
        assert_eq!(task.status, TaskStatus::Pending);

        assert_eq!(task.record_failure("refused", Utc::now()), FailureOutcome::Requeued);
        assert_eq!(task.record_failure("gone", Utc::now()), FailureOutcome::Exhausted);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retries, 3);
        assert_eq!(task.result, Some(json!({ "error": "gone" })));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_task_serializes_status_in_snake_case() {
        let mut task = DistributedTask::new("code", json!({"file": "a.rs"}), Some(Capability::Code));
        task.mark_running(Utc::now());
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["required_capability"], "code");
        assert!(task.id.as_str().starts_with("dtask_"));
        assert_eq!(task.id.as_str().len(), 18);
    }
}
