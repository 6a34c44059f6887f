// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentId, AgentResult};
use crate::domain::session::SessionId;

/// Topic prefix for everything the orchestrator emits.
pub const ORCHESTRATOR_TOPIC_PREFIX: &str = "orchestrator.";

/// Agent lifecycle events, published on `orchestrator.<event>` with the
/// serialized variant as payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentLifecycleEvent {
    AgentRegistered {
        agent_id: AgentId,
        agent_type: String,
        group: Option<String>,
        session_id: Option<SessionId>,
        registered_at: DateTime<Utc>,
    },
    AgentUnregistered {
        agent_id: AgentId,
        unregistered_at: DateTime<Utc>,
    },
    AgentStarted {
        agent_id: AgentId,
        session_id: Option<SessionId>,
        goal: String,
        attempt: u32,
        started_at: DateTime<Utc>,
    },
    AgentCompleted {
        agent_id: AgentId,
        session_id: Option<SessionId>,
        result: AgentResult,
        completed_at: DateTime<Utc>,
    },
    AgentCancelled {
        agent_id: AgentId,
        session_id: Option<SessionId>,
        cancelled_at: DateTime<Utc>,
    },
    AgentFailed {
        agent_id: AgentId,
        session_id: Option<SessionId>,
        error: String,
        restarts: u32,
        failed_at: DateTime<Utc>,
    },
    AgentRestarting {
        agent_id: AgentId,
        attempt: u32,
        max_restarts: u32,
        delay_ms: u64,
    },
    AgentMaxRestarts {
        agent_id: AgentId,
        session_id: Option<SessionId>,
        restarts: u32,
        max_restarts: u32,
    },
    AgentFailureEscalated {
        agent_id: AgentId,
        session_id: Option<SessionId>,
        error: Option<String>,
    },
    AgentPaused {
        agent_id: AgentId,
        session_id: Option<SessionId>,
    },
    AgentResumed {
        agent_id: AgentId,
        session_id: Option<SessionId>,
    },
}

impl AgentLifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentLifecycleEvent::AgentRegistered { .. } => "agent_registered",
            AgentLifecycleEvent::AgentUnregistered { .. } => "agent_unregistered",
            AgentLifecycleEvent::AgentStarted { .. } => "agent_started",
            AgentLifecycleEvent::AgentCompleted { .. } => "agent_completed",
            AgentLifecycleEvent::AgentCancelled { .. } => "agent_cancelled",
            AgentLifecycleEvent::AgentFailed { .. } => "agent_failed",
            AgentLifecycleEvent::AgentRestarting { .. } => "agent_restarting",
            AgentLifecycleEvent::AgentMaxRestarts { .. } => "agent_max_restarts",
            AgentLifecycleEvent::AgentFailureEscalated { .. } => "agent_failure_escalated",
            AgentLifecycleEvent::AgentPaused { .. } => "agent_paused",
            AgentLifecycleEvent::AgentResumed { .. } => "agent_resumed",
        }
    }

    pub fn topic(&self) -> String {
        format!("{ORCHESTRATOR_TOPIC_PREFIX}{}", self.name())
    }

    pub fn agent_id(&self) -> &AgentId {
        match self {
            AgentLifecycleEvent::AgentRegistered { agent_id, .. }
            | AgentLifecycleEvent::AgentUnregistered { agent_id, .. }
            | AgentLifecycleEvent::AgentStarted { agent_id, .. }
            | AgentLifecycleEvent::AgentCompleted { agent_id, .. }
            | AgentLifecycleEvent::AgentCancelled { agent_id, .. }
            | AgentLifecycleEvent::AgentFailed { agent_id, .. }
            | AgentLifecycleEvent::AgentRestarting { agent_id, .. }
            | AgentLifecycleEvent::AgentMaxRestarts { agent_id, .. }
            | AgentLifecycleEvent::AgentFailureEscalated { agent_id, .. }
            | AgentLifecycleEvent::AgentPaused { agent_id, .. }
            | AgentLifecycleEvent::AgentResumed { agent_id, .. } => agent_id,
        }
    }

    /// Session the agent is bound to, for events that carry one.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            AgentLifecycleEvent::AgentRegistered { session_id, .. }
            | AgentLifecycleEvent::AgentStarted { session_id, .. }
            | AgentLifecycleEvent::AgentCompleted { session_id, .. }
            | AgentLifecycleEvent::AgentCancelled { session_id, .. }
            | AgentLifecycleEvent::AgentFailed { session_id, .. }
            | AgentLifecycleEvent::AgentMaxRestarts { session_id, .. }
            | AgentLifecycleEvent::AgentFailureEscalated { session_id, .. }
            | AgentLifecycleEvent::AgentPaused { session_id, .. }
            | AgentLifecycleEvent::AgentResumed { session_id, .. } => session_id.as_ref(),
            AgentLifecycleEvent::AgentUnregistered { .. }
            | AgentLifecycleEvent::AgentRestarting { .. } => None,
        }
    }
}

/// Structured event handed to external sinks (log shippers, notifiers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub category: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(
        category: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            category: category.into(),
            event_type: event_type.into(),
            source: source.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Port for external event consumers. Delivery is best effort.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: SystemEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_and_tag() {
        let event = AgentLifecycleEvent::AgentFailed {
            agent_id: AgentId::from("agent-1"),
            session_id: Some(SessionId::from("s1")),
            error: "boom".to_string(),
            restarts: 1,
            failed_at: Utc::now(),
        };
        assert_eq!(event.topic(), "orchestrator.agent_failed");
        assert_eq!(event.session_id(), Some(&SessionId::from("s1")));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "agent_failed");
        assert_eq!(json["agent_id"], "agent-1");

        let parsed: AgentLifecycleEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.name(), "agent_failed");
    }
}
