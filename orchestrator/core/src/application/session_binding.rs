// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Drives session state from agent lifecycle events.
//!
//! Agents registered with `AgentSpec::for_session` carry their session id in
//! every `orchestrator.*` event. The binding maps those events onto session
//! transitions:
//!
//! | Agent event | Session transition |
//! |-------------|--------------------|
//! | `agent_started` | `start` (session created on first use) |
//! | `agent_completed` | `complete`, or `error` for an unsuccessful result |
//! | `agent_failed` | `error` |
//! | `agent_cancelled` | `error` with reason `cancelled` |
//! | `agent_paused` / `agent_resumed` | `pause` / `resume` |

use std::sync::Arc;
use tracing::{debug, warn};

use crate::application::message_bus::{MessageBus, SubscribeOptions};
use crate::application::session_machine::{SessionError, SessionMachine};
use crate::domain::events::{AgentLifecycleEvent, ORCHESTRATOR_TOPIC_PREFIX};
use crate::domain::message::SubscriptionId;

const BINDING_SUBSCRIBER: &str = "session_binding";
const DEFAULT_PROJECT: &str = "default";

/// Subscribe the session machine to orchestrator events. Returns the
/// subscription so callers can detach it.
pub fn bind_sessions(bus: &MessageBus, sessions: Arc<SessionMachine>) -> SubscriptionId {
    let pattern = format!("{ORCHESTRATOR_TOPIC_PREFIX}*");
    bus.subscribe_with(
        &pattern,
        SubscribeOptions::default().subscriber(BINDING_SUBSCRIBER),
        move |message| {
            let sessions = sessions.clone();
            async move {
                match serde_json::from_value::<AgentLifecycleEvent>(message.payload) {
                    Ok(event) => apply_event(&sessions, event).await,
                    Err(e) => warn!(topic = %message.topic, error = %e, "Unreadable lifecycle event"),
                }
                Ok(None)
            }
        },
    )
}

/// Apply one lifecycle event to the bound session, if any.
pub async fn apply_event(sessions: &SessionMachine, event: AgentLifecycleEvent) {
    let Some(session_id) = event.session_id().cloned() else {
        return;
    };

    let outcome = match &event {
        AgentLifecycleEvent::AgentStarted { goal, .. } => {
            sessions
                .ensure_session(&session_id, DEFAULT_PROJECT, goal, "agent")
                .await;
            sessions.start(&session_id).await
        }
        AgentLifecycleEvent::AgentCompleted { result, .. } if result.success => {
            sessions
                .complete(&session_id, Some(result.output.clone()))
                .await
        }
        AgentLifecycleEvent::AgentCompleted { result, .. } => {
            sessions.fail(&session_id, result.error.as_deref()).await
        }
        AgentLifecycleEvent::AgentFailed { error, .. } => {
            sessions.fail(&session_id, Some(error.as_str())).await
        }
        AgentLifecycleEvent::AgentCancelled { .. } => {
            sessions.fail(&session_id, Some("cancelled")).await
        }
        AgentLifecycleEvent::AgentPaused { .. } => sessions.pause(&session_id).await,
        AgentLifecycleEvent::AgentResumed { .. } => sessions.resume(&session_id).await,
        _ => return,
    };

    match outcome {
        Ok(session) => debug!(
            session_id = %session_id,
            state = %session.state,
            event = event.name(),
            "Session followed agent event"
        ),
        Err(SessionError::InvalidTransition { state, .. }) => debug!(
            session_id = %session_id,
            state = %state,
            event = event.name(),
            "Agent event does not apply to session state"
        ),
        Err(e) => warn!(session_id = %session_id, error = %e, "Failed to apply agent event to session"),
    }
}
