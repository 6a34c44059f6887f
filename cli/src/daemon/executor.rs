// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Runs dispatched tasks on this node.
//!
//! A task becomes a supervised agent of the registered type named by its
//! `task_type`. Once the agent settles, the outcome goes to the coordinator
//! that owns the task: the local one if it knows the task, otherwise the
//! `reply_to` address from the dispatch request.

use convoy_core::application::{Orchestrator, OrchestratorError};
use convoy_core::domain::agent::{
    AgentId, AgentRuntimeState, AgentSpec, AgentStatus, AgentTypeRegistry, RestartPolicy,
};
use convoy_core::domain::session::SessionId;
use convoy_swarm::application::DistributedCoordinator;
use convoy_swarm::infrastructure::COMPLETE_PATH;
use convoy_swarm::{DispatchRequest, TaskResultReport};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("No agent registered for task type '{0}'")]
    UnknownTaskType(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

#[derive(Clone)]
pub struct TaskExecutor {
    orchestrator: Orchestrator,
    agent_types: AgentTypeRegistry,
    coordinator: DistributedCoordinator,
    client: reqwest::Client,
}

impl TaskExecutor {
    pub fn new(
        orchestrator: Orchestrator,
        agent_types: AgentTypeRegistry,
        coordinator: DistributedCoordinator,
    ) -> Self {
        Self {
            orchestrator,
            agent_types,
            coordinator,
            client: reqwest::Client::new(),
        }
    }

    /// Start an agent for `request` and return immediately. The outcome is
    /// reported in the background.
    ///
    /// Payload keys understood here: `goal`, `session_id`, `max_restarts`
    /// (restarts on failure, default none) and `timeout_secs`. The whole
    /// payload is passed to the agent as its params.
    pub async fn execute(&self, request: DispatchRequest) -> Result<AgentId, ExecuteError> {
        let factory = self
            .agent_types
            .get(&request.task_type)
            .ok_or_else(|| ExecuteError::UnknownTaskType(request.task_type.clone()))?;

        let payload = &request.payload;
        let mut spec = AgentSpec::new(request.task_type.clone(), factory)
            .with_id(format!("agent-{}", request.task_id))
            .with_restart_policy(RestartPolicy::OnFailure)
            .with_max_restarts(max_restarts(payload));
        if let Some(session_id) = payload["session_id"].as_str() {
            spec = spec.for_session(SessionId::from(session_id));
        }
        if let Some(secs) = payload["timeout_secs"].as_u64() {
            spec = spec.with_timeout(Duration::from_secs(secs));
        }

        let goal = payload["goal"]
            .as_str()
            .unwrap_or(&request.task_type)
            .to_string();

        let agent_id = self.orchestrator.register(spec).await?;
        if let Err(e) = self
            .orchestrator
            .start(&agent_id, &goal, request.payload.clone())
            .await
        {
            self.orchestrator.unregister(&agent_id).await;
            return Err(e.into());
        }
        info!(task_id = %request.task_id, agent_id = %agent_id, task_type = %request.task_type, "Executing task");

        let executor = self.clone();
        let id = agent_id.clone();
        tokio::spawn(async move {
            executor.finish(request, id).await;
        });

        Ok(agent_id)
    }

    async fn finish(&self, request: DispatchRequest, agent_id: AgentId) {
        let (result, success) = match self.orchestrator.wait(&agent_id).await {
            Ok(state) => outcome_of(&state),
            Err(e) => (json!({ "error": e.to_string() }), false),
        };
        debug!(task_id = %request.task_id, success, "Task finished on this node");

        self.report(&request, result, success).await;
        self.orchestrator.unregister(&agent_id).await;
    }

    async fn report(&self, request: &DispatchRequest, result: Value, success: bool) {
        let task_id = &request.task_id;
        if self.coordinator.task(task_id).is_some() {
            if let Err(e) = self
                .coordinator
                .complete_task_from(task_id, request.node_id.as_ref(), result, success)
                .await
            {
                warn!(task_id = %task_id, error = %e, "Failed to record task outcome");
            }
            return;
        }

        let Some(base_url) = request.reply_to.as_deref() else {
            warn!(task_id = %task_id, "Task outcome has no coordinator to go to");
            return;
        };

        let report = TaskResultReport {
            task_id: task_id.clone(),
            node_id: request.node_id.clone(),
            result,
            success,
        };
        let url = format!("{}{COMPLETE_PATH}", base_url.trim_end_matches('/'));
        match self
            .client
            .post(&url)
            .timeout(REPORT_TIMEOUT)
            .json(&report)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!(task_id = %task_id, url = %url, "Reported task outcome");
            }
            Ok(resp) => {
                warn!(task_id = %task_id, status = %resp.status(), "Coordinator refused task outcome");
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to report task outcome");
            }
        }
    }
}

/// Restart budget from the payload; absent means none, values beyond `u32`
/// saturate.
fn max_restarts(payload: &Value) -> u32 {
    payload["max_restarts"]
        .as_u64()
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Result payload and success flag for a settled agent.
fn outcome_of(state: &AgentRuntimeState) -> (Value, bool) {
    match (&state.status, &state.result) {
        (AgentStatus::Completed, Some(result)) if result.success => (result.output.clone(), true),
        (AgentStatus::Completed, Some(result)) => (
            json!({
                "error": result.error.clone().unwrap_or_else(|| "agent failed".to_string()),
                "output": result.output,
                "timed_out": result.timed_out,
            }),
            false,
        ),
        _ => (
            json!({
                "error": state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("agent ended {}", state.status)),
            }),
            false,
        ),
    }
}
