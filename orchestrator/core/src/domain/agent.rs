// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Domain Model
//!
//! An *agent* is a unit of work the [`Orchestrator`](crate::application::supervisor::Orchestrator)
//! runs under supervision. Client code supplies an [`AgentFactory`] at registration;
//! every start (including supervised restarts) builds a fresh [`Agent`] from it.
//!
//! ## Cancellation contract
//!
//! Cancellation is cooperative. A long-running agent must poll
//! [`AgentContext::is_cancelled`] (or race [`AgentContext::cancelled`]) at safe points
//! and return [`AgentError::Cancelled`] or a partial [`AgentResult`]. The orchestrator
//! only aborts the task after the configured grace period expires.
//!
//! ## Status lifecycle
//!
//! ```text
//! pending → running ⇄ paused
//!              ├→ completed
//!              ├→ failed ──(restart policy)──→ pending
//!              └→ cancelled
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::prefixed_id;
use super::session::SessionId;

/// Unique identifier of a registered agent (`agent-<8 hex>` when generated).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new() -> Self {
        Self(prefixed_id("agent-", 8))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// When a stopped agent is eligible for a supervised restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Restart after failures and after the agent cancels itself.
    #[default]
    Always,
    /// Restart after failures only.
    OnFailure,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl AgentStatus {
    /// No task will make further progress for this status on its own.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AgentStatus::Initializing | AgentStatus::Running | AgentStatus::Paused
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Initializing => "initializing",
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome produced by one agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub duration_ms: u64,
    /// Set when the orchestrator cut the run short at its execution timeout.
    #[serde(default)]
    pub timed_out: bool,
}

impl AgentResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            iterations: 0,
            duration_ms: 0,
            timed_out: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            iterations: 0,
            duration_ms: 0,
            timed_out: false,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::failure(format!(
                "Execution timeout after {} seconds",
                after.as_secs()
            ))
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent failed: {0}")]
    Failed(String),

    #[error("Agent cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Everything an agent run can see about its invocation.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_id: AgentId,
    pub session_id: Option<SessionId>,
    pub goal: String,
    pub params: serde_json::Value,
    /// Zero for the first run, then the restart count at launch.
    pub attempt: u32,
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
}

impl AgentContext {
    pub fn new(
        agent_id: AgentId,
        session_id: Option<SessionId>,
        goal: impl Into<String>,
        params: serde_json::Value,
        attempt: u32,
        cancel: CancellationToken,
        pause: watch::Receiver<bool>,
    ) -> Self {
        Self {
            agent_id,
            session_id,
            goal: goal.into(),
            params,
            attempt,
            cancel,
            pause,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Suspend while the agent is paused. Returns early on cancellation.
    pub async fn wait_if_paused(&mut self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = self.pause.wait_for(|paused| !*paused) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// A unit of supervised work.
#[async_trait]
pub trait Agent: Send {
    async fn run(&mut self, ctx: AgentContext) -> Result<AgentResult, AgentError>;
}

/// Builds a fresh [`Agent`] for every start and restart.
pub trait AgentFactory: Send + Sync {
    fn create(&self) -> Box<dyn Agent>;
}

/// Adapter turning an async closure into an [`Agent`].
pub struct FnAgent<F> {
    func: Arc<F>,
}

#[async_trait]
impl<F, Fut> Agent for FnAgent<F>
where
    F: Fn(AgentContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentResult, AgentError>> + Send + 'static,
{
    async fn run(&mut self, ctx: AgentContext) -> Result<AgentResult, AgentError> {
        (self.func)(ctx).await
    }
}

pub struct FnAgentFactory<F> {
    func: Arc<F>,
}

impl<F, Fut> AgentFactory for FnAgentFactory<F>
where
    F: Fn(AgentContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentResult, AgentError>> + Send + 'static,
{
    fn create(&self) -> Box<dyn Agent> {
        Box::new(FnAgent {
            func: self.func.clone(),
        })
    }
}

/// Wrap an async closure as an agent factory.
pub fn agent_fn<F, Fut>(func: F) -> Arc<dyn AgentFactory>
where
    F: Fn(AgentContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentResult, AgentError>> + Send + 'static,
{
    Arc::new(FnAgentFactory {
        func: Arc::new(func),
    })
}

/// Registration record for a supervised agent.
#[derive(Clone)]
pub struct AgentSpec {
    pub id: AgentId,
    pub agent_type: String,
    pub factory: Arc<dyn AgentFactory>,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// Static supervision group, fixed at registration.
    pub group: Option<String>,
    pub session_id: Option<SessionId>,
    /// Overrides the orchestrator's default execution timeout.
    pub timeout: Option<Duration>,
}

impl AgentSpec {
    pub fn new(agent_type: impl Into<String>, factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            id: AgentId::new(),
            agent_type: agent_type.into(),
            factory,
            restart_policy: RestartPolicy::default(),
            max_restarts: 3,
            restart_window: Duration::from_secs(60),
            group: None,
            session_id: None,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_restart_window(mut self, window: Duration) -> Self {
        self.restart_window = window;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn for_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for AgentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSpec")
            .field("id", &self.id)
            .field("agent_type", &self.agent_type)
            .field("restart_policy", &self.restart_policy)
            .field("max_restarts", &self.max_restarts)
            .field("restart_window", &self.restart_window)
            .field("group", &self.group)
            .field("session_id", &self.session_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of an agent as tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntimeState {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub restarts: u32,
    pub last_restart: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<AgentResult>,
    /// Whether a task (run or restart back-off) is currently attached.
    pub has_task: bool,
    /// A supervised restart has been scheduled but not launched yet.
    pub restart_pending: bool,
    pub last_goal: Option<String>,
    #[serde(default)]
    pub last_params: serde_json::Value,
}

impl AgentRuntimeState {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            status: AgentStatus::Pending,
            started_at: None,
            restarts: 0,
            last_restart: None,
            last_error: None,
            result: None,
            has_task: false,
            restart_pending: false,
            last_goal: None,
            last_params: serde_json::Value::Null,
        }
    }
}

/// Serializable agent registration plus its latest runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
    #[serde(with = "humantime_serde")]
    pub restart_window: Duration,
    pub group: Option<String>,
    pub session_id: Option<SessionId>,
    pub state: AgentRuntimeState,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn from_parts(spec: &AgentSpec, state: &AgentRuntimeState) -> Self {
        Self {
            agent_id: spec.id.clone(),
            agent_type: spec.agent_type.clone(),
            restart_policy: spec.restart_policy,
            max_restarts: spec.max_restarts,
            restart_window: spec.restart_window,
            group: spec.group.clone(),
            session_id: spec.session_id.clone(),
            state: state.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// String-keyed registry of agent types, the open extension point for
/// user-defined work (e.g. task types dispatched to this node).
#[derive(Clone, Default)]
pub struct AgentTypeRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<dyn AgentFactory>>>>,
}

impl AgentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for an agent type.
    pub fn register(&self, agent_type: impl Into<String>, factory: Arc<dyn AgentFactory>) {
        self.factories.write().insert(agent_type.into(), factory);
    }

    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn AgentFactory>> {
        self.factories.read().get(agent_type).cloned()
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.factories.read().contains_key(agent_type)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_factory() -> Arc<dyn AgentFactory> {
        agent_fn(|_ctx| async { Ok(AgentResult::success(serde_json::json!("ok"))) })
    }

    #[test]
    fn test_agent_id_generation() {
        let id = AgentId::new();
        assert!(id.as_str().starts_with("agent-"));
        assert_eq!(id.as_str().len(), "agent-".len() + 8);
    }

    #[test]
    fn test_spec_defaults() {
        let spec = AgentSpec::new("research", noop_factory());
        assert_eq!(spec.restart_policy, RestartPolicy::Always);
        assert_eq!(spec.max_restarts, 3);
        assert_eq!(spec.restart_window, Duration::from_secs(60));
        assert!(spec.group.is_none());
    }

    #[test]
    fn test_status_predicates() {
        assert!(AgentStatus::Completed.is_settled());
        assert!(AgentStatus::Cancelled.is_settled());
        assert!(!AgentStatus::Pending.is_settled());
        assert!(AgentStatus::Paused.is_active());
        assert!(!AgentStatus::Failed.is_active());
    }

    #[test]
    fn test_timeout_result_is_distinct() {
        let result = AgentResult::timeout(Duration::from_secs(5));
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(
            result.error.as_deref(),
            Some("Execution timeout after 5 seconds")
        );
    }

    #[tokio::test]
    async fn test_fn_factory_builds_fresh_agents() {
        let factory = agent_fn(|ctx: AgentContext| async move {
            Ok(AgentResult::success(serde_json::json!(ctx.goal)))
        });
        let (_tx, rx) = watch::channel(false);
        let ctx = AgentContext::new(
            AgentId::from("a"),
            None,
            "hello",
            serde_json::Value::Null,
            0,
            CancellationToken::new(),
            rx,
        );
        let mut agent = factory.create();
        let result = agent.run(ctx).await.unwrap();
        assert_eq!(result.output, serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn test_wait_if_paused_returns_on_resume() {
        let (tx, rx) = watch::channel(true);
        let mut ctx = AgentContext::new(
            AgentId::from("a"),
            None,
            "",
            serde_json::Value::Null,
            0,
            CancellationToken::new(),
            rx,
        );
        assert!(ctx.is_paused());
        let waiter = tokio::spawn(async move {
            ctx.wait_if_paused().await;
            ctx.is_paused()
        });
        tx.send(false).unwrap();
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = AgentTypeRegistry::new();
        registry.register("echo", noop_factory());
        registry.register("code", noop_factory());
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.types(), vec!["code".to_string(), "echo".to_string()]);
    }
}
