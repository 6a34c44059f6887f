// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Supervisor / Orchestrator
//!
//! Runs registered agents inside a bounded pool of concurrency slots, applies
//! the restart policy when a run fails, and announces every lifecycle change
//! on the message bus under `orchestrator.<event>`.
//!
//! ## Run lifecycle
//!
//! 1. `start` spawns a task; the agent sits in `pending` until a slot frees up.
//! 2. With a slot held the agent moves to `initializing`, then `running`.
//! 3. The outcome (result, cancellation, error or panic) is recorded *before*
//!    the slot is released, so no more than `max_concurrent_agents` agents are
//!    ever `running` at once.
//! 4. Failures go through the supervision policy; an explicit `stop` never
//!    triggers a restart.
//!
//! An execution timeout is not a failure: the run completes with a
//! `timed_out` result.
//!
//! ## Supervision strategies
//!
//! | Strategy | On failure of agent `A` |
//! |----------|-------------------------|
//! | `one_for_one` | restart `A` |
//! | `one_for_all` | stop and restart every member of `A`'s group |
//! | `rest_for_one` | restart `A` and the group members registered after it |
//! | `escalate` | emit `agent_failure_escalated`, no restart |
//!
//! Groups are static: membership is fixed by `AgentSpec::group` at registration.
//! Restart attempts are counted per agent inside `restart_window`; once
//! `max_restarts` is reached `agent_max_restarts` is emitted and the agent stays
//! `failed`. Group peers are held to their own limit: a peer that has used it
//! up is left running and is not part of the group restart. Back-off grows linearly with the attempt number up to a cap.

use chrono::Utc;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::message_bus::MessageBus;
use crate::domain::agent::{
    AgentContext, AgentError, AgentFactory, AgentId, AgentRecord, AgentResult, AgentRuntimeState,
    AgentSpec, AgentStatus, RestartPolicy,
};
use crate::domain::events::AgentLifecycleEvent;
use crate::domain::repository::AgentRepository;
use crate::domain::session::SessionId;

const ORCHESTRATOR_SOURCE: &str = "orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionStrategy {
    #[default]
    OneForOne,
    OneForAll,
    RestForOne,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,

    /// Execution timeout for agents that do not set their own.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    #[serde(default)]
    pub strategy: SupervisionStrategy,

    #[serde(default = "default_true")]
    pub enable_auto_recovery: bool,

    /// How long a graceful stop waits before aborting the task.
    #[serde(default = "default_stop_grace_period", with = "humantime_serde")]
    pub stop_grace_period: Duration,

    #[serde(default = "default_restart_backoff_step", with = "humantime_serde")]
    pub restart_backoff_step: Duration,

    #[serde(default = "default_restart_backoff_max", with = "humantime_serde")]
    pub restart_backoff_max: Duration,
}

fn default_max_concurrent_agents() -> usize {
    10
}

fn default_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_stop_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_restart_backoff_step() -> Duration {
    Duration::from_secs(2)
}

fn default_restart_backoff_max() -> Duration {
    Duration::from_secs(30)
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            default_timeout: default_timeout(),
            health_check_interval: default_health_check_interval(),
            strategy: SupervisionStrategy::default(),
            enable_auto_recovery: true,
            stop_grace_period: default_stop_grace_period(),
            restart_backoff_step: default_restart_backoff_step(),
            restart_backoff_max: default_restart_backoff_max(),
        }
    }
}

impl OrchestratorConfig {
    /// Delay before restart attempt number `attempt` (1-based).
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        self.restart_backoff_step
            .saturating_mul(attempt)
            .min(self.restart_backoff_max)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent already running: {0}")]
    AlreadyRunning(AgentId),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub total_agents: usize,
    pub by_status: BTreeMap<String, usize>,
    pub active_tasks: usize,
    pub max_concurrent_agents: usize,
    pub available_slots: usize,
    pub strategy: SupervisionStrategy,
}

struct RunControl {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

struct AgentEntry {
    spec: AgentSpec,
    state: AgentRuntimeState,
    /// Registration order, used by `rest_for_one`.
    seq: u64,
    handle: Option<JoinHandle<()>>,
    control: Option<RunControl>,
    generation: u64,
    /// A task (run or restart back-off) is attached and has not settled.
    task_live: bool,
    stop_requested: bool,
}

impl AgentEntry {
    fn new(spec: AgentSpec, seq: u64) -> Self {
        Self {
            state: AgentRuntimeState::new(spec.id.clone()),
            spec,
            seq,
            handle: None,
            control: None,
            generation: 0,
            task_live: false,
            stop_requested: false,
        }
    }

    fn snapshot(&self) -> AgentRuntimeState {
        let mut state = self.state.clone();
        state.has_task = self.task_live;
        state
    }

    fn record(&self) -> AgentRecord {
        AgentRecord::from_parts(&self.spec, &self.snapshot())
    }
}

enum RunOutcome {
    Completed(AgentResult),
    Cancelled,
    Failed(String),
}

type RunSetup = (Arc<dyn AgentFactory>, Option<SessionId>, Duration, u32);

struct RestartPlan {
    failed: AgentId,
    /// The failed agent first, then group peers in registration order.
    targets: Vec<AgentId>,
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    bus: MessageBus,
    repository: Option<Arc<dyn AgentRepository>>,
    agents: Mutex<HashMap<AgentId, AgentEntry>>,
    next_seq: AtomicU64,
    slots: Arc<Semaphore>,
    changed: Notify,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the agent supervisor.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, bus: MessageBus) -> Self {
        Self::build(config, bus, None)
    }

    pub fn with_repository(
        config: OrchestratorConfig,
        bus: MessageBus,
        repository: Arc<dyn AgentRepository>,
    ) -> Self {
        Self::build(config, bus, Some(repository))
    }

    fn build(
        config: OrchestratorConfig,
        bus: MessageBus,
        repository: Option<Arc<dyn AgentRepository>>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_agents.max(1)));
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                bus,
                repository,
                agents: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                slots,
                changed: Notify::new(),
                shutdown: CancellationToken::new(),
                health_task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Register (or re-register) an agent. Re-registering replaces the spec and
    /// resets runtime state; it is rejected while the agent has a live task.
    pub async fn register(&self, spec: AgentSpec) -> Result<AgentId, OrchestratorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let id = spec.id.clone();
        let event = AgentLifecycleEvent::AgentRegistered {
            agent_id: id.clone(),
            agent_type: spec.agent_type.clone(),
            group: spec.group.clone(),
            session_id: spec.session_id.clone(),
            registered_at: Utc::now(),
        };

        {
            let mut agents = self.inner.agents.lock();
            if agents.get(&id).is_some_and(|e| e.task_live) {
                return Err(OrchestratorError::AlreadyRunning(id));
            }
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            info!(
                agent_id = %id,
                agent_type = %spec.agent_type,
                restart_policy = ?spec.restart_policy,
                group = ?spec.group,
                "Agent registered"
            );
            agents.insert(id.clone(), AgentEntry::new(spec, seq));
        }

        self.inner.emit(event);
        self.inner.persist(&id).await;
        Ok(id)
    }

    /// Remove an agent, aborting any task it still has. Returns `false` for unknown ids.
    pub async fn unregister(&self, id: &AgentId) -> bool {
        let Some(entry) = self.inner.agents.lock().remove(id) else {
            return false;
        };

        if let Some(control) = &entry.control {
            control.cancel.cancel();
        }
        if let Some(handle) = entry.handle {
            handle.abort();
        }
        self.inner.changed.notify_waiters();

        info!(agent_id = %id, "Agent unregistered");
        self.inner.emit(AgentLifecycleEvent::AgentUnregistered {
            agent_id: id.clone(),
            unregistered_at: Utc::now(),
        });
        if let Some(repository) = &self.inner.repository {
            if let Err(e) = repository.delete(id).await {
                warn!(agent_id = %id, error = %e, "Failed to delete agent record");
            }
        }
        true
    }

    /// Launch the agent with `goal`. Returns once the run task is spawned; the
    /// task itself waits for a free concurrency slot.
    pub async fn start(
        &self,
        id: &AgentId,
        goal: &str,
        params: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        {
            let mut agents = self.inner.agents.lock();
            let entry = agents
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(id.clone()))?;
            if entry.task_live {
                warn!(agent_id = %id, "Agent is already running");
                return Err(OrchestratorError::AlreadyRunning(id.clone()));
            }
            entry.state.restart_pending = false;
            self.inner.launch(entry, goal.to_string(), params);
        }

        self.inner.changed.notify_waiters();
        self.inner.persist(id).await;
        Ok(())
    }

    /// Stop the agent. A graceful stop signals cancellation and waits up to the
    /// grace period before aborting. Returns `false` if it had no live task.
    pub async fn stop(&self, id: &AgentId, graceful: bool) -> Result<bool, OrchestratorError> {
        self.inner.halt(id, graceful, true).await
    }

    pub async fn pause(&self, id: &AgentId) -> Result<bool, OrchestratorError> {
        self.inner
            .set_paused(id, true)
            .map(|changed| {
                if changed {
                    info!(agent_id = %id, "Agent paused");
                }
                changed
            })
    }

    pub async fn resume(&self, id: &AgentId) -> Result<bool, OrchestratorError> {
        self.inner
            .set_paused(id, false)
            .map(|changed| {
                if changed {
                    info!(agent_id = %id, "Agent resumed");
                }
                changed
            })
    }

    pub fn status(&self, id: &AgentId) -> Option<AgentRuntimeState> {
        self.inner.agents.lock().get(id).map(AgentEntry::snapshot)
    }

    /// Runtime state of every agent, optionally restricted to a group, in registration order.
    pub fn list(&self, group: Option<&str>) -> Vec<AgentRuntimeState> {
        let agents = self.inner.agents.lock();
        let mut entries: Vec<&AgentEntry> = agents
            .values()
            .filter(|e| group.is_none_or(|g| e.spec.group.as_deref() == Some(g)))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(AgentEntry::snapshot).collect()
    }

    pub fn stats(&self) -> OrchestratorStats {
        let agents = self.inner.agents.lock();
        let mut by_status = BTreeMap::new();
        for entry in agents.values() {
            *by_status.entry(entry.state.status.to_string()).or_insert(0) += 1;
        }
        OrchestratorStats {
            total_agents: agents.len(),
            by_status,
            active_tasks: agents.values().filter(|e| e.task_live).count(),
            max_concurrent_agents: self.inner.config.max_concurrent_agents,
            available_slots: self.inner.slots.available_permits(),
            strategy: self.inner.config.strategy,
        }
    }

    /// Resolve once the agent has no live task and no restart pending.
    pub async fn wait(&self, id: &AgentId) -> Result<AgentRuntimeState, OrchestratorError> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let agents = self.inner.agents.lock();
                let entry = agents
                    .get(id)
                    .ok_or_else(|| OrchestratorError::AgentNotFound(id.clone()))?;
                if !entry.task_live && !entry.state.restart_pending {
                    return Ok(entry.snapshot());
                }
            }

            notified.await;
        }
    }

    /// Spawn the periodic sweep that reconciles tasks which ended without
    /// reporting an outcome. Calling it again replaces the running sweep.
    pub fn start_health_monitor(&self) {
        let inner = self.inner.clone();
        let period = inner.config.health_check_interval;
        let handle = tokio::spawn(async move {
            info!(interval = ?period, "Starting agent health monitor");
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let reconciled = inner.reconcile().await;
                        if reconciled > 0 {
                            warn!(reconciled, "Health check reconciled agents with unreported exits");
                        }
                    }
                    _ = inner.shutdown.cancelled() => {
                        info!("Shutdown signal received, stopping agent health monitor");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.inner.health_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Run one health sweep now. Returns how many agents were reconciled.
    pub async fn check_health(&self) -> usize {
        self.inner.reconcile().await
    }

    /// Stop the health monitor and every agent. New registrations and starts are refused.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.health_task.lock().take() {
            handle.abort();
        }

        let live: Vec<AgentId> = self
            .inner
            .agents
            .lock()
            .iter()
            .filter(|(_, e)| e.task_live)
            .map(|(id, _)| id.clone())
            .collect();

        join_all(live.iter().map(|id| self.inner.halt(id, true, true))).await;
        info!(stopped = live.len(), "Orchestrator stopped");
    }
}

impl OrchestratorInner {
    /// Spawn a fresh run for `entry`. Caller holds the agents lock.
    fn launch(self: &Arc<Self>, entry: &mut AgentEntry, goal: String, params: serde_json::Value) {
        entry.generation += 1;
        entry.stop_requested = false;
        entry.task_live = true;
        entry.state.status = AgentStatus::Pending;
        entry.state.result = None;
        entry.state.last_goal = Some(goal.clone());
        entry.state.last_params = params.clone();

        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        entry.control = Some(RunControl {
            cancel: cancel.clone(),
            pause: pause_tx,
        });

        let handle = tokio::spawn(self.clone().run(
            entry.spec.id.clone(),
            entry.generation,
            goal,
            params,
            cancel,
            pause_rx,
        ));
        // Any previous handle belongs to a finished run or to the back-off task calling us.
        entry.handle = Some(handle);
    }

    fn run(
        self: Arc<Self>,
        id: AgentId,
        generation: u64,
        goal: String,
        params: serde_json::Value,
        cancel: CancellationToken,
        pause: watch::Receiver<bool>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = cancel.cancelled() => {
                    let plan = self.finish(&id, generation, RunOutcome::Cancelled);
                    self.persist(&id).await;
                    self.changed.notify_waiters();
                    if let Some(plan) = plan {
                        self.restart(plan, cancel.clone()).await;
                    }
                    return;
                }
            };

            let Some((factory, session_id, timeout, attempt)) = self.mark_initializing(&id, generation)
            else {
                return;
            };

            let mut agent = factory.create();
            let started_at = Utc::now();
            {
                let mut agents = self.agents.lock();
                match agents.get_mut(&id) {
                    Some(entry) if entry.generation == generation => {
                        entry.state.status = AgentStatus::Running;
                        entry.state.started_at = Some(started_at);
                    }
                    _ => return,
                }
            }
            metrics::counter!("convoy_agents_started_total").increment(1);
            metrics::gauge!("convoy_agents_running").increment(1.0);
            info!(agent_id = %id, attempt, "Agent started");
            self.emit(AgentLifecycleEvent::AgentStarted {
                agent_id: id.clone(),
                session_id: session_id.clone(),
                goal: goal.clone(),
                attempt,
                started_at,
            });
            self.persist(&id).await;

            let clock = Instant::now();
            let ctx = AgentContext::new(
                id.clone(),
                session_id,
                goal,
                params,
                attempt,
                cancel.clone(),
                pause,
            );
            let execution = AssertUnwindSafe(agent.run(ctx)).catch_unwind();

            let outcome = match tokio::time::timeout(timeout, execution).await {
                Err(_) => {
                    warn!(agent_id = %id, ?timeout, "Agent execution timed out");
                    let mut result = AgentResult::timeout(timeout);
                    result.duration_ms = elapsed_ms(clock);
                    RunOutcome::Completed(result)
                }
                Ok(Err(panic)) => RunOutcome::Failed(panic_message(panic)),
                Ok(Ok(Ok(mut result))) => {
                    if result.duration_ms == 0 {
                        result.duration_ms = elapsed_ms(clock);
                    }
                    RunOutcome::Completed(result)
                }
                Ok(Ok(Err(AgentError::Cancelled))) => RunOutcome::Cancelled,
                Ok(Ok(Err(e))) => RunOutcome::Failed(e.to_string()),
            };
            drop(agent);
            metrics::gauge!("convoy_agents_running").decrement(1.0);

            let plan = self.finish(&id, generation, outcome);
            drop(permit);
            self.persist(&id).await;
            self.changed.notify_waiters();

            if let Some(plan) = plan {
                self.restart(plan, cancel).await;
            }
        }
        .boxed()
    }

    fn mark_initializing(&self, id: &AgentId, generation: u64) -> Option<RunSetup> {
        let mut agents = self.agents.lock();
        let entry = agents.get_mut(id)?;
        if entry.generation != generation || entry.stop_requested {
            return None;
        }
        entry.state.status = AgentStatus::Initializing;
        Some((
            entry.spec.factory.clone(),
            entry.spec.session_id.clone(),
            entry.spec.timeout.unwrap_or(self.config.default_timeout),
            entry.state.restarts,
        ))
    }

    /// Record the outcome of a run and decide on a restart. Runs before the
    /// concurrency slot is released; the caller wakes waiters once persisted.
    fn finish(&self, id: &AgentId, generation: u64, outcome: RunOutcome) -> Option<RestartPlan> {
        let mut events = Vec::new();
        let plan = {
            let mut agents = self.agents.lock();
            let entry = agents.get_mut(id)?;
            if entry.generation != generation {
                return None;
            }

            let session_id = entry.spec.session_id.clone();
            let now = Utc::now();

            let outcome = match outcome {
                RunOutcome::Completed(result) if entry.stop_requested => {
                    entry.state.result = Some(result);
                    RunOutcome::Cancelled
                }
                RunOutcome::Failed(_) if entry.stop_requested => RunOutcome::Cancelled,
                other => other,
            };

            let (eligible, is_failure) = match outcome {
                RunOutcome::Completed(result) => {
                    info!(
                        agent_id = %id,
                        success = result.success,
                        timed_out = result.timed_out,
                        duration_ms = result.duration_ms,
                        "Agent completed"
                    );
                    entry.state.status = AgentStatus::Completed;
                    entry.state.result = Some(result.clone());
                    events.push(AgentLifecycleEvent::AgentCompleted {
                        agent_id: id.clone(),
                        session_id,
                        result,
                        completed_at: now,
                    });
                    (false, false)
                }
                RunOutcome::Cancelled => {
                    info!(agent_id = %id, requested = entry.stop_requested, "Agent cancelled");
                    entry.state.status = AgentStatus::Cancelled;
                    events.push(AgentLifecycleEvent::AgentCancelled {
                        agent_id: id.clone(),
                        session_id,
                        cancelled_at: now,
                    });
                    (!entry.stop_requested, false)
                }
                RunOutcome::Failed(error) => {
                    error!(agent_id = %id, error = %error, restarts = entry.state.restarts, "Agent failed");
                    metrics::counter!("convoy_agents_failed_total").increment(1);
                    entry.state.status = AgentStatus::Failed;
                    entry.state.last_error = Some(error.clone());
                    events.push(AgentLifecycleEvent::AgentFailed {
                        agent_id: id.clone(),
                        session_id,
                        error,
                        restarts: entry.state.restarts,
                        failed_at: now,
                    });
                    (true, true)
                }
            };

            // A peer's restart plan already covers this agent.
            let already_scheduled = entry.state.restart_pending;
            let plan = if eligible && !already_scheduled {
                self.plan_restart(&mut agents, id, is_failure, &mut events)
            } else {
                None
            };

            if plan.is_none() {
                if let Some(entry) = agents.get_mut(id) {
                    entry.task_live = false;
                }
            }
            plan
        };

        for event in events {
            self.emit(event);
        }
        plan
    }

    fn plan_restart(
        &self,
        agents: &mut HashMap<AgentId, AgentEntry>,
        id: &AgentId,
        is_failure: bool,
        events: &mut Vec<AgentLifecycleEvent>,
    ) -> Option<RestartPlan> {
        if !self.config.enable_auto_recovery {
            return None;
        }

        let entry = agents.get_mut(id)?;
        match entry.spec.restart_policy {
            RestartPolicy::Never => return None,
            RestartPolicy::OnFailure if !is_failure => return None,
            _ => {}
        }

        let now = Utc::now();
        if !has_restart_budget(id, entry, now, events) {
            return None;
        }

        let group = entry.spec.group.clone();
        let seq = entry.seq;
        let strategy = self.config.strategy;

        let mut targets = vec![id.clone()];
        match strategy {
            SupervisionStrategy::Escalate => {
                warn!(agent_id = %id, error = ?entry.state.last_error, "Agent failure escalated");
                events.push(AgentLifecycleEvent::AgentFailureEscalated {
                    agent_id: id.clone(),
                    session_id: entry.spec.session_id.clone(),
                    error: entry.state.last_error.clone(),
                });
                return None;
            }
            SupervisionStrategy::OneForOne => {}
            SupervisionStrategy::OneForAll | SupervisionStrategy::RestForOne => {
                if let Some(group) = group {
                    let mut peers: Vec<(u64, AgentId)> = Vec::new();
                    for (peer_id, peer) in agents.iter_mut() {
                        let in_scope = peer_id != id
                            && peer.spec.group.as_deref() == Some(group.as_str())
                            && !peer.state.restart_pending
                            && peer.state.last_goal.is_some()
                            && (strategy == SupervisionStrategy::OneForAll || peer.seq > seq);
                        // Peers out of restart budget are left as they are.
                        if in_scope && has_restart_budget(peer_id, peer, now, events) {
                            peers.push((peer.seq, peer_id.clone()));
                        }
                    }
                    peers.sort();
                    targets.extend(peers.into_iter().map(|(_, peer_id)| peer_id));
                }
            }
        }

        for target in &targets {
            if let Some(entry) = agents.get_mut(target) {
                entry.state.restart_pending = true;
            }
        }

        Some(RestartPlan {
            failed: id.clone(),
            targets,
        })
    }

    /// Carry out a restart plan from the failed agent's own task.
    async fn restart(self: &Arc<Self>, plan: RestartPlan, cancel: CancellationToken) {
        for peer in plan.targets.iter().skip(1) {
            if let Err(e) = self.halt(peer, true, false).await {
                debug!(agent_id = %peer, error = %e, "Group peer vanished before restart");
            }
        }

        let mut events = Vec::new();
        let delay = {
            let mut agents = self.agents.lock();
            let mut delay = Duration::ZERO;
            for target in &plan.targets {
                let Some(entry) = agents.get_mut(target) else {
                    continue;
                };
                entry.state.restarts += 1;
                entry.state.last_restart = Some(Utc::now());
                let attempt_delay = self.config.restart_delay(entry.state.restarts);
                if *target == plan.failed {
                    delay = attempt_delay;
                }
                metrics::counter!("convoy_agents_restarted_total").increment(1);
                info!(
                    agent_id = %target,
                    attempt = entry.state.restarts,
                    max_restarts = entry.spec.max_restarts,
                    failed_agent = %plan.failed,
                    "Restarting agent"
                );
                events.push(AgentLifecycleEvent::AgentRestarting {
                    agent_id: target.clone(),
                    attempt: entry.state.restarts,
                    max_restarts: entry.spec.max_restarts,
                    delay_ms: u64::try_from(attempt_delay.as_millis()).unwrap_or(u64::MAX),
                });
            }
            delay
        };
        for event in events {
            self.emit(event);
        }

        let aborted = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = cancel.cancelled() => true,
            _ = self.shutdown.cancelled() => true,
        };

        {
            let mut agents = self.agents.lock();
            for target in &plan.targets {
                let Some(entry) = agents.get_mut(target) else {
                    continue;
                };
                if !entry.state.restart_pending {
                    continue;
                }
                entry.state.restart_pending = false;

                let own_backoff = *target == plan.failed;
                if aborted || (!own_backoff && entry.task_live) {
                    if own_backoff {
                        entry.task_live = false;
                    }
                    continue;
                }

                let goal = entry.state.last_goal.clone().unwrap_or_default();
                let params = entry.state.last_params.clone();
                self.launch(entry, goal, params);
            }
        }
        for target in &plan.targets {
            self.persist(target).await;
        }
        self.changed.notify_waiters();
    }

    /// Stop the live task of `id`. `explicit` stops also cancel a pending restart.
    async fn halt(
        self: &Arc<Self>,
        id: &AgentId,
        graceful: bool,
        explicit: bool,
    ) -> Result<bool, OrchestratorError> {
        let (handle, cancel) = {
            let mut agents = self.agents.lock();
            let entry = agents
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(id.clone()))?;
            if !entry.task_live {
                return Ok(false);
            }
            entry.stop_requested = true;
            if explicit {
                entry.state.restart_pending = false;
            }
            let cancel = entry.control.as_ref().map(|control| {
                control.pause.send_replace(false);
                control.cancel.clone()
            });
            (entry.handle.take(), cancel)
        };

        info!(agent_id = %id, graceful, "Stopping agent");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(mut handle) = handle {
            if graceful {
                let grace = self.config.stop_grace_period;
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    warn!(agent_id = %id, ?grace, "Agent ignored cancellation, aborting task");
                    handle.abort();
                    let _ = handle.await;
                }
            } else {
                handle.abort();
                let _ = handle.await;
            }
        }

        let event = {
            let mut agents = self.agents.lock();
            let Some(entry) = agents.get_mut(id) else {
                return Ok(true);
            };
            entry.task_live = false;
            if entry.state.status == AgentStatus::Cancelled {
                None
            } else {
                entry.state.status = AgentStatus::Cancelled;
                Some(AgentLifecycleEvent::AgentCancelled {
                    agent_id: id.clone(),
                    session_id: entry.spec.session_id.clone(),
                    cancelled_at: Utc::now(),
                })
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
        self.persist(id).await;
        self.changed.notify_waiters();
        Ok(true)
    }

    fn set_paused(&self, id: &AgentId, paused: bool) -> Result<bool, OrchestratorError> {
        let event = {
            let mut agents = self.agents.lock();
            let entry = agents
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(id.clone()))?;

            let (from, to) = if paused {
                (AgentStatus::Running, AgentStatus::Paused)
            } else {
                (AgentStatus::Paused, AgentStatus::Running)
            };
            if entry.state.status != from {
                return Ok(false);
            }
            let Some(control) = &entry.control else {
                return Ok(false);
            };
            control.pause.send_replace(paused);
            entry.state.status = to;

            let session_id = entry.spec.session_id.clone();
            if paused {
                AgentLifecycleEvent::AgentPaused {
                    agent_id: id.clone(),
                    session_id,
                }
            } else {
                AgentLifecycleEvent::AgentResumed {
                    agent_id: id.clone(),
                    session_id,
                }
            }
        };
        self.emit(event);
        Ok(true)
    }

    /// Mark agents whose task ended without reporting as failed.
    async fn reconcile(&self) -> usize {
        let mut events = Vec::new();
        let mut reconciled = Vec::new();
        {
            let mut agents = self.agents.lock();
            for (id, entry) in agents.iter_mut() {
                let exited = entry.handle.as_ref().is_some_and(JoinHandle::is_finished);
                if !(entry.task_live && exited) {
                    continue;
                }
                let error = "agent task exited without reporting an outcome".to_string();
                warn!(agent_id = %id, status = %entry.state.status, "{}", error);
                entry.task_live = false;
                entry.state.restart_pending = false;
                entry.state.status = AgentStatus::Failed;
                entry.state.last_error = Some(error.clone());
                events.push(AgentLifecycleEvent::AgentFailed {
                    agent_id: id.clone(),
                    session_id: entry.spec.session_id.clone(),
                    error,
                    restarts: entry.state.restarts,
                    failed_at: Utc::now(),
                });
                reconciled.push(id.clone());
            }
        }

        for event in events {
            self.emit(event);
        }
        for id in &reconciled {
            self.persist(id).await;
        }
        if !reconciled.is_empty() {
            self.changed.notify_waiters();
        }
        reconciled.len()
    }

    fn emit(&self, event: AgentLifecycleEvent) {
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        self.bus.publish(&event.topic(), payload, Some(ORCHESTRATOR_SOURCE));
    }

    async fn persist(&self, id: &AgentId) {
        let Some(repository) = &self.repository else {
            return;
        };
        let Some(record) = self.agents.lock().get(id).map(AgentEntry::record) else {
            return;
        };
        if let Err(e) = repository.save(&record).await {
            warn!(agent_id = %id, error = %e, "Failed to persist agent record");
        }
    }
}

/// Reset the restart count once the window has elapsed, then check it against
/// `max_restarts`. Emits `agent_max_restarts` when the budget is spent.
fn has_restart_budget(
    id: &AgentId,
    entry: &mut AgentEntry,
    now: chrono::DateTime<Utc>,
    events: &mut Vec<AgentLifecycleEvent>,
) -> bool {
    if let Some(last) = entry.state.last_restart {
        let window =
            chrono::Duration::from_std(entry.spec.restart_window).unwrap_or(chrono::Duration::MAX);
        if now - last > window {
            debug!(agent_id = %id, "Restart window elapsed, resetting restart count");
            entry.state.restarts = 0;
        }
    }

    if entry.state.restarts < entry.spec.max_restarts {
        return true;
    }
    warn!(
        agent_id = %id,
        restarts = entry.state.restarts,
        max_restarts = entry.spec.max_restarts,
        "Agent exceeded max restarts"
    );
    events.push(AgentLifecycleEvent::AgentMaxRestarts {
        agent_id: id.clone(),
        session_id: entry.spec.session_id.clone(),
        restarts: entry.state.restarts,
        max_restarts: entry.spec.max_restarts,
    });
    false
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("agent panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("agent panicked: {msg}")
    } else {
        "agent panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::agent_fn;
    use crate::infrastructure::repositories::InMemoryAgentRepository;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            stop_grace_period: Duration::from_millis(200),
            restart_backoff_step: Duration::from_millis(10),
            restart_backoff_max: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn orchestrator(config: OrchestratorConfig) -> (Orchestrator, MessageBus) {
        let bus = MessageBus::default();
        (Orchestrator::new(config, bus.clone()), bus)
    }

    fn echo() -> Arc<dyn AgentFactory> {
        agent_fn(|ctx: AgentContext| async move {
            Ok(AgentResult::success(json!({ "goal": ctx.goal })))
        })
    }

    fn failing(runs: Arc<AtomicU32>) -> Arc<dyn AgentFactory> {
        agent_fn(move |_ctx: AgentContext| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::Failed("boom".to_string()))
            }
        })
    }

    /// Blocks until cancelled; counts how many times it was started.
    fn blocking(starts: Arc<AtomicU32>) -> Arc<dyn AgentFactory> {
        agent_fn(move |ctx: AgentContext| {
            let starts = starts.clone();
            async move {
                starts.fetch_add(1, Ordering::SeqCst);
                ctx.cancelled().await;
                Err(AgentError::Cancelled)
            }
        })
    }

    async fn wait_for_status(orch: &Orchestrator, id: &AgentId, status: AgentStatus) {
        for _ in 0..200 {
            if orch.status(id).map(|s| s.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("agent {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let (orch, bus) = orchestrator(fast_config());
        let id = orch.register(AgentSpec::new("echo", echo())).await.unwrap();

        orch.start(&id, "summarize", json!({})).await.unwrap();
        let state = orch.wait(&id).await.unwrap();

        assert_eq!(state.status, AgentStatus::Completed);
        assert!(!state.has_task);
        let result = state.result.unwrap();
        assert!(result.success);
        assert_eq!(result.output["goal"], "summarize");

        let topics: Vec<String> = bus
            .history(Some("orchestrator.*"), None, 10)
            .into_iter()
            .map(|m| m.topic)
            .collect();
        assert_eq!(
            topics,
            vec![
                "orchestrator.agent_registered",
                "orchestrator.agent_started",
                "orchestrator.agent_completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_restarts_stop_at_max_restarts() {
        let (orch, bus) = orchestrator(fast_config());
        let runs = Arc::new(AtomicU32::new(0));
        let spec = AgentSpec::new("flaky", failing(runs.clone()))
            .with_restart_policy(RestartPolicy::Always)
            .with_max_restarts(2)
            .with_restart_window(Duration::from_secs(60));
        let id = orch.register(spec).await.unwrap();

        orch.start(&id, "try", json!({})).await.unwrap();
        let state = orch.wait(&id).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(state.status, AgentStatus::Failed);
        assert_eq!(state.restarts, 2);
        assert_eq!(state.last_error.as_deref(), Some("Agent failed: boom"));
        assert_eq!(
            bus.history(Some("orchestrator.agent_restarting"), None, 10).len(),
            2
        );
        assert_eq!(
            bus.history(Some("orchestrator.agent_max_restarts"), None, 10).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_restart_count_resets_outside_window() {
        let (orch, _bus) = orchestrator(fast_config());
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let factory = agent_fn(move |_ctx: AgentContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(AgentError::Failed("transient".to_string()))
                } else {
                    Ok(AgentResult::success(json!("done")))
                }
            }
        });
        let spec = AgentSpec::new("flaky", factory)
            .with_max_restarts(1)
            .with_restart_window(Duration::from_millis(1));
        let id = orch.register(spec).await.unwrap();

        orch.start(&id, "try", json!({})).await.unwrap();
        let state = orch.wait(&id).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(state.status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn test_never_policy_does_not_restart() {
        let (orch, _bus) = orchestrator(fast_config());
        let runs = Arc::new(AtomicU32::new(0));
        let spec = AgentSpec::new("once", failing(runs.clone()))
            .with_restart_policy(RestartPolicy::Never);
        let id = orch.register(spec).await.unwrap();

        orch.start(&id, "try", json!({})).await.unwrap();
        let state = orch.wait(&id).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(state.status, AgentStatus::Failed);
        assert_eq!(state.restarts, 0);
    }

    #[tokio::test]
    async fn test_on_failure_policy_ignores_success() {
        let (orch, _bus) = orchestrator(fast_config());
        let spec = AgentSpec::new("echo", echo()).with_restart_policy(RestartPolicy::OnFailure);
        let id = orch.register(spec).await.unwrap();

        orch.start(&id, "hello", json!({})).await.unwrap();
        let state = orch.wait(&id).await.unwrap();

        assert_eq!(state.status, AgentStatus::Completed);
        assert_eq!(state.restarts, 0);
    }

    #[tokio::test]
    async fn test_timeout_completes_with_failure_result() {
        let (orch, _bus) = orchestrator(fast_config());
        let factory = agent_fn(|_ctx: AgentContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(AgentResult::success(json!(null)))
        });
        let spec = AgentSpec::new("slow", factory).with_timeout(Duration::from_millis(50));
        let id = orch.register(spec).await.unwrap();

        orch.start(&id, "wait", json!({})).await.unwrap();
        let state = orch.wait(&id).await.unwrap();

        assert_eq!(state.status, AgentStatus::Completed);
        assert_eq!(state.restarts, 0);
        let result = state.result.unwrap();
        assert!(!result.success);
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn test_panicking_agent_is_reported_as_failure() {
        let (orch, _bus) = orchestrator(fast_config());
        let factory = agent_fn(|ctx: AgentContext| async move {
            if ctx.goal == "explode" {
                panic!("kaboom");
            }
            Ok(AgentResult::success(json!(null)))
        });
        let spec = AgentSpec::new("unstable", factory).with_restart_policy(RestartPolicy::Never);
        let id = orch.register(spec).await.unwrap();

        orch.start(&id, "explode", json!({})).await.unwrap();
        let state = orch.wait(&id).await.unwrap();

        assert_eq!(state.status, AgentStatus::Failed);
        assert!(state.last_error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_stop_cancels_without_restart() {
        let (orch, bus) = orchestrator(fast_config());
        let starts = Arc::new(AtomicU32::new(0));
        let id = orch
            .register(AgentSpec::new("loop", blocking(starts.clone())))
            .await
            .unwrap();

        orch.start(&id, "forever", json!({})).await.unwrap();
        wait_for_status(&orch, &id, AgentStatus::Running).await;

        assert!(orch.stop(&id, true).await.unwrap());
        let state = orch.wait(&id).await.unwrap();
        assert_eq!(state.status, AgentStatus::Cancelled);
        assert_eq!(state.restarts, 0);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            bus.history(Some("orchestrator.agent_cancelled"), None, 10).len(),
            1
        );

        // Nothing left to stop.
        assert!(!orch.stop(&id, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_aborts_agent_ignoring_cancellation() {
        let (orch, _bus) = orchestrator(fast_config());
        let factory = agent_fn(|_ctx: AgentContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(AgentResult::success(json!(null)))
        });
        let id = orch.register(AgentSpec::new("stubborn", factory)).await.unwrap();

        orch.start(&id, "ignore", json!({})).await.unwrap();
        wait_for_status(&orch, &id, AgentStatus::Running).await;

        assert!(orch.stop(&id, true).await.unwrap());
        assert_eq!(orch.status(&id).unwrap().status, AgentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let config = OrchestratorConfig {
            max_concurrent_agents: 2,
            ..fast_config()
        };
        let (orch, _bus) = orchestrator(config);

        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (c, p) = (current.clone(), peak.clone());
        let factory = agent_fn(move |_ctx: AgentContext| {
            let (current, peak) = (c.clone(), p.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(AgentResult::success(json!(null)))
            }
        });

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = orch
                .register(AgentSpec::new("worker", factory.clone()))
                .await
                .unwrap();
            orch.start(&id, "work", json!({})).await.unwrap();
            ids.push(id);
        }

        for id in &ids {
            assert_eq!(orch.wait(id).await.unwrap().status, AgentStatus::Completed);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(orch.stats().available_slots, 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (orch, bus) = orchestrator(fast_config());
        let starts = Arc::new(AtomicU32::new(0));
        let id = orch
            .register(AgentSpec::new("loop", blocking(starts)))
            .await
            .unwrap();

        // Not running yet.
        assert!(!orch.pause(&id).await.unwrap());

        orch.start(&id, "forever", json!({})).await.unwrap();
        wait_for_status(&orch, &id, AgentStatus::Running).await;

        assert!(orch.pause(&id).await.unwrap());
        assert_eq!(orch.status(&id).unwrap().status, AgentStatus::Paused);
        assert!(!orch.pause(&id).await.unwrap());

        assert!(orch.resume(&id).await.unwrap());
        assert_eq!(orch.status(&id).unwrap().status, AgentStatus::Running);
        assert!(!orch.resume(&id).await.unwrap());

        assert_eq!(bus.history(Some("orchestrator.agent_paused"), None, 10).len(), 1);
        assert_eq!(bus.history(Some("orchestrator.agent_resumed"), None, 10).len(), 1);
        orch.stop(&id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_one_for_all_restarts_group_peers() {
        let config = OrchestratorConfig {
            strategy: SupervisionStrategy::OneForAll,
            ..fast_config()
        };
        let (orch, _bus) = orchestrator(config);

        let peer_starts = Arc::new(AtomicU32::new(0));
        let peer = orch
            .register(AgentSpec::new("peer", blocking(peer_starts.clone())).in_group("crew"))
            .await
            .unwrap();

        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let flaky = agent_fn(move |_ctx: AgentContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AgentError::Failed("first run fails".to_string()))
                } else {
                    Ok(AgentResult::success(json!("ok")))
                }
            }
        });
        let lead = orch
            .register(AgentSpec::new("lead", flaky).in_group("crew"))
            .await
            .unwrap();

        orch.start(&peer, "assist", json!({})).await.unwrap();
        wait_for_status(&orch, &peer, AgentStatus::Running).await;
        orch.start(&lead, "lead", json!({})).await.unwrap();

        assert_eq!(orch.wait(&lead).await.unwrap().status, AgentStatus::Completed);
        for _ in 0..200 {
            if peer_starts.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(peer_starts.load(Ordering::SeqCst), 2);
        assert_eq!(orch.status(&peer).unwrap().last_goal.as_deref(), Some("assist"));

        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_group_restart_skips_peer_without_budget() {
        let config = OrchestratorConfig {
            strategy: SupervisionStrategy::OneForAll,
            ..fast_config()
        };
        let (orch, bus) = orchestrator(config);

        let peer_starts = Arc::new(AtomicU32::new(0));
        let peer = orch
            .register(
                AgentSpec::new("peer", blocking(peer_starts.clone()))
                    .in_group("crew")
                    .with_max_restarts(0),
            )
            .await
            .unwrap();

        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let flaky = agent_fn(move |_ctx: AgentContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AgentError::Failed("first run fails".to_string()))
                } else {
                    Ok(AgentResult::success(json!("ok")))
                }
            }
        });
        let lead = orch
            .register(AgentSpec::new("lead", flaky).in_group("crew"))
            .await
            .unwrap();

        orch.start(&peer, "assist", json!({})).await.unwrap();
        wait_for_status(&orch, &peer, AgentStatus::Running).await;
        orch.start(&lead, "lead", json!({})).await.unwrap();

        let lead_state = orch.wait(&lead).await.unwrap();
        assert_eq!(lead_state.status, AgentStatus::Completed);
        assert_eq!(lead_state.restarts, 1);

        let peer_state = orch.status(&peer).unwrap();
        assert_eq!(peer_state.status, AgentStatus::Running);
        assert_eq!(peer_state.restarts, 0);
        assert_eq!(peer_starts.load(Ordering::SeqCst), 1);

        let exhausted = bus.history(Some("orchestrator.agent_max_restarts"), None, 10);
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].payload["agent_id"], peer.as_str());

        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_escalate_strategy_does_not_restart() {
        let config = OrchestratorConfig {
            strategy: SupervisionStrategy::Escalate,
            ..fast_config()
        };
        let (orch, bus) = orchestrator(config);
        let runs = Arc::new(AtomicU32::new(0));
        let id = orch
            .register(AgentSpec::new("flaky", failing(runs.clone())))
            .await
            .unwrap();

        orch.start(&id, "try", json!({})).await.unwrap();
        let state = orch.wait(&id).await.unwrap();

        assert_eq!(state.status, AgentStatus::Failed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            bus.history(Some("orchestrator.agent_failure_escalated"), None, 10)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_start_errors() {
        let (orch, _bus) = orchestrator(fast_config());
        let missing = AgentId::from("agent-missing");
        assert!(matches!(
            orch.start(&missing, "x", json!({})).await,
            Err(OrchestratorError::AgentNotFound(_))
        ));

        let starts = Arc::new(AtomicU32::new(0));
        let id = orch
            .register(AgentSpec::new("loop", blocking(starts)))
            .await
            .unwrap();
        orch.start(&id, "first", json!({})).await.unwrap();
        assert!(matches!(
            orch.start(&id, "second", json!({})).await,
            Err(OrchestratorError::AlreadyRunning(_))
        ));

        orch.shutdown().await;
        assert!(matches!(
            orch.register(AgentSpec::new("late", echo())).await,
            Err(OrchestratorError::ShuttingDown)
        ));
        assert_eq!(orch.status(&id).unwrap().status, AgentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unregister_removes_agent() {
        let (orch, _bus) = orchestrator(fast_config());
        let id = orch.register(AgentSpec::new("echo", echo())).await.unwrap();

        assert!(orch.unregister(&id).await);
        assert!(orch.status(&id).is_none());
        assert!(!orch.unregister(&id).await);
    }

    #[tokio::test]
    async fn test_list_filters_by_group() {
        let (orch, _bus) = orchestrator(fast_config());
        let a = orch
            .register(AgentSpec::new("echo", echo()).in_group("alpha"))
            .await
            .unwrap();
        orch.register(AgentSpec::new("echo", echo()).in_group("beta"))
            .await
            .unwrap();
        orch.register(AgentSpec::new("echo", echo())).await.unwrap();

        assert_eq!(orch.list(None).len(), 3);
        let alpha = orch.list(Some("alpha"));
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].agent_id, a);
        assert_eq!(orch.stats().by_status.get("pending"), Some(&3));
    }

    struct ExplodingFactory;

    impl AgentFactory for ExplodingFactory {
        fn create(&self) -> Box<dyn crate::domain::agent::Agent> {
            panic!("factory cannot build agent");
        }
    }

    #[tokio::test]
    async fn test_health_check_reconciles_unreported_exit() {
        let (orch, bus) = orchestrator(fast_config());
        let id = orch
            .register(AgentSpec::new("broken", Arc::new(ExplodingFactory)))
            .await
            .unwrap();

        orch.start(&id, "go", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(orch.check_health().await, 1);
        let state = orch.status(&id).unwrap();
        assert_eq!(state.status, AgentStatus::Failed);
        assert!(!state.has_task);
        assert_eq!(bus.history(Some("orchestrator.agent_failed"), None, 10).len(), 1);
        assert_eq!(orch.check_health().await, 0);
    }

    #[tokio::test]
    async fn test_records_are_persisted() {
        let repo = Arc::new(InMemoryAgentRepository::new());
        let orch = Orchestrator::with_repository(fast_config(), MessageBus::default(), repo.clone());
        let id = orch.register(AgentSpec::new("echo", echo())).await.unwrap();

        orch.start(&id, "persist me", json!({})).await.unwrap();
        orch.wait(&id).await.unwrap();

        let record = repo.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(record.agent_type, "echo");
        assert_eq!(record.state.status, AgentStatus::Completed);

        orch.unregister(&id).await;
        assert!(repo.find_by_id(&id).await.unwrap().is_none());
    }

    #[test]
    fn test_restart_delay_is_capped() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.restart_delay(1), Duration::from_secs(2));
        assert_eq!(config.restart_delay(3), Duration::from_secs(6));
        assert_eq!(config.restart_delay(40), Duration::from_secs(30));
    }
}
