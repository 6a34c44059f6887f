// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Distributed Coordinator
//!
//! Spreads submitted tasks over registered worker nodes and keeps them moving
//! when nodes fail.
//!
//! ## Assignment
//!
//! A task is offered to nodes that are available (online, spare capacity,
//! fresh heartbeat) and carry the task's required capability, if any. The
//! active [`LoadBalanceStrategy`] picks one; the node's load goes up and the
//! task is dispatched through the [`TaskDispatcher`]. If nobody qualifies the
//! task waits in the queue, which is swept every `queue_interval`.
//!
//! ## Failure
//!
//! | Cause | Effect |
//! |-------|--------|
//! | dispatch error or non-2xx answer | retry counted; re-queued while `retries < max_retries`, else `failed` |
//! | `complete_task(success = false)` | same as above |
//! | failure reported for an attempt that is no longer current | ignored |
//! | node heartbeat older than `liveness_threshold` | node `offline`; its in-flight tasks re-queued without counting a retry |
//! | node deregistered | its in-flight tasks re-queued without counting a retry |
//!
//! The local node is never marked offline by the health checker. Delivery is
//! at-least-once: a task re-queued away from a slow node may still be
//! completed by it, and the first completion wins.

use chrono::{DateTime, Utc};
use convoy_core::application::message_bus::HandlerResult;
use convoy_core::application::{MessageBus, SubscribeOptions};
use convoy_core::domain::message::{Message, SubscriptionId};
use convoy_core::domain::repository::RepositoryError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{
    Capability, DispatchError, DistributedEvent, DistributedTask, FailureOutcome,
    LoadBalanceStrategy, NodeId, NodeRepository, NodeStatus, TaskDispatcher, TaskId,
    TaskRepository, TaskStatus, WorkerNode, DEFAULT_MAX_CAPACITY, DEFAULT_MAX_RETRIES,
    HEARTBEAT_TOPIC,
};

const COORDINATOR_SOURCE: &str = "coordinator";
const HEARTBEAT_SUBSCRIBER: &str = "distributed_coordinator";

/// Default page size for [`DistributedCoordinator::tasks`].
pub const DEFAULT_TASK_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    /// Falls back to the machine hostname.
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default = "default_local_address")]
    pub address: String,

    #[serde(default = "default_local_port")]
    pub port: u16,

    #[serde(default = "Capability::defaults")]
    pub capabilities: BTreeSet<Capability>,

    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,
}

impl Default for LocalNodeConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            address: default_local_address(),
            port: default_local_port(),
            capabilities: Capability::defaults(),
            max_capacity: default_max_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_queue_interval", with = "humantime_serde")]
    pub queue_interval: Duration,

    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Heartbeat age after which a node counts as dead.
    #[serde(default = "default_liveness_threshold", with = "humantime_serde")]
    pub liveness_threshold: Duration,

    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_dispatch_timeout", with = "humantime_serde")]
    pub dispatch_timeout: Duration,

    #[serde(default)]
    pub strategy: LoadBalanceStrategy,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub local_node: LocalNodeConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_interval: default_queue_interval(),
            health_check_interval: default_health_check_interval(),
            liveness_threshold: default_liveness_threshold(),
            heartbeat_interval: default_heartbeat_interval(),
            dispatch_timeout: default_dispatch_timeout(),
            strategy: LoadBalanceStrategy::default(),
            max_retries: default_max_retries(),
            local_node: LocalNodeConfig::default(),
        }
    }
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    8765
}

fn default_max_capacity() -> u32 {
    DEFAULT_MAX_CAPACITY
}

fn default_queue_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_liveness_threshold() -> Duration {
    Duration::from_secs(60)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_dispatch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
}

/// Registration request for a remote worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// Id the node already goes by, e.g. its own local node id, so that the
    /// heartbeats it publishes on a bridged bus are matched. Generated when
    /// absent.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStats {
    pub total: usize,
    pub online: usize,
    pub total_capacity: u32,
    pub used_capacity: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub nodes: NodeStats,
    pub tasks: TaskStats,
    pub strategy: LoadBalanceStrategy,
    pub local_node_id: NodeId,
}

struct CoordinatorState {
    nodes: HashMap<NodeId, WorkerNode>,
    tasks: HashMap<TaskId, DistributedTask>,
    queue: VecDeque<TaskId>,
    strategy: LoadBalanceStrategy,
}

impl CoordinatorState {
    fn enqueue(&mut self, id: &TaskId) {
        if !self.queue.contains(id) {
            self.queue.push_back(id.clone());
        }
    }

    fn dequeue(&mut self, id: &TaskId) {
        self.queue.retain(|queued| queued != id);
    }

    fn release(&mut self, node_id: &NodeId) -> Option<WorkerNode> {
        self.nodes.get_mut(node_id).map(|node| {
            node.release_slot();
            node.clone()
        })
    }

    /// Count a failed attempt on `task_id`, free its node slot and re-queue
    /// it while retries remain.
    fn fail_task(
        &mut self,
        task_id: &TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Option<(DistributedTask, Option<WorkerNode>, FailureOutcome)> {
        let task = self.tasks.get_mut(task_id)?;
        let in_flight = task.status.is_in_flight();
        let outcome = task.record_failure(error, now);
        let holder = match outcome {
            FailureOutcome::Requeued => task.reset(),
            FailureOutcome::Exhausted => task.assigned_node.clone(),
        };
        let snapshot = task.clone();

        let node = match holder {
            Some(node_id) if in_flight => self.release(&node_id),
            _ => None,
        };
        match outcome {
            FailureOutcome::Requeued => self.enqueue(task_id),
            FailureOutcome::Exhausted => self.dequeue(task_id),
        }
        Some((snapshot, node, outcome))
    }

    /// Detach every in-flight task from `node_id` and put it back in the queue.
    fn requeue_from_node(&mut self, node_id: &NodeId) -> Vec<DistributedTask> {
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight() && t.assigned_node.as_ref() == Some(node_id))
            .map(|t| t.id.clone())
            .collect();

        let mut requeued = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.reset();
                requeued.push(task.clone());
            }
            self.release(node_id);
            self.enqueue(&id);
        }
        requeued
    }

    fn sorted_nodes(&self) -> Vec<WorkerNode> {
        let mut nodes: Vec<WorkerNode> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        nodes
    }
}

enum Completion {
    Unchanged(DistributedTask),
    Stale(DistributedTask),
    Completed(DistributedTask, Option<WorkerNode>),
    Failed(DistributedTask, Option<WorkerNode>, FailureOutcome),
}

struct RunningLoops {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    subscription: SubscriptionId,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    bus: MessageBus,
    dispatcher: Arc<dyn TaskDispatcher>,
    node_repository: Option<Arc<dyn NodeRepository>>,
    task_repository: Option<Arc<dyn TaskRepository>>,
    local_node_id: NodeId,
    state: Mutex<CoordinatorState>,
    running: AtomicBool,
    loops: Mutex<Option<RunningLoops>>,
}

/// Assigns distributed tasks to worker nodes. Cheap to clone.
#[derive(Clone)]
pub struct DistributedCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DistributedCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        bus: MessageBus,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self::build(config, bus, dispatcher, None, None)
    }

    pub fn with_repositories(
        config: CoordinatorConfig,
        bus: MessageBus,
        dispatcher: Arc<dyn TaskDispatcher>,
        nodes: Arc<dyn NodeRepository>,
        tasks: Arc<dyn TaskRepository>,
    ) -> Self {
        Self::build(config, bus, dispatcher, Some(nodes), Some(tasks))
    }

    fn build(
        config: CoordinatorConfig,
        bus: MessageBus,
        dispatcher: Arc<dyn TaskDispatcher>,
        node_repository: Option<Arc<dyn NodeRepository>>,
        task_repository: Option<Arc<dyn TaskRepository>>,
    ) -> Self {
        let state = CoordinatorState {
            nodes: HashMap::new(),
            tasks: HashMap::new(),
            queue: VecDeque::new(),
            strategy: config.strategy,
        };
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                bus,
                dispatcher,
                node_repository,
                task_repository,
                local_node_id: NodeId::new(),
                state: Mutex::new(state),
                running: AtomicBool::new(false),
                loops: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.inner.local_node_id
    }

    /// Reload nodes and tasks from the repositories. Unfinished tasks go back
    /// to the queue; tasks that were in flight are detached from their node.
    pub async fn load_all(&self) -> Result<(usize, usize), RepositoryError> {
        let nodes = match &self.inner.node_repository {
            Some(repository) => repository.list_all().await?,
            None => Vec::new(),
        };
        let tasks = match &self.inner.task_repository {
            Some(repository) => repository.list_all().await?,
            None => Vec::new(),
        };

        let (node_count, task_count, detached) = {
            let mut state = self.inner.state.lock();
            let node_count = nodes.len();
            for mut node in nodes {
                node.current_load = 0;
                node.refresh_status();
                state.nodes.entry(node.id.clone()).or_insert(node);
            }

            let task_count = tasks.len();
            let mut detached = Vec::new();
            let mut pending: Vec<DistributedTask> = Vec::new();
            for mut task in tasks {
                if task.status.is_in_flight() {
                    task.reset();
                    detached.push(task.clone());
                }
                if task.status == TaskStatus::Pending {
                    pending.push(task.clone());
                }
                state.tasks.entry(task.id.clone()).or_insert(task);
            }
            pending.sort_by_key(|t| t.created_at);
            for task in &pending {
                state.enqueue(&task.id);
            }
            (node_count, task_count, detached)
        };

        for task in &detached {
            self.inner.persist_task(task).await;
        }
        info!(
            nodes = node_count,
            tasks = task_count,
            requeued = detached.len(),
            "Rehydrated coordinator state from storage"
        );
        Ok((node_count, task_count))
    }

    pub async fn register_node(&self, registration: NodeRegistration) -> WorkerNode {
        let node = WorkerNode::new(
            registration.node_id.unwrap_or_else(NodeId::new),
            registration.hostname,
            registration.address,
            registration.port,
            registration.capabilities,
            registration.max_capacity,
        );
        self.inner.insert_node(node).await
    }

    /// Register this process as a worker node under [`Self::local_node_id`].
    pub async fn register_local_node(&self) -> WorkerNode {
        let local = &self.inner.config.local_node;
        let hostname = local.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string())
        });
        let node = WorkerNode::new(
            self.inner.local_node_id.clone(),
            hostname,
            local.address.clone(),
            local.port,
            local.capabilities.clone(),
            local.max_capacity,
        );
        self.inner.insert_node(node).await
    }

    /// Remove a node. Its in-flight tasks are re-queued.
    pub async fn deregister_node(&self, node_id: &NodeId) -> bool {
        let requeued = {
            let mut state = self.inner.state.lock();
            let Some(node) = state.nodes.get_mut(node_id) else {
                return false;
            };
            node.status = NodeStatus::Draining;
            let requeued = state.requeue_from_node(node_id);
            state.nodes.remove(node_id);
            requeued
        };

        metrics::gauge!("convoy_nodes_registered").decrement(1.0);
        if let Some(repository) = &self.inner.node_repository {
            if let Err(e) = repository.delete(node_id).await {
                warn!(node_id = %node_id, error = %e, "Failed to delete node record");
            }
        }
        self.inner
            .requeued(&requeued, &format!("node {node_id} deregistered"))
            .await;
        self.inner.emit(DistributedEvent::NodeDeregistered {
            node_id: node_id.clone(),
            requeued: requeued.len(),
        });
        info!(node_id = %node_id, requeued = requeued.len(), "Node deregistered");
        true
    }

    /// Stop offering new work to a node while its current tasks finish.
    pub async fn drain_node(&self, node_id: &NodeId) -> Result<WorkerNode, CoordinatorError> {
        let node = {
            let mut state = self.inner.state.lock();
            let node = state
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| CoordinatorError::NodeNotFound(node_id.clone()))?;
            node.status = NodeStatus::Draining;
            node.clone()
        };
        self.inner.persist_node(&node).await;
        info!(node_id = %node_id, load = node.current_load, "Node draining");
        Ok(node)
    }

    /// Record a heartbeat from `node_id`, optionally with its current load.
    pub async fn heartbeat(&self, node_id: &NodeId, load: Option<u32>) -> bool {
        self.inner.heartbeat(node_id, load).await
    }

    pub fn set_strategy(&self, strategy: LoadBalanceStrategy) {
        self.inner.state.lock().strategy = strategy;
        info!(strategy = %strategy, "Load balance strategy changed");
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.inner.state.lock().strategy
    }

    /// Create a task and try to place it right away. Unplaced tasks wait in
    /// the queue. Returns the task as it stands after the first attempt.
    pub async fn submit_task(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        required_capability: Option<Capability>,
    ) -> DistributedTask {
        let task = DistributedTask::new(task_type, payload, required_capability)
            .with_max_retries(self.inner.config.max_retries);
        let id = task.id.clone();
        self.inner.state.lock().tasks.insert(id.clone(), task.clone());

        metrics::counter!("convoy_tasks_submitted_total").increment(1);
        self.inner.persist_task(&task).await;
        self.inner.emit(DistributedEvent::TaskSubmitted {
            task_id: id.clone(),
            task_type: task.task_type.clone(),
            required_capability: task.required_capability.clone(),
        });
        info!(task_id = %id, task_type, "Task submitted");

        self.inner.try_assign(&id).await;
        self.task(&id).unwrap_or(task)
    }

    /// Record the outcome of `task_id`. A task that is already terminal is
    /// returned untouched; an unsuccessful outcome goes through the retry
    /// path.
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        result: serde_json::Value,
        success: bool,
    ) -> Result<DistributedTask, CoordinatorError> {
        self.complete_task_from(task_id, None, result, success).await
    }

    /// Like [`Self::complete_task`], for an outcome reported by `reporter`.
    ///
    /// A failure only counts against the attempt it belongs to: it is dropped
    /// when the task is not in flight, or when `reporter` is not the node the
    /// task is assigned to. A success is accepted from any node.
    pub async fn complete_task_from(
        &self,
        task_id: &TaskId,
        reporter: Option<&NodeId>,
        result: serde_json::Value,
        success: bool,
    ) -> Result<DistributedTask, CoordinatorError> {
        let now = Utc::now();
        let completion = {
            let mut state = self.inner.state.lock();
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| CoordinatorError::TaskNotFound(task_id.clone()))?;
            let stale = !task.status.is_in_flight()
                || reporter.is_some_and(|node_id| task.assigned_node.as_ref() != Some(node_id));

            if task.status.is_terminal() {
                Completion::Unchanged(task.clone())
            } else if !success && stale {
                Completion::Stale(task.clone())
            } else if success {
                let holder = task
                    .status
                    .is_in_flight()
                    .then(|| task.assigned_node.clone())
                    .flatten();
                task.complete(result, now);
                let snapshot = task.clone();
                let node = holder.and_then(|node_id| state.release(&node_id));
                state.dequeue(task_id);
                Completion::Completed(snapshot, node)
            } else {
                let error = result
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("task reported failure")
                    .to_string();
                match state.fail_task(task_id, &error, now) {
                    Some((mut snapshot, node, outcome)) => {
                        if outcome == FailureOutcome::Exhausted {
                            snapshot.result = Some(result);
                            if let Some(task) = state.tasks.get_mut(task_id) {
                                task.result = snapshot.result.clone();
                            }
                        }
                        Completion::Failed(snapshot, node, outcome)
                    }
                    None => return Err(CoordinatorError::TaskNotFound(task_id.clone())),
                }
            }
        };

        match completion {
            Completion::Unchanged(task) => {
                debug!(task_id = %task_id, status = %task.status, "Ignoring completion of finished task");
                Ok(task)
            }
            Completion::Stale(task) => {
                warn!(
                    task_id = %task_id,
                    reporter = ?reporter,
                    assigned_node = ?task.assigned_node,
                    status = %task.status,
                    "Ignoring failure report for an attempt that is no longer current"
                );
                Ok(task)
            }
            Completion::Completed(task, node) => {
                if let Some(node) = &node {
                    self.inner.persist_node(node).await;
                }
                self.inner.persist_task(&task).await;
                metrics::counter!("convoy_tasks_completed_total").increment(1);
                self.inner.emit(DistributedEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    node_id: task.assigned_node.clone(),
                });
                info!(task_id = %task_id, "Task completed");
                Ok(task)
            }
            Completion::Failed(task, node, outcome) => {
                self.inner
                    .after_failure(&task, node.as_ref(), outcome, "reported failure")
                    .await;
                Ok(task)
            }
        }
    }

    /// Try every pending queued task once. Returns how many were placed.
    pub async fn process_queue(&self) -> usize {
        self.inner.process_queue().await
    }

    /// Mark nodes with stale heartbeats offline and re-queue their work.
    /// Returns how many nodes went offline.
    pub async fn check_health(&self) -> usize {
        self.inner.check_health().await
    }

    /// Register the local node and launch the heartbeat, queue and health
    /// loops plus the remote-heartbeat subscription.
    pub async fn start(&self) -> WorkerNode {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            if let Some(node) = self.node(&self.inner.local_node_id) {
                warn!("Coordinator already running");
                return node;
            }
        }

        let local = self.register_local_node().await;
        let token = CancellationToken::new();
        let config = &self.inner.config;

        let handles = vec![
            spawn_loop(
                "heartbeat",
                config.heartbeat_interval,
                token.clone(),
                self.inner.clone(),
                |inner| async move { inner.send_heartbeat().await },
            ),
            spawn_loop(
                "queue_processor",
                config.queue_interval,
                token.clone(),
                self.inner.clone(),
                |inner| async move {
                    inner.process_queue().await;
                },
            ),
            spawn_loop(
                "health_checker",
                config.health_check_interval,
                token.clone(),
                self.inner.clone(),
                |inner| async move {
                    inner.check_health().await;
                },
            ),
        ];
        let subscription = subscribe_heartbeats(&self.inner);

        if let Some(previous) = self.inner.loops.lock().replace(RunningLoops {
            token,
            handles,
            subscription,
        }) {
            previous.token.cancel();
            previous.handles.iter().for_each(JoinHandle::abort);
            self.inner.bus.unsubscribe(&previous.subscription);
        }

        info!(node_id = %local.id, address = %local.endpoint(), "Distributed coordinator started");
        local
    }

    /// Stop the background loops and deregister the local node.
    pub async fn shutdown(&self) {
        let loops = self.inner.loops.lock().take();
        if let Some(loops) = loops {
            loops.token.cancel();
            loops.handles.iter().for_each(JoinHandle::abort);
            self.inner.bus.unsubscribe(&loops.subscription);
        }
        self.inner.running.store(false, Ordering::SeqCst);
        self.deregister_node(&self.inner.local_node_id).await;
        info!("Distributed coordinator stopped");
    }

    pub fn node(&self, node_id: &NodeId) -> Option<WorkerNode> {
        self.inner.state.lock().nodes.get(node_id).cloned()
    }

    /// All nodes in registration order, optionally only those in `status`.
    pub fn nodes(&self, status: Option<NodeStatus>) -> Vec<WorkerNode> {
        let mut nodes = self.inner.state.lock().sorted_nodes();
        if let Some(status) = status {
            nodes.retain(|n| n.status == status);
        }
        nodes
    }

    pub fn available_nodes(&self, capability: Option<&Capability>) -> Vec<WorkerNode> {
        self.inner.available_nodes(capability)
    }

    pub fn task(&self, task_id: &TaskId) -> Option<DistributedTask> {
        self.inner.state.lock().tasks.get(task_id).cloned()
    }

    /// Tasks in submission order, filtered by status and node.
    pub fn tasks(
        &self,
        status: Option<TaskStatus>,
        node_id: Option<&NodeId>,
        limit: usize,
    ) -> Vec<DistributedTask> {
        let mut tasks: Vec<DistributedTask> = self
            .inner
            .state
            .lock()
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .filter(|t| node_id.is_none_or(|n| t.assigned_node.as_ref() == Some(n)))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks.truncate(limit);
        tasks
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = self.inner.state.lock();
        let nodes = NodeStats {
            total: state.nodes.len(),
            online: state
                .nodes
                .values()
                .filter(|n| n.status == NodeStatus::Online)
                .count(),
            total_capacity: state.nodes.values().map(|n| n.max_capacity).sum(),
            used_capacity: state.nodes.values().map(|n| n.current_load).sum(),
        };

        let mut tasks = TaskStats {
            total: state.tasks.len(),
            queued: state.queue.len(),
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => tasks.pending += 1,
                TaskStatus::Assigned => tasks.assigned += 1,
                TaskStatus::Running => tasks.running += 1,
                TaskStatus::Completed => tasks.completed += 1,
                TaskStatus::Failed => tasks.failed += 1,
            }
        }

        CoordinatorStats {
            nodes,
            tasks,
            strategy: state.strategy,
            local_node_id: self.inner.local_node_id.clone(),
        }
    }
}

impl CoordinatorInner {
    /// Insert or replace a node. A re-registration keeps the load of tasks
    /// already placed on it.
    async fn insert_node(&self, mut node: WorkerNode) -> WorkerNode {
        let replaced = {
            let mut state = self.state.lock();
            if let Some(existing) = state.nodes.get(&node.id) {
                node.current_load = existing.current_load;
            }
            state.nodes.insert(node.id.clone(), node.clone()).is_some()
        };
        if !replaced {
            metrics::gauge!("convoy_nodes_registered").increment(1.0);
        }

        self.persist_node(&node).await;
        self.emit(DistributedEvent::NodeRegistered {
            node_id: node.id.clone(),
            hostname: node.hostname.clone(),
            address: node.address.clone(),
            port: node.port,
            capabilities: node.capabilities.clone(),
            max_capacity: node.max_capacity,
        });
        info!(
            node_id = %node.id,
            address = %node.address,
            port = node.port,
            max_capacity = node.max_capacity,
            "Registered node"
        );
        node
    }

    async fn heartbeat(&self, node_id: &NodeId, load: Option<u32>) -> bool {
        let node = {
            let mut state = self.state.lock();
            let Some(node) = state.nodes.get_mut(node_id) else {
                return false;
            };
            if node.record_heartbeat(Utc::now(), load) {
                info!(node_id = %node_id, "Node back online");
            }
            node.clone()
        };
        self.persist_node(&node).await;
        true
    }

    async fn send_heartbeat(&self) {
        let local = self.local_node_id.clone();
        if !self.heartbeat(&local, None).await {
            warn!(node_id = %local, "Local node missing, heartbeat skipped");
            return;
        }
        let load = self
            .state
            .lock()
            .nodes
            .get(&local)
            .map(|n| n.current_load);
        self.emit(DistributedEvent::Heartbeat {
            node_id: local,
            timestamp: Utc::now(),
            load,
        });
    }

    fn available_nodes(&self, capability: Option<&Capability>) -> Vec<WorkerNode> {
        let now = Utc::now();
        let threshold = self.config.liveness_threshold;
        let mut nodes = self.state.lock().sorted_nodes();
        nodes.retain(|n| {
            n.is_available(now, threshold) && capability.is_none_or(|c| n.has_capability(c))
        });
        nodes
    }

    /// Place `task_id` on a node and dispatch it. Returns false (and keeps the
    /// task queued) when no node qualifies.
    async fn try_assign(&self, task_id: &TaskId) -> bool {
        let now = Utc::now();
        let threshold = self.config.liveness_threshold;

        let (task, node) = {
            let mut state = self.state.lock();
            let Some((status, capability)) = state
                .tasks
                .get(task_id)
                .map(|t| (t.status, t.required_capability.clone()))
            else {
                return false;
            };
            if status != TaskStatus::Pending {
                state.dequeue(task_id);
                return false;
            }

            let mut candidates = state.sorted_nodes();
            candidates.retain(|n| {
                n.is_available(now, threshold)
                    && capability.as_ref().is_none_or(|c| n.has_capability(c))
            });
            let Some(node_id) = state
                .strategy
                .select(&candidates, state.tasks.len())
                .map(|n| n.id.clone())
            else {
                state.enqueue(task_id);
                return false;
            };

            let Some(node) = state.nodes.get_mut(&node_id) else {
                state.enqueue(task_id);
                return false;
            };
            node.acquire_slot();
            let node = node.clone();

            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            task.assign(node_id);
            let task = task.clone();
            state.dequeue(task_id);
            (task, node)
        };

        self.persist_task(&task).await;
        self.persist_node(&node).await;
        self.emit(DistributedEvent::TaskAssigned {
            task_id: task.id.clone(),
            node_id: node.id.clone(),
        });
        info!(task_id = %task.id, node_id = %node.id, "Task assigned");

        let dispatched = match tokio::time::timeout(
            self.config.dispatch_timeout,
            self.dispatcher.dispatch(&node, &task),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout),
        };

        match dispatched {
            Ok(()) => self.mark_running(task_id, &node.id).await,
            Err(e) => {
                error!(task_id = %task.id, node_id = %node.id, error = %e, "Failed to dispatch task");
                self.dispatch_failed(task_id, &node.id, &e.to_string()).await;
            }
        }
        true
    }

    async fn mark_running(&self, task_id: &TaskId, node_id: &NodeId) {
        let task = {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return;
            };
            // The node may already have reported back, or the task moved on.
            if task.status != TaskStatus::Assigned || task.assigned_node.as_ref() != Some(node_id)
            {
                return;
            }
            task.mark_running(Utc::now());
            task.clone()
        };
        metrics::counter!("convoy_tasks_dispatched_total").increment(1);
        self.persist_task(&task).await;
        debug!(task_id = %task_id, node_id = %node_id, "Task running");
    }

    async fn dispatch_failed(&self, task_id: &TaskId, node_id: &NodeId, error: &str) {
        let failed = {
            let mut state = self.state.lock();
            let still_held = state.tasks.get(task_id).is_some_and(|t| {
                t.status == TaskStatus::Assigned && t.assigned_node.as_ref() == Some(node_id)
            });
            if !still_held {
                return;
            }
            state.fail_task(task_id, error, Utc::now())
        };
        if let Some((task, node, outcome)) = failed {
            self.after_failure(&task, node.as_ref(), outcome, error).await;
        }
    }

    async fn after_failure(
        &self,
        task: &DistributedTask,
        node: Option<&WorkerNode>,
        outcome: FailureOutcome,
        reason: &str,
    ) {
        if let Some(node) = node {
            self.persist_node(node).await;
        }
        self.persist_task(task).await;

        match outcome {
            FailureOutcome::Requeued => {
                warn!(
                    task_id = %task.id,
                    retries = task.retries,
                    max_retries = task.max_retries,
                    reason,
                    "Task attempt failed, re-queued"
                );
                self.emit(DistributedEvent::TaskRequeued {
                    task_id: task.id.clone(),
                    retries: task.retries,
                    reason: reason.to_string(),
                });
            }
            FailureOutcome::Exhausted => {
                metrics::counter!("convoy_tasks_failed_total").increment(1);
                error!(task_id = %task.id, retries = task.retries, reason, "Task failed permanently");
                self.emit(DistributedEvent::TaskFailed {
                    task_id: task.id.clone(),
                    error: reason.to_string(),
                    retries: task.retries,
                });
            }
        }
    }

    /// Persist and announce tasks pulled off a node.
    async fn requeued(&self, tasks: &[DistributedTask], reason: &str) {
        for task in tasks {
            metrics::counter!("convoy_tasks_reassigned_total").increment(1);
            self.persist_task(task).await;
            self.emit(DistributedEvent::TaskRequeued {
                task_id: task.id.clone(),
                retries: task.retries,
                reason: reason.to_string(),
            });
        }
    }

    async fn process_queue(&self) -> usize {
        let queued: Vec<TaskId> = self.state.lock().queue.iter().cloned().collect();
        let mut placed = 0;
        for id in queued {
            if self.try_assign(&id).await {
                placed += 1;
            }
        }
        if placed > 0 {
            debug!(placed, "Queue processor placed tasks");
        }
        placed
    }

    async fn check_health(&self) -> usize {
        let now = Utc::now();
        let threshold = self.config.liveness_threshold;

        let offline: Vec<(WorkerNode, Vec<DistributedTask>)> = {
            let mut state = self.state.lock();
            let stale: Vec<NodeId> = state
                .nodes
                .values()
                .filter(|n| {
                    n.id != self.local_node_id
                        && n.status != NodeStatus::Offline
                        && n.heartbeat_age(now) > threshold
                })
                .map(|n| n.id.clone())
                .collect();

            stale
                .into_iter()
                .filter_map(|id| {
                    let requeued = state.requeue_from_node(&id);
                    let node = state.nodes.get_mut(&id)?;
                    node.status = NodeStatus::Offline;
                    Some((node.clone(), requeued))
                })
                .collect()
        };

        for (node, requeued) in &offline {
            warn!(
                node_id = %node.id,
                last_heartbeat = %node.last_heartbeat,
                requeued = requeued.len(),
                "Node unresponsive, marked offline"
            );
            metrics::counter!("convoy_nodes_offline_total").increment(1);
            self.persist_node(node).await;
            self.requeued(requeued, &format!("node {} offline", node.id))
                .await;
            self.emit(DistributedEvent::NodeOffline {
                node_id: node.id.clone(),
                last_heartbeat: node.last_heartbeat,
                requeued: requeued.len(),
            });
        }
        offline.len()
    }

    fn emit(&self, event: DistributedEvent) {
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        self.bus
            .publish(&event.topic(), payload, Some(COORDINATOR_SOURCE));
    }

    async fn persist_node(&self, node: &WorkerNode) {
        if let Some(repository) = &self.node_repository {
            if let Err(e) = repository.save(node).await {
                warn!(node_id = %node.id, error = %e, "Failed to persist node");
            }
        }
    }

    async fn persist_task(&self, task: &DistributedTask) {
        if let Some(repository) = &self.task_repository {
            if let Err(e) = repository.save(task).await {
                warn!(task_id = %task.id, error = %e, "Failed to persist task");
            }
        }
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    inner: Arc<CoordinatorInner>,
    step: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<CoordinatorInner>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        info!(loop_name = name, interval = ?period, "Starting coordinator loop");
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => step(inner.clone()).await,
                _ = token.cancelled() => {
                    info!(loop_name = name, "Shutdown signal received, stopping coordinator loop");
                    break;
                }
            }
        }
    })
}

/// Apply heartbeats other processes publish on the bus.
fn subscribe_heartbeats(inner: &Arc<CoordinatorInner>) -> SubscriptionId {
    let weak: Weak<CoordinatorInner> = Arc::downgrade(inner);
    inner.bus.subscribe_with(
        HEARTBEAT_TOPIC,
        SubscribeOptions::default().subscriber(HEARTBEAT_SUBSCRIBER),
        move |message| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => apply_remote_heartbeat(&inner, &message).await,
                    None => Ok(None),
                }
            }
        },
    )
}

async fn apply_remote_heartbeat(inner: &CoordinatorInner, message: &Message) -> HandlerResult {
    let Some(node_id) = message.payload.get("node_id").and_then(|v| v.as_str()) else {
        anyhow::bail!("heartbeat without node_id");
    };
    let node_id = NodeId::from(node_id);
    if node_id == inner.local_node_id {
        return Ok(None);
    }
    let load = message
        .payload
        .get("load")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok());
    if !inner.heartbeat(&node_id, load).await {
        debug!(node_id = %node_id, "Heartbeat from unknown node ignored");
    }
    Ok(None)
}
