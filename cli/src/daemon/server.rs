// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon HTTP server implementation
//!
//! Worker and coordinator endpoints live under `/distributed`; `/agents`,
//! `/sessions` and `/messages` are read-only views of the local supervisor,
//! session machine and bus history.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use convoy_core::application::OrchestratorError;
use convoy_core::domain::message::Message;
use convoy_swarm::application::{CoordinatorError, NodeRegistration, DEFAULT_TASK_LIMIT};
use convoy_swarm::{
    Capability, DispatchRequest, LoadBalanceStrategy, NodeId, NodeStatus, TaskId,
    TaskResultReport, TaskStatus,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use super::context::AppContext;
use super::executor::ExecuteError;
use crate::config::ConvoyConfig;

const DEFAULT_MESSAGE_LIMIT: usize = 100;

pub async fn start_daemon(config: ConvoyConfig) -> Result<()> {
    let pid = std::process::id();
    info!("convoy daemon starting (PID: {})", pid);

    let metrics = &config.spec.observability.metrics;
    if metrics.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], metrics.port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics exposed on {}", addr);
    }

    let addr = format!(
        "{}:{}",
        config.spec.network.bind_address, config.spec.network.port
    );

    let ctx = Arc::new(AppContext::build(config).await?);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    ctx.start().await;

    info!("Daemon listening on {}", addr);

    let served = axum::serve(listener, router(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    info!("Daemon shutting down");
    ctx.shutdown().await;

    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

// Application state
struct AppState {
    ctx: Arc<AppContext>,
    start_time: Instant,
}

/// HTTP routes over an already built context.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let state = AppState {
        ctx,
        start_time: Instant::now(),
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/distributed/stats", get(stats_handler))
        .route("/distributed/nodes", get(list_nodes_handler))
        .route("/distributed/nodes/available", get(available_nodes_handler))
        .route("/distributed/nodes/register", post(register_node_handler))
        .route(
            "/distributed/nodes/register-local",
            post(register_local_node_handler),
        )
        .route("/distributed/nodes/heartbeat", post(heartbeat_handler))
        .route("/distributed/nodes/{node_id}", delete(deregister_node_handler))
        .route("/distributed/nodes/{node_id}/drain", post(drain_node_handler))
        .route("/distributed/tasks", get(list_tasks_handler))
        .route("/distributed/tasks/submit", post(submit_task_handler))
        .route("/distributed/tasks/complete", post(complete_task_handler))
        .route("/distributed/tasks/{task_id}", get(get_task_handler))
        .route("/distributed/execute", post(execute_handler))
        .route("/distributed/strategy", put(strategy_handler))
        .route("/agents", get(list_agents_handler))
        .route("/agents/stats", get(agent_stats_handler))
        .route("/sessions/board", get(session_board_handler))
        .route("/sessions/stats", get(session_stats_handler))
        .route("/messages", get(messages_handler))
        .with_state(Arc::new(state))
}

/// Error body returned by every handler: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        Self::not_found(err.to_string())
    }
}

impl From<ExecuteError> for ApiError {
    fn from(err: ExecuteError) -> Self {
        let status = match &err {
            ExecuteError::UnknownTaskType(_) => StatusCode::NOT_FOUND,
            ExecuteError::Orchestrator(OrchestratorError::AlreadyRunning(_)) => {
                StatusCode::CONFLICT
            }
            ExecuteError::Orchestrator(OrchestratorError::ShuttingDown) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ExecuteError::Orchestrator(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "node_id": state.ctx.coordinator.local_node_id(),
        "bus_bridged": state.ctx.is_bridged(),
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.ctx.coordinator.stats()))
}

#[derive(Debug, Deserialize)]
struct NodeListQuery {
    status: Option<NodeStatus>,
}

async fn list_nodes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodeListQuery>,
) -> Json<Value> {
    let nodes: Vec<Value> = state
        .ctx
        .coordinator
        .nodes(query.status)
        .iter()
        .map(|n| {
            json!({
                "node_id": n.id,
                "hostname": n.hostname,
                "address": n.address,
                "port": n.port,
                "status": n.status,
                "capabilities": n.capabilities,
                "current_load": n.current_load,
                "max_capacity": n.max_capacity,
                "available_capacity": n.available_capacity(),
                "last_heartbeat": n.last_heartbeat,
            })
        })
        .collect();
    Json(Value::Array(nodes))
}

#[derive(Debug, Deserialize)]
struct AvailableQuery {
    capability: Option<Capability>,
}

async fn available_nodes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailableQuery>,
) -> Json<Value> {
    let nodes: Vec<Value> = state
        .ctx
        .coordinator
        .available_nodes(query.capability.as_ref())
        .iter()
        .map(|n| {
            json!({
                "node_id": n.id,
                "hostname": n.hostname,
                "available_capacity": n.available_capacity(),
                "capabilities": n.capabilities,
            })
        })
        .collect();
    Json(Value::Array(nodes))
}

async fn register_node_handler(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<NodeRegistration>,
) -> Json<Value> {
    let node = state.ctx.coordinator.register_node(registration).await;
    Json(json!({
        "node_id": node.id,
        "status": node.status,
        "message": "Node registered successfully",
    }))
}

async fn register_local_node_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let node = state.ctx.coordinator.register_local_node().await;
    Json(json!({
        "node_id": node.id,
        "hostname": node.hostname,
        "status": node.status,
    }))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    node_id: NodeId,
    current_load: Option<u32>,
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<Value>> {
    if !state
        .ctx
        .coordinator
        .heartbeat(&request.node_id, request.current_load)
        .await
    {
        return Err(ApiError::not_found("Node not found"));
    }
    Ok(Json(json!({ "status": "ok" })))
}

async fn deregister_node_handler(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<Json<Value>> {
    if !state.ctx.coordinator.deregister_node(&node_id).await {
        return Err(ApiError::not_found("Node not found"));
    }
    Ok(Json(json!({ "status": "deregistered", "node_id": node_id })))
}

async fn drain_node_handler(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<NodeId>,
) -> ApiResult<Json<Value>> {
    let node = state.ctx.coordinator.drain_node(&node_id).await?;
    Ok(Json(json!({ "node_id": node.id, "status": node.status })))
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    status: Option<TaskStatus>,
    node_id: Option<NodeId>,
    limit: Option<usize>,
}

async fn list_tasks_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskListQuery>,
) -> Json<Value> {
    let tasks: Vec<Value> = state
        .ctx
        .coordinator
        .tasks(
            query.status,
            query.node_id.as_ref(),
            query.limit.unwrap_or(DEFAULT_TASK_LIMIT),
        )
        .iter()
        .map(|t| {
            json!({
                "task_id": t.id,
                "task_type": t.task_type,
                "status": t.status,
                "assigned_node": t.assigned_node,
                "created_at": t.created_at,
                "started_at": t.started_at,
                "completed_at": t.completed_at,
                "retries": t.retries,
            })
        })
        .collect();
    Json(Value::Array(tasks))
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    task_type: String,
    #[serde(default)]
    payload: Value,
    required_capability: Option<Capability>,
}

async fn submit_task_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitTaskRequest>,
) -> Json<Value> {
    let task = state
        .ctx
        .coordinator
        .submit_task(
            &request.task_type,
            request.payload,
            request.required_capability,
        )
        .await;
    Json(json!({
        "task_id": task.id,
        "status": task.status,
        "assigned_node": task.assigned_node,
        "queued": task.assigned_node.is_none(),
    }))
}

async fn complete_task_handler(
    State(state): State<Arc<AppState>>,
    Json(report): Json<TaskResultReport>,
) -> ApiResult<Json<Value>> {
    let task = state
        .ctx
        .coordinator
        .complete_task_from(
            &report.task_id,
            report.node_id.as_ref(),
            report.result,
            report.success,
        )
        .await?;
    Ok(Json(json!({
        "status": "completed",
        "task_id": task.id,
        "task_status": task.status,
    })))
}

async fn get_task_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<Value>> {
    let task = state
        .ctx
        .coordinator
        .task(&task_id)
        .ok_or_else(|| ApiError::not_found("Task not found"))?;
    Ok(Json(json!(task)))
}

async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DispatchRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let task_id = request.task_id.clone();
    let agent_id = state.ctx.executor.execute(request).await.map_err(|e| {
        warn!(task_id = %task_id, error = %e, "Refusing dispatched task");
        ApiError::from(e)
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "task_id": task_id,
            "agent_id": agent_id,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct StrategyRequest {
    strategy: String,
}

async fn strategy_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StrategyRequest>,
) -> ApiResult<Json<Value>> {
    let strategy: LoadBalanceStrategy = request.strategy.parse().map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "Invalid strategy. Valid options: round_robin, least_loaded, random, capability_match",
        )
    })?;
    state.ctx.coordinator.set_strategy(strategy);
    Ok(Json(json!({ "strategy": strategy })))
}

async fn list_agents_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.ctx.orchestrator.list(None)))
}

async fn agent_stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "orchestrator": state.ctx.orchestrator.stats(),
        "agent_types": state.ctx.agent_types.types(),
    }))
}

async fn session_board_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.ctx.sessions.board()))
}

async fn session_stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.ctx.sessions.stats()))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    topic: Option<String>,
    limit: Option<usize>,
}

async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageQuery>,
) -> Json<Vec<Message>> {
    Json(state.ctx.bus.history(
        query.topic.as_deref(),
        None,
        query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT),
    ))
}
