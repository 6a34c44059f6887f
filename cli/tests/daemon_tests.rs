// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Two daemons on loopback: one coordinates, the other executes the task and
//! reports the outcome back over HTTP.

use convoy_cli::config::ConvoyConfig;
use convoy_cli::daemon::{router, AppContext};
use convoy_swarm::application::NodeRegistration;
use convoy_swarm::{Capability, TaskStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn serve(name: &str) -> (Arc<AppContext>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = ConvoyConfig::default();
    config.metadata.name = name.to_string();
    config.spec.network.port = port;
    config.spec.coordinator.local_node.port = port;

    let ctx = Arc::new(AppContext::build(config).await.unwrap());
    let app = router(ctx.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (ctx, port)
}

#[tokio::test]
async fn test_task_runs_on_remote_worker_and_reports_back() {
    let (coordinator, _) = serve("coordinator").await;
    let (worker, worker_port) = serve("worker").await;

    let node = coordinator
        .coordinator
        .register_node(NodeRegistration {
            node_id: None,
            hostname: "worker".to_string(),
            address: "127.0.0.1".to_string(),
            port: worker_port,
            capabilities: [Capability::Code].into_iter().collect(),
            max_capacity: 2,
        })
        .await;

    let task = coordinator
        .coordinator
        .submit_task(
            "delay",
            json!({ "goal": "compile", "duration_ms": 20 }),
            Some(Capability::Code),
        )
        .await;
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.assigned_node.as_ref(), Some(&node.id));

    let mut done = None;
    for _ in 0..300 {
        let current = coordinator.coordinator.task(&task.id).unwrap();
        if current.status.is_terminal() {
            done = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let done = done.expect("task settled");
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!({ "slept_ms": 20 })));

    let freed = coordinator.coordinator.node(&node.id).unwrap();
    assert_eq!(freed.current_load, 0);

    // The worker ran the agent and cleaned it up.
    assert!(worker.coordinator.task(&task.id).is_none());
    let ran = worker
        .bus
        .history(Some("orchestrator.agent_completed"), None, 10);
    assert_eq!(ran.len(), 1);
    for _ in 0..100 {
        if worker.orchestrator.list(None).is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker kept the finished agent registered");
}

#[tokio::test]
async fn test_unknown_task_type_fails_after_retries() {
    let (coordinator, _) = serve("coordinator").await;
    let (_worker, worker_port) = serve("worker").await;

    coordinator
        .coordinator
        .register_node(NodeRegistration {
            node_id: None,
            hostname: "worker".to_string(),
            address: "127.0.0.1".to_string(),
            port: worker_port,
            capabilities: Default::default(),
            max_capacity: 1,
        })
        .await;

    let mut task = coordinator
        .coordinator
        .submit_task("translate", json!({}), None)
        .await;
    for _ in 0..coordinator.coordinator.config().max_retries {
        if task.status.is_terminal() {
            break;
        }
        coordinator.coordinator.process_queue().await;
        task = coordinator.coordinator.task(&task.id).unwrap();
    }

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retries, 3);
}
