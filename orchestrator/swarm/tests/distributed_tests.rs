// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Coordinator scenarios with live background loops: HTTP dispatch to a
//! worker, and work moving off a node that stops heartbeating.

use async_trait::async_trait;
use chrono::Utc;
use convoy_core::application::MessageBus;
use convoy_core::domain::message::Message;
use convoy_core::infrastructure::{attach_sink, BroadcastEventSink};
use convoy_swarm::application::{
    CoordinatorConfig, DistributedCoordinator, LocalNodeConfig, NodeRegistration,
};
use convoy_swarm::infrastructure::HttpTaskDispatcher;
use convoy_swarm::{
    Capability, DispatchError, DistributedTask, NodeStatus, TaskDispatcher, TaskStatus,
    WorkerNode, HEARTBEAT_TOPIC,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct AcceptAll;

#[async_trait]
impl TaskDispatcher for AcceptAll {
    async fn dispatch(&self, _node: &WorkerNode, _task: &DistributedTask) -> Result<(), DispatchError> {
        Ok(())
    }
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_http_dispatch_to_worker_and_completion_events() {
    let mut worker = mockito::Server::new_async().await;
    let execute = worker
        .mock("POST", "/distributed/execute")
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let bus = MessageBus::default();
    let sink = BroadcastEventSink::new(64);
    let mut events = sink.subscribe();
    attach_sink(&bus, Arc::new(sink));

    let dispatcher = Arc::new(HttpTaskDispatcher::new(Duration::from_secs(5)).unwrap());
    let coordinator = DistributedCoordinator::new(CoordinatorConfig::default(), bus, dispatcher);

    let authority = worker.url().trim_start_matches("http://").to_string();
    let (address, port) = authority.rsplit_once(':').unwrap();
    let node = coordinator
        .register_node(NodeRegistration {
            node_id: None,
            hostname: "worker-1".to_string(),
            address: address.to_string(),
            port: port.parse().unwrap(),
            capabilities: [Capability::Research].into_iter().collect(),
            max_capacity: 2,
        })
        .await;

    let task = coordinator
        .submit_task("research", json!({ "topic": "rust" }), Some(Capability::Research))
        .await;
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.assigned_node.as_ref(), Some(&node.id));
    execute.assert_async().await;

    let done = coordinator
        .complete_task(&task.id, json!({ "summary": "ok" }), true)
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(coordinator.node(&node.id).unwrap().current_load, 0);

    let mut seen = Vec::new();
    while !seen.contains(&"task_completed".to_string()) {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("sink event")
            .unwrap();
        if event.category == "distributed" {
            seen.push(event.event_type);
        }
    }
    assert_eq!(
        seen,
        vec!["node_registered", "task_submitted", "task_assigned", "task_completed"]
    );
}

#[tokio::test]
async fn test_silent_node_loses_its_task_to_a_live_one() {
    let config = CoordinatorConfig {
        queue_interval: Duration::from_millis(20),
        health_check_interval: Duration::from_millis(20),
        liveness_threshold: Duration::from_millis(150),
        heartbeat_interval: Duration::from_millis(20),
        local_node: LocalNodeConfig {
            capabilities: [Capability::Custom("local-only".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        },
        ..Default::default()
    };
    let bus = MessageBus::default();
    let coordinator = DistributedCoordinator::new(config, bus.clone(), Arc::new(AcceptAll));
    coordinator.start().await;

    let research = || NodeRegistration {
        node_id: None,
        hostname: "worker".to_string(),
        address: "10.0.0.9".to_string(),
        port: 8765,
        capabilities: [Capability::Research].into_iter().collect(),
        max_capacity: 3,
    };
    let silent = coordinator.register_node(research()).await;
    let task = coordinator
        .submit_task("research", json!({}), Some(Capability::Research))
        .await;
    assert_eq!(task.assigned_node.as_ref(), Some(&silent.id));

    let live = coordinator.register_node(research()).await;
    let beating = {
        let bus = bus.clone();
        let node_id = live.id.clone();
        tokio::spawn(async move {
            loop {
                bus.publish(
                    HEARTBEAT_TOPIC,
                    json!({ "node_id": node_id.as_str(), "timestamp": Utc::now() }),
                    Some("worker"),
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    };

    let view = coordinator.clone();
    let task_id = task.id.clone();
    let live_id = live.id.clone();
    eventually(move || {
        view.task(&task_id)
            .is_some_and(|t| t.assigned_node.as_ref() == Some(&live_id))
    })
    .await;

    let moved = coordinator.task(&task.id).unwrap();
    assert_eq!(moved.status, TaskStatus::Running);
    assert_eq!(moved.retries, 0);
    assert_eq!(coordinator.node(&silent.id).unwrap().status, NodeStatus::Offline);
    assert_eq!(
        coordinator.node(coordinator.local_node_id()).unwrap().status,
        NodeStatus::Online
    );
    assert!(!bus.history(Some("distributed.node_offline"), None, 10).is_empty());

    beating.abort();
    coordinator.shutdown().await;
    assert!(coordinator.node(coordinator.local_node_id()).is_none());
}

#[tokio::test]
async fn test_late_failure_from_previous_holder_is_ignored() {
    let bus = MessageBus::default();
    let coordinator =
        DistributedCoordinator::new(CoordinatorConfig::default(), bus, Arc::new(AcceptAll));
    let single = |hostname: &str| NodeRegistration {
        node_id: None,
        hostname: hostname.to_string(),
        address: "10.0.0.7".to_string(),
        port: 8765,
        capabilities: [Capability::Code].into_iter().collect(),
        max_capacity: 1,
    };

    let first = coordinator.register_node(single("first")).await;
    let task = coordinator
        .submit_task("code", json!({}), Some(Capability::Code))
        .await;
    assert_eq!(task.assigned_node.as_ref(), Some(&first.id));

    assert!(coordinator.deregister_node(&first.id).await);
    let second = coordinator.register_node(single("second")).await;
    coordinator.process_queue().await;
    let moved = coordinator.task(&task.id).unwrap();
    assert_eq!(moved.status, TaskStatus::Running);
    assert_eq!(moved.assigned_node.as_ref(), Some(&second.id));

    for _ in 0..5 {
        let kept = coordinator
            .complete_task_from(
                &task.id,
                Some(&first.id),
                json!({ "error": "lost connection" }),
                false,
            )
            .await
            .unwrap();
        assert_eq!(kept.status, TaskStatus::Running);
        assert_eq!(kept.retries, 0);
        assert_eq!(coordinator.node(&second.id).unwrap().current_load, 1);
    }

    let done = coordinator
        .complete_task_from(&task.id, Some(&second.id), json!({ "ok": true }), true)
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(coordinator.node(&second.id).unwrap().current_load, 0);
}

#[tokio::test]
async fn test_failure_report_for_queued_task_is_ignored() {
    let bus = MessageBus::default();
    let coordinator =
        DistributedCoordinator::new(CoordinatorConfig::default(), bus, Arc::new(AcceptAll));
    let task = coordinator.submit_task("chat", json!({}), None).await;
    assert_eq!(task.status, TaskStatus::Pending);

    let kept = coordinator
        .complete_task(&task.id, json!({ "error": "late" }), false)
        .await
        .unwrap();
    assert_eq!(kept.status, TaskStatus::Pending);
    assert_eq!(kept.retries, 0);
}

/// Carry every message published on `from` to `to`, like a bus bridge does.
fn bridge(from: &MessageBus, to: &MessageBus) -> tokio::task::JoinHandle<()> {
    let mut outbound = from.attach_bridge();
    let to = to.clone();
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            to.deliver_remote(message);
        }
    })
}

#[tokio::test]
async fn test_worker_heartbeats_reach_coordinator_in_another_process() {
    let fast = |port: u16| CoordinatorConfig {
        heartbeat_interval: Duration::from_millis(20),
        health_check_interval: Duration::from_secs(3600),
        liveness_threshold: Duration::from_millis(150),
        local_node: LocalNodeConfig {
            port,
            ..Default::default()
        },
        ..Default::default()
    };

    let coordinator_bus = MessageBus::default();
    let worker_bus = MessageBus::default();
    let links = [
        bridge(&worker_bus, &coordinator_bus),
        bridge(&coordinator_bus, &worker_bus),
    ];

    let coordinator =
        DistributedCoordinator::new(fast(8765), coordinator_bus.clone(), Arc::new(AcceptAll));
    let worker = DistributedCoordinator::new(fast(8766), worker_bus, Arc::new(AcceptAll));
    coordinator.start().await;
    let worker_node = worker.start().await;

    let registered = coordinator
        .register_node(NodeRegistration {
            node_id: Some(worker_node.id.clone()),
            hostname: worker_node.hostname.clone(),
            address: worker_node.address.clone(),
            port: worker_node.port,
            capabilities: worker_node.capabilities.clone(),
            max_capacity: worker_node.max_capacity,
        })
        .await;
    assert_eq!(registered.id, worker_node.id);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.check_health().await, 0);
    assert_eq!(coordinator.node(&worker_node.id).unwrap().status, NodeStatus::Online);

    let heard: Vec<Message> = coordinator_bus.history(Some(HEARTBEAT_TOPIC), None, 100);
    assert!(heard
        .iter()
        .any(|m| m.payload["node_id"] == worker_node.id.as_str()));

    worker.shutdown().await;
    coordinator.shutdown().await;
    links.iter().for_each(|link| link.abort());
}
