// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service wiring for one daemon process.
//!
//! Everything shares a single [`MessageBus`]: the supervisor and the session
//! machine are tied together with [`bind_sessions`], and every topic is
//! mirrored to a broadcast sink for in-process consumers.

use anyhow::{Context, Result};
use convoy_core::application::{
    bind_sessions, MessageBus, Orchestrator, SessionMachine,
};
use convoy_core::domain::agent::AgentTypeRegistry;
use convoy_core::domain::message::SubscriptionId;
use convoy_core::domain::repository::StorageBackend;
use convoy_core::infrastructure::{
    attach_sink, BroadcastEventSink, RedisBusBridge, SledAgentRepository, SledSessionRepository,
    SledStore,
};
use convoy_swarm::application::DistributedCoordinator;
use convoy_swarm::infrastructure::{HttpTaskDispatcher, SledNodeRepository, SledTaskRepository};
use convoy_swarm::WorkerNode;
use std::sync::Arc;
use tracing::{info, warn};

use super::agents::builtin_registry;
use super::base_url;
use super::executor::TaskExecutor;
use crate::config::ConvoyConfig;

const EVENT_SINK_CAPACITY: usize = 1024;

pub struct AppContext {
    pub config: ConvoyConfig,
    pub bus: MessageBus,
    pub sessions: Arc<SessionMachine>,
    pub orchestrator: Orchestrator,
    pub coordinator: DistributedCoordinator,
    pub agent_types: AgentTypeRegistry,
    pub executor: TaskExecutor,
    pub events: BroadcastEventSink,
    bridge: Option<RedisBusBridge>,
    subscriptions: Vec<SubscriptionId>,
}

impl AppContext {
    /// Build every service from `config`, bridging the bus when configured,
    /// opening storage and reloading persisted sessions, nodes and tasks.
    pub async fn build(config: ConvoyConfig) -> Result<Self> {
        let spec = &config.spec;
        let bus = MessageBus::new(spec.bus.clone());
        let bridge = match &spec.bus.bridge {
            Some(bridge) => RedisBusBridge::connect_or_local(&bus, bridge).await,
            None => None,
        };

        let network = &spec.network;
        let local = &spec.coordinator.local_node;
        if local.port != network.port {
            warn!(
                local_node_port = local.port,
                listen_port = network.port,
                "Local node advertises a different port than the daemon listens on"
            );
        }
        let reply_to = base_url(&local.address, local.port);
        let dispatcher = Arc::new(
            HttpTaskDispatcher::new(spec.coordinator.dispatch_timeout)
                .context("Failed to build task dispatcher")?
                .with_reply_to(reply_to),
        );

        let (sessions, orchestrator, coordinator) = match spec.storage.resolve() {
            StorageBackend::InMemory => {
                info!("Using in-memory storage");
                (
                    SessionMachine::new(bus.clone()),
                    Orchestrator::new(spec.orchestrator.clone(), bus.clone()),
                    DistributedCoordinator::new(spec.coordinator.clone(), bus.clone(), dispatcher),
                )
            }
            StorageBackend::Sled { path } => {
                std::fs::create_dir_all(&path).with_context(|| {
                    format!("Failed to create storage directory {}", path.display())
                })?;
                let store = SledStore::open(&path).context("Failed to open sled store")?;
                (
                    SessionMachine::new(bus.clone())
                        .with_repository(Arc::new(SledSessionRepository::new(store.clone()))),
                    Orchestrator::with_repository(
                        spec.orchestrator.clone(),
                        bus.clone(),
                        Arc::new(SledAgentRepository::new(store.clone())),
                    ),
                    DistributedCoordinator::with_repositories(
                        spec.coordinator.clone(),
                        bus.clone(),
                        dispatcher,
                        Arc::new(SledNodeRepository::new(store.clone())),
                        Arc::new(SledTaskRepository::new(store)),
                    ),
                )
            }
        };
        let sessions = Arc::new(sessions);

        let restored_sessions = sessions
            .load_all()
            .await
            .context("Failed to reload sessions")?;
        let (restored_nodes, restored_tasks) = coordinator
            .load_all()
            .await
            .context("Failed to reload coordinator state")?;
        if restored_sessions + restored_nodes + restored_tasks > 0 {
            info!(
                sessions = restored_sessions,
                nodes = restored_nodes,
                tasks = restored_tasks,
                "Restored persisted state"
            );
        }

        let events = BroadcastEventSink::new(EVENT_SINK_CAPACITY);
        let mut subscriptions = vec![bind_sessions(&bus, sessions.clone())];
        subscriptions.extend(attach_sink(&bus, Arc::new(events.clone())));

        let agent_types = builtin_registry();
        let executor = TaskExecutor::new(
            orchestrator.clone(),
            agent_types.clone(),
            coordinator.clone(),
        );

        Ok(Self {
            config,
            bus,
            sessions,
            orchestrator,
            coordinator,
            agent_types,
            executor,
            events,
            bridge,
            subscriptions,
        })
    }

    /// Launch the supervisor health monitor and the coordinator loops.
    /// Returns the local worker node.
    pub async fn start(&self) -> WorkerNode {
        self.orchestrator.start_health_monitor();
        let local = self.coordinator.start().await;
        info!(
            node_id = %local.id,
            agent_types = ?self.agent_types.types(),
            "convoy services started"
        );
        local
    }

    pub fn is_bridged(&self) -> bool {
        self.bridge.is_some()
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.orchestrator.shutdown().await;
        for subscription in &self.subscriptions {
            self.bus.unsubscribe(subscription);
        }
        if let Some(bridge) = &self.bridge {
            bridge.shutdown();
        }
        info!("convoy services stopped");
    }
}
