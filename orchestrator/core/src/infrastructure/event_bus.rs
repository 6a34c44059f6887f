// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event sink implementation - fan-out of system events to observers
//
// Bridges message bus topics into `SystemEvent`s and streams them through a
// tokio broadcast channel to log shippers, SSE endpoints and tests. Events are
// not persisted; a slow receiver loses the oldest ones.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::application::message_bus::{MessageBus, SubscribeOptions};
use crate::domain::events::{EventSink, SystemEvent};
use crate::domain::message::{Message, SubscriptionId};

/// Bus topics forwarded to event sinks.
pub const BRIDGED_TOPICS: [&str; 3] = ["orchestrator.*", "session.*", "distributed.*"];

const BRIDGE_SUBSCRIBER: &str = "event_sink_bridge";

/// Event sink backed by a broadcast channel.
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: Arc<broadcast::Sender<SystemEvent>>,
}

impl BroadcastEventSink {
    /// Capacity is how many events are buffered before slow receivers start lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: SystemEvent) {
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to system events");
        }
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<SystemEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<SystemEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<SystemEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event sink is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

/// `orchestrator.agent_failed` from sender `orchestrator` becomes category
/// `orchestrator`, type `agent_failed`, source `orchestrator`.
pub fn to_system_event(message: &Message) -> SystemEvent {
    let (category, event_type) = message
        .topic
        .split_once('.')
        .unwrap_or((message.topic.as_str(), ""));
    let source = message.sender.as_deref().unwrap_or("unknown");
    let mut event = SystemEvent::new(category, event_type, source, message.payload.clone());
    event.timestamp = message.timestamp;
    event
}

/// Forward every bridged bus topic to `sink`. Returns the subscriptions created.
pub fn attach_sink(bus: &MessageBus, sink: Arc<dyn EventSink>) -> Vec<SubscriptionId> {
    BRIDGED_TOPICS
        .iter()
        .map(|pattern| {
            let sink = sink.clone();
            bus.subscribe_with(
                pattern,
                SubscribeOptions::default().subscriber(BRIDGE_SUBSCRIBER),
                move |message| {
                    let sink = sink.clone();
                    async move {
                        sink.emit(to_system_event(&message)).await;
                        Ok(None)
                    }
                },
            )
        })
        .collect()
}
