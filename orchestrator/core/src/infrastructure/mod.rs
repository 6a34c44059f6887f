// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod redis_bridge;
pub mod repositories;
pub mod sled_store;

pub use event_bus::{attach_sink, BroadcastEventSink, EventBusError, EventReceiver};
pub use redis_bridge::{BridgeError, RedisBusBridge};
pub use repositories::{InMemoryAgentRepository, InMemorySessionRepository};
pub use sled_store::{SledAgentRepository, SledSessionRepository, SledStore};
