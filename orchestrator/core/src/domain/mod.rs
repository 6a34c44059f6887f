// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer
//!
//! Pure domain types for the coordination core. Nothing in here spawns tasks
//! or touches I/O; the application layer owns all concurrency.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`agent`] | `AgentSpec`, `AgentRuntimeState`, the `Agent` contract and the agent-type registry |
//! | [`message`] | `Message`, topic patterns, subscription metadata |
//! | [`session`] | `Session` aggregate and the lifecycle transition table |
//! | [`events`] | Orchestrator lifecycle events and the external event sink port |
//! | [`repository`] | Persistence ports for sessions and agent records |

pub mod agent;
pub mod events;
pub mod message;
pub mod repository;
pub mod session;

/// Build a `<prefix><hex>` identifier from a fresh v4 UUID, keeping `len` hex digits.
pub fn prefixed_id(prefix: &str, len: usize) -> String {
    let mut hex = uuid::Uuid::new_v4().simple().to_string();
    hex.truncate(len);
    format!("{prefix}{hex}")
}
