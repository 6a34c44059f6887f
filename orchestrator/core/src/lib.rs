// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # convoy-core
//!
//! Coordination primitives for a fleet of long-running AI agents on one host.
//!
//! | Layer | Contents |
//! |-------|----------|
//! | `domain` | messages, sessions and their state machine table, agent specs and results, lifecycle events, repository ports |
//! | `application` | message bus, session machine, agent supervisor, coordination patterns, session binding |
//! | `infrastructure` | in-memory and sled repositories, broadcast event sink |
//!
//! Components never call each other directly for notifications: the supervisor
//! publishes `orchestrator.*`, the session machine `session.*`, and anything
//! interested subscribes on the [`application::MessageBus`].

pub mod application;
pub mod domain;
pub mod infrastructure;
