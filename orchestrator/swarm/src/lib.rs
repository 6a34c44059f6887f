// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `convoy-swarm` — Distributed Coordination Crate
//!
//! Spreads distributed tasks across worker nodes, tracks node liveness through
//! heartbeats on the convoy message bus, and re-queues work away from nodes
//! that go silent.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `WorkerNode`, `DistributedTask`, `LoadBalanceStrategy`, dispatch and repository ports |
//! | [`application`] | Application | `DistributedCoordinator` and its background loops |
//! | [`infrastructure`] | Infrastructure | HTTP dispatcher, in-memory and sled repositories |
//!
//! ## Key Concepts
//!
//! - **Node**: a process that executes tasks, registered with an address,
//!   capabilities and a capacity. Available while online with spare capacity
//!   and a heartbeat younger than the liveness threshold.
//! - **Task**: a typed payload submitted for remote execution, retried up to
//!   `max_retries` times before it is marked failed.
//! - **Local node**: the coordinator's own process, registered on `start()`
//!   and exempt from liveness checks.
//!
//! Consistency is best-effort. There is no consensus between coordinators and
//! a task may run more than once.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
