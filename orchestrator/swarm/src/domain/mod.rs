// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Distributed Domain Layer
//!
//! Pure types for distributed work. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`node`] | `WorkerNode`, `NodeId`, `NodeStatus`, `Capability` |
//! | [`task`] | `DistributedTask`, `TaskId`, `TaskStatus` |
//! | [`strategy`] | `LoadBalanceStrategy` |
//! | [`events`] | `DistributedEvent` and the `distributed.*` topics |
//! | [`dispatch`] | `TaskDispatcher` port, `DispatchRequest` |
//! | [`repository`] | `NodeRepository`, `TaskRepository` |

pub mod dispatch;
pub mod events;
pub mod node;
pub mod repository;
pub mod strategy;
pub mod task;

pub use dispatch::*;
pub use events::*;
pub use node::*;
pub use repository::*;
pub use strategy::*;
pub use task::*;
