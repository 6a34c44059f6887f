// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod dispatch;
pub mod repositories;

pub use dispatch::{HttpTaskDispatcher, COMPLETE_PATH, EXECUTE_PATH};
pub use repositories::{
    InMemoryNodeRepository, InMemoryTaskRepository, SledNodeRepository, SledTaskRepository,
};
