// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Persistence ports for the coordinator's aggregates. The coordinator keeps
//! the working copy in memory and writes behind after every mutation.

use async_trait::async_trait;
use convoy_core::domain::repository::RepositoryError;

use super::node::{NodeId, WorkerNode};
use super::task::{DistributedTask, TaskId};

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn save(&self, node: &WorkerNode) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &NodeId) -> Result<Option<WorkerNode>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<WorkerNode>, RepositoryError>;

    async fn delete(&self, id: &NodeId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Save task (create or update)
    async fn save(&self, task: &DistributedTask) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<DistributedTask>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<DistributedTask>, RepositoryError>;
}
