// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Node and task repositories: in-memory maps and sled trees.

use async_trait::async_trait;
use convoy_core::domain::repository::RepositoryError;
use convoy_core::infrastructure::SledStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{DistributedTask, NodeId, NodeRepository, TaskId, TaskRepository, WorkerNode};

pub const NODES_TREE: &str = "nodes";
pub const TASKS_TREE: &str = "tasks";

#[derive(Clone, Default)]
pub struct InMemoryNodeRepository {
    nodes: Arc<RwLock<HashMap<NodeId, WorkerNode>>>,
}

impl InMemoryNodeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRepository for InMemoryNodeRepository {
    async fn save(&self, node: &WorkerNode) -> Result<(), RepositoryError> {
        self.nodes.write().insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &NodeId) -> Result<Option<WorkerNode>, RepositoryError> {
        Ok(self.nodes.read().get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<WorkerNode>, RepositoryError> {
        Ok(self.nodes.read().values().cloned().collect())
    }

    async fn delete(&self, id: &NodeId) -> Result<(), RepositoryError> {
        self.nodes.write().remove(id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<TaskId, DistributedTask>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &DistributedTask) -> Result<(), RepositoryError> {
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<DistributedTask>, RepositoryError> {
        Ok(self.tasks.read().get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<DistributedTask>, RepositoryError> {
        Ok(self.tasks.read().values().cloned().collect())
    }
}

pub struct SledNodeRepository {
    store: SledStore,
}

impl SledNodeRepository {
    pub fn new(store: SledStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NodeRepository for SledNodeRepository {
    async fn save(&self, node: &WorkerNode) -> Result<(), RepositoryError> {
        self.store.put(NODES_TREE, node.id.as_str(), node).await
    }

    async fn find_by_id(&self, id: &NodeId) -> Result<Option<WorkerNode>, RepositoryError> {
        self.store.get(NODES_TREE, id.as_str())
    }

    async fn list_all(&self) -> Result<Vec<WorkerNode>, RepositoryError> {
        self.store.list(NODES_TREE)
    }

    async fn delete(&self, id: &NodeId) -> Result<(), RepositoryError> {
        self.store.remove(NODES_TREE, id.as_str()).await?;
        Ok(())
    }
}

pub struct SledTaskRepository {
    store: SledStore,
}

impl SledTaskRepository {
    pub fn new(store: SledStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskRepository for SledTaskRepository {
    async fn save(&self, task: &DistributedTask) -> Result<(), RepositoryError> {
        self.store.put(TASKS_TREE, task.id.as_str(), task).await
    }

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<DistributedTask>, RepositoryError> {
        self.store.get(TASKS_TREE, id.as_str())
    }

    async fn list_all(&self) -> Result<Vec<DistributedTask>, RepositoryError> {
        self.store.list(TASKS_TREE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, TaskStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_sled_tasks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = DistributedTask::new("code", json!({ "repo": "convoy" }), Some(Capability::Code));
        task.complete(json!({ "ok": true }), chrono::Utc::now());
        {
            let repo = SledTaskRepository::new(SledStore::open(dir.path()).unwrap());
            repo.save(&task).await.unwrap();
        }

        let repo = SledTaskRepository::new(SledStore::open(dir.path()).unwrap());
        let loaded = repo.find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.required_capability, Some(Capability::Code));
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_node_repositories_delete() {
        let node = WorkerNode::new(NodeId::new(), "h", "10.1.1.1", 8765, Capability::defaults(), 4);

        let memory = InMemoryNodeRepository::new();
        memory.save(&node).await.unwrap();
        memory.delete(&node.id).await.unwrap();
        assert!(memory.list_all().await.unwrap().is_empty());

        let sled = SledNodeRepository::new(SledStore::temporary().unwrap());
        sled.save(&node).await.unwrap();
        assert_eq!(sled.find_by_id(&node.id).await.unwrap(), Some(node.clone()));
        sled.delete(&node.id).await.unwrap();
        assert!(sled.find_by_id(&node.id).await.unwrap().is_none());
    }
}
