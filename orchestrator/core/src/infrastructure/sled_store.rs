// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Embedded Sled Store
//!
//! Durable write-behind storage for sessions, agent records, nodes and
//! distributed tasks. One sled database per daemon; each aggregate lives in its
//! own tree, keyed by id, with JSON-encoded values.
//!
//! | Tree | Value |
//! |------|-------|
//! | `sessions` | `Session` |
//! | `agents` | `AgentRecord` |
//! | `nodes` | `WorkerNode` (swarm crate) |
//! | `tasks` | `DistributedTask` (swarm crate) |

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::info;

use crate::domain::agent::{AgentId, AgentRecord};
use crate::domain::repository::{AgentRepository, RepositoryError, SessionRepository};
use crate::domain::session::{Session, SessionId, SessionState};

pub const SESSIONS_TREE: &str = "sessions";
pub const AGENTS_TREE: &str = "agents";

/// Shared handle to the sled database. Cloning is cheap.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        info!(path = %path.display(), "Opened sled store");
        Ok(Self { db })
    }

    /// Throwaway database removed on drop; used in tests.
    pub fn temporary() -> Result<Self, RepositoryError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub async fn put<T: Serialize>(
        &self,
        tree: &str,
        key: &str,
        value: &T,
    ) -> Result<(), RepositoryError> {
        let bytes = serde_json::to_vec(value)?;
        self.db.open_tree(tree)?.insert(key.as_bytes(), bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        tree: &str,
        key: &str,
    ) -> Result<Option<T>, RepositoryError> {
        match self.db.open_tree(tree)?.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, tree: &str, key: &str) -> Result<bool, RepositoryError> {
        let removed = self.db.open_tree(tree)?.remove(key.as_bytes())?.is_some();
        self.db.flush_async().await?;
        Ok(removed)
    }

    pub fn list<T: DeserializeOwned>(&self, tree: &str) -> Result<Vec<T>, RepositoryError> {
        self.db
            .open_tree(tree)?
            .iter()
            .values()
            .map(|value| -> Result<T, RepositoryError> { Ok(serde_json::from_slice(&value?)?) })
            .collect()
    }
}

pub struct SledSessionRepository {
    store: SledStore,
}

impl SledSessionRepository {
    pub fn new(store: SledStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionRepository for SledSessionRepository {
    async fn save(&self, session: &Session) -> Result<(), RepositoryError> {
        self.store
            .put(SESSIONS_TREE, session.id.as_str(), session)
            .await
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        self.store.get(SESSIONS_TREE, id.as_str())
    }

    async fn find_by_state(&self, state: SessionState) -> Result<Vec<Session>, RepositoryError> {
        let sessions: Vec<Session> = self.store.list(SESSIONS_TREE)?;
        Ok(sessions.into_iter().filter(|s| s.state == state).collect())
    }

    async fn find_by_project(&self, project_id: &str) -> Result<Vec<Session>, RepositoryError> {
        let sessions: Vec<Session> = self.store.list(SESSIONS_TREE)?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.project_id == project_id)
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Session>, RepositoryError> {
        self.store.list(SESSIONS_TREE)
    }
}

pub struct SledAgentRepository {
    store: SledStore,
}

impl SledAgentRepository {
    pub fn new(store: SledStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AgentRepository for SledAgentRepository {
    async fn save(&self, record: &AgentRecord) -> Result<(), RepositoryError> {
        self.store
            .put(AGENTS_TREE, record.agent_id.as_str(), record)
            .await
    }

    async fn find_by_id(&self, id: &AgentId) -> Result<Option<AgentRecord>, RepositoryError> {
        self.store.get(AGENTS_TREE, id.as_str())
    }

    async fn list_all(&self) -> Result<Vec<AgentRecord>, RepositoryError> {
        self.store.list(AGENTS_TREE)
    }

    async fn delete(&self, id: &AgentId) -> Result<(), RepositoryError> {
        self.store.remove(AGENTS_TREE, id.as_str()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{agent_fn, AgentContext, AgentResult, AgentRuntimeState, AgentSpec};
    use crate::domain::session::SessionEvent;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_sessions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::from("session-durable");
        {
            let repo = SledSessionRepository::new(SledStore::open(dir.path()).unwrap());
            let mut session = Session::new(id.clone(), "proj", "ship it", "code");
            session.apply(SessionEvent::Start, HashMap::new());
            repo.save(&session).await.unwrap();
        }

        let repo = SledSessionRepository::new(SledStore::open(dir.path()).unwrap());
        let loaded = repo.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Working);
        assert_eq!(loaded.transitions.len(), 1);
        assert_eq!(repo.find_by_state(SessionState::Working).await.unwrap().len(), 1);
        assert!(repo.find_by_project("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agent_records_round_trip_and_delete() {
        let repo = SledAgentRepository::new(SledStore::temporary().unwrap());
        let factory = agent_fn(|_ctx: AgentContext| async move {
            Ok(AgentResult::success(serde_json::json!(null)))
        });
        let spec = AgentSpec::new("echo", factory).in_group("crew");
        let record = AgentRecord::from_parts(&spec, &AgentRuntimeState::new(spec.id.clone()));

        repo.save(&record).await.unwrap();
        let loaded = repo.find_by_id(&spec.id).await.unwrap().unwrap();
        assert_eq!(loaded.group.as_deref(), Some("crew"));
        assert_eq!(repo.list_all().await.unwrap().len(), 1);

        repo.delete(&spec.id).await.unwrap();
        assert!(repo.find_by_id(&spec.id).await.unwrap().is_none());
    }

    #[test]
    fn test_corrupt_value_is_serialization_error() {
        let store = SledStore::temporary().unwrap();
        store
            .db
            .open_tree(SESSIONS_TREE)
            .unwrap()
            .insert("bad", b"not json".to_vec())
            .unwrap();
        let result: Result<Option<Session>, _> = store.get(SESSIONS_TREE, "bad");
        assert!(matches!(result, Err(RepositoryError::Serialization(_))));
    }
}
