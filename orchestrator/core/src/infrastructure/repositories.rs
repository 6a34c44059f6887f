// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-memory repository implementations, used by tests and by the daemon when
//! no storage path is configured.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::agent::{AgentId, AgentRecord};
use crate::domain::repository::{AgentRepository, RepositoryError, SessionRepository};
use crate::domain::session::{Session, SessionId, SessionState};

#[derive(Clone, Default)]
pub struct InMemorySessionRepository {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn save(&self, session: &Session) -> Result<(), RepositoryError> {
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn find_by_state(&self, state: SessionState) -> Result<Vec<Session>, RepositoryError> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect())
    }

    async fn find_by_project(&self, project_id: &str) -> Result<Vec<Session>, RepositoryError> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Session>, RepositoryError> {
        Ok(self.sessions.read().values().cloned().collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAgentRepository {
    agents: Arc<RwLock<HashMap<AgentId, AgentRecord>>>,
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn save(&self, record: &AgentRecord) -> Result<(), RepositoryError> {
        self.agents
            .write()
            .insert(record.agent_id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &AgentId) -> Result<Option<AgentRecord>, RepositoryError> {
        Ok(self.agents.read().get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<AgentRecord>, RepositoryError> {
        Ok(self.agents.read().values().cloned().collect())
    }

    async fn delete(&self, id: &AgentId) -> Result<(), RepositoryError> {
        self.agents.write().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_queries() {
        let repo = InMemorySessionRepository::new();
        let mut working = Session::new(SessionId::from("s1"), "alpha", "build", "code");
        working.state = SessionState::Working;
        repo.save(&working).await.unwrap();
        repo.save(&Session::new(SessionId::from("s2"), "beta", "test", "code"))
            .await
            .unwrap();

        assert_eq!(repo.list_all().await.unwrap().len(), 2);
        assert_eq!(repo.find_by_project("alpha").await.unwrap().len(), 1);
        let idle = repo.find_by_state(SessionState::Idle).await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, SessionId::from("s2"));
    }
}
