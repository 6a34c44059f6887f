// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the aggregates owned by this crate. The in-memory
//! maps held by each service are the working copy; repositories receive a
//! write-behind copy after every mutation and are read back on rehydration.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `SessionRepository` | `Session` | `InMemorySessionRepository`, `SledSessionRepository` |
//! | `AgentRepository` | `AgentRecord` | `InMemoryAgentRepository`, `SledAgentRepository` |

use async_trait::async_trait;

use crate::domain::agent::{AgentId, AgentRecord};
use crate::domain::session::{Session, SessionId, SessionState};

/// Storage backend selected at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    Sled { path: std::path::PathBuf },
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Save session (create or update)
    async fn save(&self, session: &Session) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;

    async fn find_by_state(&self, state: SessionState) -> Result<Vec<Session>, RepositoryError>;

    async fn find_by_project(&self, project_id: &str) -> Result<Vec<Session>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Session>, RepositoryError>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Save agent record (create or update)
    async fn save(&self, record: &AgentRecord) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &AgentId) -> Result<Option<AgentRecord>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<AgentRecord>, RepositoryError>;

    async fn delete(&self, id: &AgentId) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for RepositoryError {
    fn from(err: sled::Error) -> Self {
        RepositoryError::Database(err.to_string())
    }
}
