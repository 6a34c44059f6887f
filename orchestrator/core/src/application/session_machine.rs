// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session State Machine Service
//!
//! Owns the session table, validates every change against the transition
//! table in [`crate::domain::session`], persists write-behind, and announces
//! changes on the message bus.
//!
//! ## Topics
//!
//! | Topic | When |
//! |-------|------|
//! | `session.session_created` | a session is created |
//! | `session.state_changed` | any successful transition (payload carries the transition) |
//! | `session.state_<state>` | a transition lands in `<state>` |
//! | `session.pr_updated` | pull-request URL or CI status changed |
//! | `session.workspace_attached` / `session.workspace_detached` | workspace bound or released |
//!
//! Persistence failures never abort an operation: the in-memory table stays
//! authoritative and the failure is logged.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::message_bus::MessageBus;
use crate::domain::repository::{RepositoryError, SessionRepository};
use crate::domain::session::{
    BoardColumn, Session, SessionEvent, SessionId, SessionState, StateTransition, WorkspaceRef,
};

const SESSION_SOURCE: &str = "session_machine";
const DEFAULT_AGENT_TYPE: &str = "general";

pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),

    #[error("Invalid transition for session {session_id}: {state} + {event}")]
    InvalidTransition {
        session_id: SessionId,
        state: SessionState,
        event: SessionEvent,
    },
}

/// Parameters for a new session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    pub id: Option<SessionId>,
    pub project_id: String,
    pub goal: String,
    pub agent_type: Option<String>,
    #[serde(default)]
    pub context: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    pub by_state: BTreeMap<SessionState, usize>,
    pub active: usize,
}

/// Sessions grouped by dashboard column, most recently updated first.
pub type SessionBoard = BTreeMap<BoardColumn, Vec<Session>>;

pub struct SessionMachine {
    sessions: RwLock<HashMap<SessionId, Session>>,
    bus: MessageBus,
    repository: Option<Arc<dyn SessionRepository>>,
    /// Serializes saves so storage never ends on an older copy than the cache.
    persist_lock: tokio::sync::Mutex<()>,
}

impl SessionMachine {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            bus,
            repository: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn SessionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Fill the cache from the repository. Returns the number of sessions loaded.
    pub async fn load_all(&self) -> Result<usize, RepositoryError> {
        let Some(repository) = &self.repository else {
            return Ok(0);
        };
        let stored = repository.list_all().await?;
        let count = stored.len();
        let mut sessions = self.sessions.write();
        for session in stored {
            sessions.entry(session.id.clone()).or_insert(session);
        }
        info!(count, "Rehydrated sessions from storage");
        Ok(count)
    }

    pub async fn create_session(&self, new: NewSession) -> Result<Session, SessionError> {
        let id = new.id.unwrap_or_default();
        if self.get_session(&id).await.is_some() {
            return Err(SessionError::AlreadyExists(id));
        }

        let session = Session::new(
            id.clone(),
            new.project_id,
            new.goal,
            new.agent_type.unwrap_or_else(|| DEFAULT_AGENT_TYPE.to_string()),
        )
        .with_context(new.context);

        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                return Err(SessionError::AlreadyExists(id));
            }
            sessions.insert(id.clone(), session.clone());
        }

        info!(session_id = %id, project_id = %session.project_id, "Session created");
        self.persist(&session.id).await;
        self.emit("session_created", serde_json::json!({ "session": session }));
        Ok(session)
    }

    /// Return the session, creating it in `idle` on first use of the id.
    pub async fn ensure_session(
        &self,
        id: &SessionId,
        project_id: &str,
        goal: &str,
        agent_type: &str,
    ) -> Session {
        if let Some(existing) = self.get_session(id).await {
            return existing;
        }
        let new = NewSession {
            id: Some(id.clone()),
            project_id: project_id.to_string(),
            goal: goal.to_string(),
            agent_type: Some(agent_type.to_string()),
            context: Metadata::new(),
        };
        match self.create_session(new).await {
            Ok(session) => session,
            // Lost a creation race; the winner's copy is in the cache.
            Err(_) => self
                .sessions
                .write()
                .entry(id.clone())
                .or_insert_with(|| Session::new(id.clone(), project_id, goal, agent_type))
                .clone(),
        }
    }

    /// Cached session, falling back to the repository on a miss.
    pub async fn get_session(&self, id: &SessionId) -> Option<Session> {
        if let Some(session) = self.sessions.read().get(id) {
            return Some(session.clone());
        }

        let repository = self.repository.as_ref()?;
        match repository.find_by_id(id).await {
            Ok(Some(session)) => {
                debug!(session_id = %id, "Session loaded from storage");
                let mut sessions = self.sessions.write();
                Some(sessions.entry(id.clone()).or_insert(session).clone())
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to load session from storage");
                None
            }
        }
    }

    pub fn sessions_by_state(&self, state: SessionState) -> Vec<Session> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect()
    }

    pub fn sessions_by_project(&self, project_id: &str) -> Vec<Session> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect()
    }

    pub async fn can_transition(&self, id: &SessionId, event: SessionEvent) -> bool {
        self.get_session(id)
            .await
            .is_some_and(|session| session.can_apply(event))
    }

    /// Apply `event` to the session. Invalid events leave it untouched.
    pub async fn transition(
        &self,
        id: &SessionId,
        event: SessionEvent,
        metadata: Metadata,
    ) -> Result<Session, SessionError> {
        if self.get_session(id).await.is_none() {
            warn!(session_id = %id, event = %event, "Transition on unknown session");
            return Err(SessionError::NotFound(id.clone()));
        }

        let (session, transition) = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;

            let state = session.state;
            let Some(transition) = session.apply(event, metadata) else {
                warn!(session_id = %id, state = %state, event = %event, "Invalid transition");
                return Err(SessionError::InvalidTransition {
                    session_id: id.clone(),
                    state,
                    event,
                });
            };
            (session.clone(), transition)
        };

        info!(
            session_id = %id,
            from = %transition.from_state,
            to = %transition.to_state,
            event = %event,
            "Session transitioned"
        );

        self.persist(&session.id).await;
        self.emit(
            "state_changed",
            serde_json::json!({ "session": session, "transition": transition }),
        );
        self.emit(
            &format!("state_{}", transition.to_state),
            serde_json::json!({ "session": session }),
        );
        Ok(session)
    }

    pub async fn start(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.transition(id, SessionEvent::Start, Metadata::new()).await
    }

    pub async fn request_approval(
        &self,
        id: &SessionId,
        reason: Option<&str>,
    ) -> Result<Session, SessionError> {
        self.transition(
            id,
            SessionEvent::ApprovalRequested,
            metadata("approval_reason", reason),
        )
        .await
    }

    pub async fn grant_approval(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.transition(id, SessionEvent::ApprovalGranted, Metadata::new())
            .await
    }

    pub async fn deny_approval(
        &self,
        id: &SessionId,
        reason: Option<&str>,
    ) -> Result<Session, SessionError> {
        self.transition(
            id,
            SessionEvent::ApprovalDenied,
            metadata("denial_reason", reason),
        )
        .await
    }

    pub async fn complete(
        &self,
        id: &SessionId,
        result: Option<serde_json::Value>,
    ) -> Result<Session, SessionError> {
        let mut meta = Metadata::new();
        meta.insert(
            "result".to_string(),
            result.clone().unwrap_or(serde_json::Value::Null),
        );
        let session = self.transition(id, SessionEvent::Complete, meta).await?;
        match result {
            Some(result) => self.set_result(id, result).await,
            None => Ok(session),
        }
    }

    pub async fn fail(&self, id: &SessionId, error: Option<&str>) -> Result<Session, SessionError> {
        let session = self
            .transition(id, SessionEvent::Error, metadata("error", error))
            .await?;
        match error {
            Some(error) => self.set_error(id, error).await,
            None => Ok(session),
        }
    }

    pub async fn pause(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.transition(id, SessionEvent::Pause, Metadata::new()).await
    }

    pub async fn resume(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.transition(id, SessionEvent::Resume, Metadata::new()).await
    }

    pub async fn update_pr_status(
        &self,
        id: &SessionId,
        pr_url: &str,
        ci_status: Option<&str>,
    ) -> Result<Session, SessionError> {
        let session = self
            .update(id, |s| {
                s.pr_url = Some(pr_url.to_string());
                s.ci_status = ci_status.map(str::to_string);
            })
            .await?;
        self.emit("pr_updated", serde_json::json!({ "session": session }));
        Ok(session)
    }

    pub async fn update_summary(&self, id: &SessionId, summary: &str) -> Result<Session, SessionError> {
        self.update(id, |s| s.summary = Some(summary.to_string()))
            .await
    }

    pub async fn attach_workspace(
        &self,
        id: &SessionId,
        workspace: WorkspaceRef,
    ) -> Result<Session, SessionError> {
        let session = self
            .update(id, |s| s.workspace = Some(workspace.clone()))
            .await?;
        self.emit("workspace_attached", serde_json::json!({ "session": session }));
        Ok(session)
    }

    pub async fn detach_workspace(&self, id: &SessionId) -> Result<Session, SessionError> {
        let session = self.update(id, |s| s.workspace = None).await?;
        self.emit("workspace_detached", serde_json::json!({ "session": session }));
        Ok(session)
    }

    pub async fn set_result(
        &self,
        id: &SessionId,
        result: serde_json::Value,
    ) -> Result<Session, SessionError> {
        self.update(id, |s| s.result = Some(result.clone())).await
    }

    pub async fn set_error(&self, id: &SessionId, error: &str) -> Result<Session, SessionError> {
        self.update(id, |s| s.error = Some(error.to_string())).await
    }

    /// Sessions per dashboard column, newest activity first. Every column is present.
    pub fn board(&self) -> SessionBoard {
        let mut board: SessionBoard = BoardColumn::ALL.iter().map(|c| (*c, Vec::new())).collect();
        for session in self.sessions.read().values() {
            board
                .entry(session.board_column())
                .or_default()
                .push(session.clone());
        }
        for column in board.values_mut() {
            column.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        }
        board
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read();
        let mut by_state = BTreeMap::new();
        for session in sessions.values() {
            *by_state.entry(session.state).or_insert(0) += 1;
        }
        let active = by_state
            .iter()
            .filter(|(state, _)| state.is_active())
            .map(|(_, count)| *count)
            .sum();

        SessionStats {
            total: sessions.len(),
            by_state,
            active,
        }
    }

    /// Sessions touched since `since`, oldest first.
    pub fn updated_since(&self, since: DateTime<Utc>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.updated_at >= since)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.updated_at);
        sessions
    }

    async fn update<F>(&self, id: &SessionId, mutate: F) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session),
    {
        if self.get_session(id).await.is_none() {
            return Err(SessionError::NotFound(id.clone()));
        }

        let session = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            mutate(session);
            session.touch();
            session.clone()
        };

        self.persist(&session.id).await;
        Ok(session)
    }

    /// Save the cached copy of `id`. The copy is read after taking the save
    /// lock, so the last save always writes the latest state.
    async fn persist(&self, id: &SessionId) {
        let Some(repository) = &self.repository else {
            return;
        };
        let _ordered = self.persist_lock.lock().await;
        let Some(session) = self.sessions.read().get(id).cloned() else {
            return;
        };
        if let Err(e) = repository.save(&session).await {
            warn!(session_id = %id, error = %e, "Failed to persist session, keeping in-memory copy");
        }
    }

    fn emit(&self, event: &str, payload: serde_json::Value) {
        self.bus
            .publish(&format!("session.{event}"), payload, Some(SESSION_SOURCE));
    }
}

fn metadata(key: &str, value: Option<&str>) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert(
        key.to_string(),
        value.map_or(serde_json::Value::Null, |v| serde_json::Value::String(v.to_string())),
    );
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::InMemorySessionRepository;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FailingSessionRepository;

    #[async_trait]
    impl SessionRepository for FailingSessionRepository {
        async fn save(&self, _session: &Session) -> Result<(), RepositoryError> {
            Err(RepositoryError::Database("disk full".to_string()))
        }
        async fn find_by_id(&self, _id: &SessionId) -> Result<Option<Session>, RepositoryError> {
            Err(RepositoryError::Database("offline".to_string()))
        }
        async fn find_by_state(&self, _state: SessionState) -> Result<Vec<Session>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn find_by_project(&self, _project_id: &str) -> Result<Vec<Session>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn list_all(&self) -> Result<Vec<Session>, RepositoryError> {
            Ok(Vec::new())
        }
    }

    fn new_session(id: &str) -> NewSession {
        NewSession {
            id: Some(SessionId::from(id)),
            project_id: "proj".to_string(),
            goal: "ship it".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_approval_round_trip_scenario() {
        let machine = SessionMachine::new(MessageBus::default());
        let id = SessionId::from("S");
        machine.create_session(new_session("S")).await.unwrap();

        let err = machine
            .transition(&id, SessionEvent::ApprovalRequested, Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
        let unchanged = machine.get_session(&id).await.unwrap();
        assert_eq!(unchanged.state, SessionState::Idle);
        assert!(unchanged.transitions.is_empty());

        assert_eq!(machine.start(&id).await.unwrap().state, SessionState::Working);
        assert_eq!(
            machine.request_approval(&id, Some("deploy")).await.unwrap().state,
            SessionState::WaitingForApproval
        );
        let denied = machine.deny_approval(&id, Some("not now")).await.unwrap();
        assert_eq!(denied.state, SessionState::Idle);
        assert_eq!(denied.transitions.len(), 3);
        assert_eq!(denied.context["denial_reason"], "not now");
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_sessions() {
        let machine = SessionMachine::new(MessageBus::default());
        let missing = SessionId::from("missing");
        assert!(matches!(
            machine.start(&missing).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(!machine.can_transition(&missing, SessionEvent::Start).await);

        machine.create_session(new_session("dup")).await.unwrap();
        assert!(matches!(
            machine.create_session(new_session("dup")).await,
            Err(SessionError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_publishes_events() {
        let bus = MessageBus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("session.*", move |msg| {
            let _ = tx.send(msg.topic);
            async { Ok(None) }
        });

        let machine = SessionMachine::new(bus);
        let id = SessionId::from("evt");
        machine.create_session(new_session("evt")).await.unwrap();
        machine.start(&id).await.unwrap();

        let mut topics = Vec::new();
        for _ in 0..3 {
            let topic = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            topics.push(topic);
        }
        assert_eq!(
            topics,
            vec![
                "session.session_created".to_string(),
                "session.state_changed".to_string(),
                "session.state_working".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_terminal_states_allow_restart() {
        let machine = SessionMachine::new(MessageBus::default());
        let id = SessionId::from("retry");
        machine.create_session(new_session("retry")).await.unwrap();
        machine.start(&id).await.unwrap();
        let failed = machine.fail(&id, Some("boom")).await.unwrap();
        assert_eq!(failed.state, SessionState::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        assert!(machine.can_transition(&id, SessionEvent::Start).await);
        assert!(!machine.can_transition(&id, SessionEvent::Complete).await);
        machine.start(&id).await.unwrap();
        let done = machine
            .complete(&id, Some(serde_json::json!({"pr": 7})))
            .await
            .unwrap();
        assert_eq!(done.state, SessionState::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"pr": 7})));
    }

    #[tokio::test]
    async fn test_collaborator_fields() {
        let machine = SessionMachine::new(MessageBus::default());
        let id = SessionId::from("collab");
        machine.create_session(new_session("collab")).await.unwrap();

        machine
            .update_pr_status(&id, "https://git.example/pr/1", Some("passing"))
            .await
            .unwrap();
        machine.update_summary(&id, "Refactored parser").await.unwrap();
        let attached = machine
            .attach_workspace(
                &id,
                WorkspaceRef {
                    id: "wt-1".to_string(),
                    path: "/tmp/wt-1".to_string(),
                    branch: "feature/parser".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(attached.pr_url.as_deref(), Some("https://git.example/pr/1"));
        assert_eq!(attached.ci_status.as_deref(), Some("passing"));
        assert_eq!(attached.summary.as_deref(), Some("Refactored parser"));
        assert_eq!(attached.workspace.as_ref().unwrap().branch, "feature/parser");
        assert_eq!(attached.state, SessionState::Idle);

        let detached = machine.detach_workspace(&id).await.unwrap();
        assert!(detached.workspace.is_none());
    }

    #[tokio::test]
    async fn test_board_and_stats() {
        let machine = SessionMachine::new(MessageBus::default());
        for id in ["a", "b", "c", "d"] {
            machine.create_session(new_session(id)).await.unwrap();
        }
        let (a, b, c) = (SessionId::from("a"), SessionId::from("b"), SessionId::from("c"));
        machine.start(&a).await.unwrap();
        machine.start(&b).await.unwrap();
        machine.pause(&b).await.unwrap();
        machine.start(&c).await.unwrap();
        machine.request_approval(&c, None).await.unwrap();

        let board = machine.board();
        assert_eq!(board.len(), BoardColumn::ALL.len());
        assert_eq!(board[&BoardColumn::Working].len(), 1);
        assert_eq!(board[&BoardColumn::Waiting].len(), 1);
        assert_eq!(board[&BoardColumn::NeedsApproval].len(), 1);
        assert_eq!(board[&BoardColumn::Idle].len(), 1);

        let stats = machine.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.by_state[&SessionState::Paused], 1);
        assert_eq!(machine.sessions_by_project("proj").len(), 4);
        assert_eq!(machine.sessions_by_state(SessionState::Working).len(), 1);
    }

    #[tokio::test]
    async fn test_rehydration_from_repository() {
        let repo = Arc::new(InMemorySessionRepository::new());
        let first = SessionMachine::new(MessageBus::default()).with_repository(repo.clone());
        let id = SessionId::from("persisted");
        first.create_session(new_session("persisted")).await.unwrap();
        first.start(&id).await.unwrap();

        let second = SessionMachine::new(MessageBus::default()).with_repository(repo.clone());
        let loaded = second.get_session(&id).await.unwrap();
        assert_eq!(loaded.state, SessionState::Working);
        assert_eq!(loaded.transitions.len(), 1);

        let third = SessionMachine::new(MessageBus::default()).with_repository(repo);
        assert_eq!(third.load_all().await.unwrap(), 1);
        assert_eq!(third.stats().total, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_memory() {
        let machine = SessionMachine::new(MessageBus::default())
            .with_repository(Arc::new(FailingSessionRepository));
        let id = SessionId::from("volatile");
        machine.create_session(new_session("volatile")).await.unwrap();
        let session = machine.start(&id).await.unwrap();
        assert_eq!(session.state, SessionState::Working);
    }

    /// Holds back saves of `working` sessions so a later save can overtake.
    struct SlowWorkingSaves {
        inner: InMemorySessionRepository,
    }

    #[async_trait]
    impl SessionRepository for SlowWorkingSaves {
        async fn save(&self, session: &Session) -> Result<(), RepositoryError> {
            if session.state == SessionState::Working {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.save(session).await
        }
        async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
            self.inner.find_by_id(id).await
        }
        async fn find_by_state(&self, state: SessionState) -> Result<Vec<Session>, RepositoryError> {
            self.inner.find_by_state(state).await
        }
        async fn find_by_project(&self, project_id: &str) -> Result<Vec<Session>, RepositoryError> {
            self.inner.find_by_project(project_id).await
        }
        async fn list_all(&self) -> Result<Vec<Session>, RepositoryError> {
            self.inner.list_all().await
        }
    }

    #[tokio::test]
    async fn test_concurrent_transitions_store_latest_state() {
        let repository = Arc::new(SlowWorkingSaves {
            inner: InMemorySessionRepository::new(),
        });
        let machine = SessionMachine::new(MessageBus::default()).with_repository(repository.clone());
        let id = SessionId::from("racy");
        machine.create_session(new_session("racy")).await.unwrap();

        let (started, paused) = tokio::join!(machine.start(&id), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            machine.pause(&id).await
        });
        assert_eq!(started.unwrap().state, SessionState::Working);
        assert_eq!(paused.unwrap().state, SessionState::Paused);

        let stored = repository.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Paused);
        assert_eq!(stored.transitions.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_session_creates_once() {
        let machine = SessionMachine::new(MessageBus::default());
        let id = SessionId::from("lazy");
        let first = machine.ensure_session(&id, "proj", "goal", "coder").await;
        machine.start(&id).await.unwrap();
        let second = machine.ensure_session(&id, "proj", "goal", "coder").await;
        assert_eq!(first.agent_type, "coder");
        assert_eq!(second.state, SessionState::Working);
    }
}
