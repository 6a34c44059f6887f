// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Aggregate
//!
//! A session is the durable record of one agent's work, advanced only through
//! the transition table below. `completed` and `failed` are terminal but accept
//! `start` so the same session id can run a fresh cycle.
//!
//! | From | Event | To |
//! |------|-------|----|
//! | idle | start, user_prompt | working |
//! | working | tool_request, tool_result | working |
//! | working | approval_requested | waiting_for_approval |
//! | working | input_requested | waiting_for_input |
//! | working | complete | completed |
//! | working | error, timeout | failed |
//! | working | pause | paused |
//! | waiting_for_approval | approval_granted | working |
//! | waiting_for_approval | approval_denied, timeout | idle |
//! | waiting_for_approval | error | failed |
//! | waiting_for_input | input_provided, user_prompt | working |
//! | waiting_for_input | timeout | idle |
//! | waiting_for_input | error | failed |
//! | paused | resume | working |
//! | paused | error | failed |
//! | completed, failed | start | working |
//!
//! Every other `(state, event)` pair is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(super::prefixed_id("session-", 8))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Working,
    WaitingForApproval,
    WaitingForInput,
    Paused,
    Completed,
    Failed,
}

impl SessionState {
    pub const ALL: [SessionState; 7] = [
        SessionState::Idle,
        SessionState::Working,
        SessionState::WaitingForApproval,
        SessionState::WaitingForInput,
        SessionState::Paused,
        SessionState::Completed,
        SessionState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Working => "working",
            SessionState::WaitingForApproval => "waiting_for_approval",
            SessionState::WaitingForInput => "waiting_for_input",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Counted as in-flight work on the dashboard.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Working
                | SessionState::WaitingForApproval
                | SessionState::WaitingForInput
        )
    }

    /// The transition table. `None` means the event is invalid in this state.
    pub fn next(&self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Idle, E::Start | E::UserPrompt) => Some(S::Working),

            (S::Working, E::ToolRequest | E::ToolResult) => Some(S::Working),
            (S::Working, E::ApprovalRequested) => Some(S::WaitingForApproval),
            (S::Working, E::InputRequested) => Some(S::WaitingForInput),
            (S::Working, E::Complete) => Some(S::Completed),
            (S::Working, E::Error | E::Timeout) => Some(S::Failed),
            (S::Working, E::Pause) => Some(S::Paused),

            (S::WaitingForApproval, E::ApprovalGranted) => Some(S::Working),
            (S::WaitingForApproval, E::ApprovalDenied | E::Timeout) => Some(S::Idle),
            (S::WaitingForApproval, E::Error) => Some(S::Failed),

            (S::WaitingForInput, E::InputProvided | E::UserPrompt) => Some(S::Working),
            (S::WaitingForInput, E::Timeout) => Some(S::Idle),
            (S::WaitingForInput, E::Error) => Some(S::Failed),

            (S::Paused, E::Resume) => Some(S::Working),
            (S::Paused, E::Error) => Some(S::Failed),

            (S::Completed | S::Failed, E::Start) => Some(S::Working),

            _ => None,
        }
    }

    pub fn board_column(&self) -> BoardColumn {
        match self {
            SessionState::Idle => BoardColumn::Idle,
            SessionState::Working => BoardColumn::Working,
            SessionState::WaitingForApproval => BoardColumn::NeedsApproval,
            SessionState::WaitingForInput | SessionState::Paused => BoardColumn::Waiting,
            SessionState::Completed => BoardColumn::Completed,
            SessionState::Failed => BoardColumn::Failed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Start,
    UserPrompt,
    ToolRequest,
    ToolResult,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalDenied,
    InputRequested,
    InputProvided,
    Complete,
    Error,
    Pause,
    Resume,
    Timeout,
}

impl SessionEvent {
    pub const ALL: [SessionEvent; 14] = [
        SessionEvent::Start,
        SessionEvent::UserPrompt,
        SessionEvent::ToolRequest,
        SessionEvent::ToolResult,
        SessionEvent::ApprovalRequested,
        SessionEvent::ApprovalGranted,
        SessionEvent::ApprovalDenied,
        SessionEvent::InputRequested,
        SessionEvent::InputProvided,
        SessionEvent::Complete,
        SessionEvent::Error,
        SessionEvent::Pause,
        SessionEvent::Resume,
        SessionEvent::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::Start => "start",
            SessionEvent::UserPrompt => "user_prompt",
            SessionEvent::ToolRequest => "tool_request",
            SessionEvent::ToolResult => "tool_result",
            SessionEvent::ApprovalRequested => "approval_requested",
            SessionEvent::ApprovalGranted => "approval_granted",
            SessionEvent::ApprovalDenied => "approval_denied",
            SessionEvent::InputRequested => "input_requested",
            SessionEvent::InputProvided => "input_provided",
            SessionEvent::Complete => "complete",
            SessionEvent::Error => "error",
            SessionEvent::Pause => "pause",
            SessionEvent::Resume => "resume",
            SessionEvent::Timeout => "timeout",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dashboard column a session is rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardColumn {
    Working,
    NeedsApproval,
    Waiting,
    Idle,
    Completed,
    Failed,
}

impl BoardColumn {
    pub const ALL: [BoardColumn; 6] = [
        BoardColumn::Working,
        BoardColumn::NeedsApproval,
        BoardColumn::Waiting,
        BoardColumn::Idle,
        BoardColumn::Completed,
        BoardColumn::Failed,
    ];
}

/// Immutable record of one applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: SessionState,
    pub to_state: SessionState,
    pub event: SessionEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Workspace (checkout, branch) a collaborator attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub id: String,
    pub path: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub project_id: String,
    pub goal: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub agent_type: String,
    pub pr_url: Option<String>,
    pub ci_status: Option<String>,
    pub summary: Option<String>,
    pub workspace: Option<WorkspaceRef>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Session {
    pub fn new(
        id: SessionId,
        project_id: impl Into<String>,
        goal: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id: project_id.into(),
            goal: goal.into(),
            state: SessionState::Idle,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
            context: HashMap::new(),
            agent_type: agent_type.into(),
            pr_url: None,
            ci_status: None,
            summary: None,
            workspace: None,
            result: None,
            error: None,
        }
    }

    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    pub fn can_apply(&self, event: SessionEvent) -> bool {
        self.state.next(event).is_some()
    }

    /// Apply `event`, recording the transition. On an invalid event the
    /// session is left untouched and `None` is returned.
    pub fn apply(
        &mut self,
        event: SessionEvent,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Option<StateTransition> {
        let to_state = self.state.next(event)?;
        let now = Utc::now();
        let transition = StateTransition {
            from_state: self.state,
            to_state,
            event,
            timestamp: now,
            metadata: metadata.clone(),
        };

        self.transitions.push(transition.clone());
        self.state = to_state;
        self.updated_at = now;
        self.context.extend(metadata);

        Some(transition)
    }

    pub fn board_column(&self) -> BoardColumn {
        self.state.board_column()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn duration(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_transitions() {
        use SessionEvent as E;
        use SessionState as S;

        assert_eq!(S::Idle.next(E::Start), Some(S::Working));
        assert_eq!(S::Working.next(E::ApprovalRequested), Some(S::WaitingForApproval));
        assert_eq!(S::WaitingForApproval.next(E::ApprovalDenied), Some(S::Idle));
        assert_eq!(S::Working.next(E::Error), Some(S::Failed));
        assert_eq!(S::Paused.next(E::Resume), Some(S::Working));
        assert_eq!(S::Completed.next(E::Start), Some(S::Working));
        assert_eq!(S::Failed.next(E::Start), Some(S::Working));
    }

    #[test]
    fn test_table_is_sparse() {
        let valid: usize = SessionState::ALL
            .iter()
            .map(|s| SessionEvent::ALL.iter().filter(|e| s.next(**e).is_some()).count())
            .sum();
        // 2 + 8 + 4 + 4 + 2 + 1 + 1
        assert_eq!(valid, 22);

        assert_eq!(SessionState::Idle.next(SessionEvent::ApprovalRequested), None);
        assert_eq!(SessionState::Completed.next(SessionEvent::Complete), None);
        assert_eq!(SessionState::Paused.next(SessionEvent::Pause), None);
    }

    #[test]
    fn test_invalid_apply_leaves_session_unchanged() {
        let mut session = Session::new(SessionId::from("s1"), "p", "goal", "general");
        let before = session.updated_at;
        assert!(session
            .apply(SessionEvent::ApprovalRequested, HashMap::new())
            .is_none());
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.transitions.is_empty());
        assert_eq!(session.updated_at, before);
    }

    #[test]
    fn test_apply_merges_metadata() {
        let mut session = Session::new(SessionId::from("s1"), "p", "goal", "general");
        let mut meta = HashMap::new();
        meta.insert("reason".to_string(), serde_json::json!("needs review"));

        session.apply(SessionEvent::Start, HashMap::new()).unwrap();
        let t = session.apply(SessionEvent::ApprovalRequested, meta).unwrap();

        assert_eq!(t.from_state, SessionState::Working);
        assert_eq!(t.to_state, SessionState::WaitingForApproval);
        assert_eq!(session.transitions.len(), 2);
        assert_eq!(session.context["reason"], "needs review");
    }

    #[test]
    fn test_board_columns() {
        assert_eq!(SessionState::Paused.board_column(), BoardColumn::Waiting);
        assert_eq!(SessionState::WaitingForInput.board_column(), BoardColumn::Waiting);
        assert_eq!(
            SessionState::WaitingForApproval.board_column(),
            BoardColumn::NeedsApproval
        );
        assert_eq!(SessionState::Idle.board_column(), BoardColumn::Idle);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&SessionState::WaitingForApproval).unwrap();
        assert_eq!(json, "\"waiting_for_approval\"");
        let event: SessionEvent = serde_json::from_str("\"approval_denied\"").unwrap();
        assert_eq!(event, SessionEvent::ApprovalDenied);
    }
}
