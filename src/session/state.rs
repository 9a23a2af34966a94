//! Session State Management
//!
//! Lifecycle status of one session.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Engine not inited yet
    #[default]
    Uninitialized,
    /// Engine init in progress
    Initializing,
    /// Accepting operations
    Ready,
    /// Teardown in progress
    Destroying,
    /// Engine stopped and local state released
    Destroyed,
    /// Engine init failed
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Destroying => write!(f, "destroying"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl SessionStatus {
    /// Check if session can accept operations
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if session is terminal (finished)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }
}

/// Complete state of a single session
#[derive(Debug)]
pub struct SessionState {
    /// Session ID (assigned by the engine)
    pub id: Uuid,
    /// Current status
    pub status: SessionStatus,
    /// Engine type name
    pub engine: String,
    /// Session creation time
    pub created_at: DateTime<Utc>,
    /// Last operation submitted
    pub last_activity: DateTime<Utc>,
    /// Error message if failed
    pub error_message: Option<String>,
    /// Engine debug mode
    pub debug: bool,
}

impl SessionState {
    pub fn new(id: Uuid, engine: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: SessionStatus::Uninitialized,
            engine: engine.into(),
            created_at: now,
            last_activity: now,
            error_message: None,
            debug: false,
        }
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            debug!("Session {}: {} -> {}", self.id, self.status, status);
        }
        self.status = status;
        self.last_activity = Utc::now();
    }

    /// Mark session as failed with error
    pub fn set_failed(&mut self, error: impl Into<String>) {
        self.error_message = Some(error.into());
        self.set_status(SessionStatus::Failed);
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Get session duration in seconds
    pub fn duration_secs(&self) -> i64 {
        (self.last_activity - self.created_at).num_seconds()
    }
}

/// Serializable session snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session ID
    pub id: Uuid,
    /// Current status
    pub status: SessionStatus,
    /// Engine type name
    pub engine: String,
    /// Creation time (RFC 3339)
    pub created_at: String,
    /// Last activity time (RFC 3339)
    pub last_activity: String,
    /// Error message if failed
    pub error_message: Option<String>,
    /// Engine debug mode
    pub debug: bool,
    /// Operations in flight
    pub operations: usize,
    /// Session age in seconds
    pub duration_secs: i64,
}

impl SessionInfo {
    pub fn new(state: &SessionState, operations: usize) -> Self {
        Self {
            id: state.id,
            status: state.status,
            engine: state.engine.clone(),
            created_at: state.created_at.to_rfc3339(),
            last_activity: state.last_activity.to_rfc3339(),
            error_message: state.error_message.clone(),
            debug: state.debug,
            operations,
            duration_secs: state.duration_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_creation() {
        let state = SessionState::new(Uuid::new_v4(), "local");
        assert_eq!(state.status, SessionStatus::Uninitialized);
        assert!(!state.status.is_active());
        assert!(!state.status.is_terminal());
    }

    #[test]
    fn test_session_status_transitions() {
        let mut state = SessionState::new(Uuid::new_v4(), "local");
        state.set_status(SessionStatus::Initializing);
        state.set_status(SessionStatus::Ready);
        assert!(state.status.is_active());

        state.set_status(SessionStatus::Destroyed);
        assert!(state.status.is_terminal());

        let mut failed = SessionState::new(Uuid::new_v4(), "local");
        failed.set_failed("init error");
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("init error"));
    }

    #[test]
    fn test_info_serialization() {
        let state = SessionState::new(Uuid::new_v4(), "local");
        let info = SessionInfo::new(&state, 2);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], "uninitialized");
        assert_eq!(json["operations"], 2);
    }
}
