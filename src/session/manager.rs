//! Session Manager
//!
//! Lock-free concurrent session management using DashMap.
//! Sessions are fully independent; one of them may be marked active.

use dashmap::DashMap;
use log::{error, info};
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

use super::controller::Session;
use super::state::SessionInfo;
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::native::NativeEngine;

/// Session Manager - holds many concurrent sessions
pub struct SessionManager {
    sessions: Arc<DashMap<Uuid, Arc<Session>>>,
    active: RwLock<Option<Uuid>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            active: RwLock::new(None),
            config,
        }
    }

    /// Create a session on `engine`. A failed init never reaches the manager.
    pub async fn create_session(&self, engine: Arc<dyn NativeEngine>) -> SessionResult<Arc<Session>> {
        if self.sessions.len() >= self.config.max_sessions {
            self.cleanup_terminal_sessions();
            if self.sessions.len() >= self.config.max_sessions {
                return Err(SessionError::MaxSessionsReached(self.config.max_sessions));
            }
        }
        if self.sessions.contains_key(&engine.uuid()) {
            return Err(SessionError::Exists(engine.uuid()));
        }

        let session = Arc::new(Session::create(engine, self.config.clone()).await?);
        self.sessions.insert(session.uuid(), session.clone());
        info!("Created session: {}", session.uuid());
        Ok(session)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    /// Mark a session as the active one
    pub fn set_active(&self, id: Uuid) -> SessionResult<()> {
        if !self.sessions.contains_key(&id) {
            return Err(SessionError::NotFound(id));
        }
        *self.active.write() = Some(id);
        Ok(())
    }

    /// Currently active session
    pub fn active(&self) -> SessionResult<Arc<Session>> {
        let id = (*self.active.read()).ok_or(SessionError::Unavailable)?;
        self.get(id).ok_or(SessionError::NotFound(id))
    }

    /// Destroy a session and forget it
    pub async fn destroy_session(&self, id: Uuid) -> SessionResult<()> {
        let (_, session) = self.sessions.remove(&id).ok_or(SessionError::NotFound(id))?;
        {
            let mut active = self.active.write();
            if *active == Some(id) {
                *active = None;
            }
        }
        session.destroy().await
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Forget sessions that are already destroyed or failed
    pub fn cleanup_terminal_sessions(&self) -> usize {
        let terminal: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| s.status().is_terminal())
            .map(|s| *s.key())
            .collect();
        for id in &terminal {
            self.sessions.remove(id);
        }
        terminal.len()
    }

    /// Shutdown all sessions - for cleanup on exit
    pub async fn shutdown_all(&self) {
        info!("Shutting down all sessions...");

        let ids: Vec<Uuid> = self.sessions.iter().map(|s| *s.key()).collect();
        for id in ids {
            if let Err(e) = self.destroy_session(id).await {
                error!("Error destroying session {}: {}", id, e);
            }
        }

        info!("All sessions shut down");
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
