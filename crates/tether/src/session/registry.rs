//! Session registry.
//!
//! The registry is owned by the agent and injected into both the attach
//! server and the process launcher. A single lock guards the map itself;
//! each [`Session`] guards its own fields, so binding one session never
//! blocks lookups of another.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::liveness::Liveness;

use super::state::{ProcessControl, Session, SessionError, SessionId, SessionIo, SessionStatus};

/// Mapping from session id to session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    liveness: Option<Liveness>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry that reports session lifecycle changes.
    pub fn with_liveness(liveness: Liveness) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            liveness: Some(liveness),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a Pending session.
    pub fn register(&self, session: Session) -> Result<Arc<Session>, SessionError> {
        let session = Arc::new(session);
        {
            let mut sessions = self.write();
            if sessions.contains_key(session.id()) {
                return Err(SessionError::AlreadyRegistered(session.id().clone()));
            }
            sessions.insert(session.id().clone(), session.clone());
        }

        if let Some(liveness) = &self.liveness {
            session.report_to(liveness.clone());
            liveness.session_status(session.id(), SessionStatus::Pending);
        }
        tracing::info!(
            session_id = %session.id(),
            tty = session.is_tty(),
            attachable = session.config().attachable,
            run_block = session.config().run_block,
            "Session registered"
        );
        Ok(session)
    }

    /// Looks up a session.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.read().get(id).cloned()
    }

    /// All registered ids, whatever their status. Sorted for stable output.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Hands the started process's I/O to its session.
    pub async fn notify_started(
        &self,
        id: &str,
        io: SessionIo,
        control: Option<Arc<dyn ProcessControl>>,
    ) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.start(io, control).await?;

        if let Some(liveness) = &self.liveness {
            liveness.session_started(id);
        }
        Ok(())
    }

    /// Records a process exit.
    pub fn notify_exited(&self, id: &str, exit_code: Option<i32>) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.mark_exited(exit_code);

        if let Some(liveness) = &self.liveness {
            liveness.session_exited(id, exit_code);
        }
        Ok(())
    }

    /// Removes an exited session.
    pub fn remove(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.write();
        let session = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.status() != SessionStatus::Exited {
            return Err(SessionError::StillRunning(id.to_string()));
        }

        let session = sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        tracing::info!(session_id = %id, "Session removed");
        Ok(session)
    }
}
