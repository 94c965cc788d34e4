//! # Session Registry
//!
//! Tracks every active voice session and enforces the concurrent-session
//! limit. The capacity check happens before any session state is allocated,
//! so a full gateway rejects new connections without partially constructing
//! anything. A background sweep closes sessions idle past the configured
//! timeout so abandoned connections release their slots.

use crate::error::{GatewayError, GatewayResult};
use crate::session::voice::{SessionConfig, SessionStatus, VoiceSession};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SharedSession = Arc<RwLock<VoiceSession>>;

/// Registry of active sessions with a hard concurrency limit.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedSession>>,
    max_concurrent: usize,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_concurrent: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent,
            idle_timeout,
        }
    }

    /// Create and register a new session.
    ///
    /// Capacity is checked under the same lock that inserts, so concurrent
    /// connection attempts cannot overshoot the limit.
    pub fn create(&self, config: SessionConfig) -> GatewayResult<SharedSession> {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.len() >= self.max_concurrent {
            warn!(
                limit = self.max_concurrent,
                "Rejecting session: concurrency limit reached"
            );
            return Err(GatewayError::CapacityExceeded {
                limit: self.max_concurrent,
            });
        }

        let id = Uuid::new_v4().to_string();
        let session = Arc::new(RwLock::new(VoiceSession::new(id.clone(), config)?));
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(session_id = %id, active = sessions.len(), "Session registered");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    /// Close a session and release its slot.
    pub fn terminate(&self, id: &str) -> GatewayResult<()> {
        let session = self
            .sessions
            .write()
            .unwrap()
            .remove(id)
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        session.write().unwrap().close();
        info!(session_id = %id, "Session terminated");
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.max_concurrent
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .map(|s| s.read().unwrap().status())
            .collect()
    }

    pub fn status_of(&self, id: &str) -> GatewayResult<SessionStatus> {
        let session = self
            .get(id)
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        let status = session.read().unwrap().status();
        Ok(status)
    }

    /// Close and remove every session idle past the timeout. Returns how
    /// many were swept.
    pub fn sweep_idle(&self) -> usize {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .filter(|(_, s)| s.read().unwrap().idle_for() >= self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &expired {
            if let Some(session) = self.sessions.write().unwrap().remove(id) {
                session.write().unwrap().close();
                debug!(session_id = %id, "Swept idle session");
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Idle session sweep completed");
        }
        expired.len()
    }
}

/// Run the idle sweep on a fixed cadence until the process exits.
pub fn spawn_idle_sweeper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.sweep_idle();
        }
    })
}
