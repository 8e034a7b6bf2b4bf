//! Per-session state

use std::net::SocketAddr;
use std::time::Instant;

use crate::session::SessionHandle;

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Transport up, waiting for the rule set
    Handshaking,
    /// Rule set accepted, forwarding
    Active,
    /// Server shutting down
    Draining,
}

/// Registry entry for one client session
pub struct SessionEntry {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub phase: SessionPhase,
    pub connected_at: Instant,
    /// Accepted rules in canonical form
    pub rules: Vec<String>,
    /// Set once the transport session exists
    pub session: Option<SessionHandle>,
}

impl SessionEntry {
    pub fn new(id: SessionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            phase: SessionPhase::Handshaking,
            connected_at: Instant::now(),
            rules: Vec::new(),
            session: None,
        }
    }

    pub fn set_active(&mut self, rules: Vec<String>) {
        self.phase = SessionPhase::Active;
        self.rules = rules;
    }

    pub fn set_draining(&mut self) {
        self.phase = SessionPhase::Draining;
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.to_string(),
            peer: self.peer.to_string(),
            phase: format!("{:?}", self.phase),
            duration_secs: self.duration().as_secs_f64(),
            rules: self.rules.clone(),
        }
    }
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("phase", &self.phase)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

/// Session summary for reporting
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session ID (hex string)
    pub id: String,
    pub peer: String,
    pub phase: String,
    pub duration_secs: f64,
    pub rules: Vec<String>,
}
