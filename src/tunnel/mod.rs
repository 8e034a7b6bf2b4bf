//! Tunnel management
//!
//! The [`TunnelManager`] owns at most one live session and hands it to
//! forwarders. Inbound channel requests from the peer are routed by
//! [`dispatch`].

pub mod dispatch;
mod manager;

pub use manager::{InboundRules, SessionState, TunnelManager};

use thiserror::Error;

use crate::session::SessionError;
use crate::spec::SpecError;

/// Session lifecycle failures
#[derive(Debug, Error)]
pub enum TunnelError {
    /// `bind` while a session is already live; a caller bug, never retried
    #[error("a session is already bound to this tunnel")]
    AlreadyBound,

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl TunnelError {
    /// Peer closed cleanly or the link was already gone
    pub fn is_benign(&self) -> bool {
        match self {
            TunnelError::Session(e) => e.is_benign(),
            _ => false,
        }
    }
}

/// Why `current_session` returned without a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("no session available")]
    Unavailable,

    #[error("cancelled while waiting for a session")]
    Cancelled,
}
