//! Forwarders
//!
//! One forwarder realizes one listening rule: it binds locally and relays
//! every accepted connection (or datagram flow) through the session.

mod forwarder;
pub mod pipe;
pub mod socks;

pub use forwarder::Forwarder;
pub use pipe::Traffic;

use std::io;
use thiserror::Error;

use crate::metrics::METRICS;
use crate::session::SessionError;
use crate::tunnel::WaitError;
use crate::udp::RecordError;

/// Forwarding failures, scoped to one forwarder or one connection
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to listen on {addr}: {source}")]
    Listen { addr: String, source: io::Error },

    #[error("failed to dial {addr}: {source}")]
    Dial { addr: String, source: io::Error },

    #[error("rule '{0}' has no remote target")]
    NoTarget(String),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("socks: {0}")]
    Socks(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ForwardError {
    /// End-of-stream or shutdown, not a fault
    pub fn is_benign(&self) -> bool {
        match self {
            ForwardError::Wait(WaitError::Cancelled) => true,
            ForwardError::Session(e) => e.is_benign(),
            ForwardError::Io(e) => crate::session::is_benign_io(e),
            _ => false,
        }
    }
}

/// `[open/total]` channel counts for log lines
pub fn channel_stats() -> String {
    let snapshot = METRICS.snapshot();
    format!(
        "[{}/{}]",
        snapshot
            .channels_opened
            .saturating_sub(snapshot.channels_closed),
        snapshot.channels_opened
    )
}
