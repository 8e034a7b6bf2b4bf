//! Session tracking
//!
//! The server's registry of live client sessions: admission against the
//! configured capacity, lifecycle phase, and graceful drain on shutdown.

mod registry;
mod state;

pub use registry::SessionRegistry;
pub use state::{SessionEntry, SessionId, SessionInfo, SessionPhase};
