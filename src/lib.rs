//! quictun - TCP/UDP forwarding over one multiplexed session
//!
//! A client and a server exchange forwarding rules over a secure QUIC
//! session, then carry byte streams and UDP datagrams as virtual channels
//! of that session. The tunnel fabric is transport-agnostic: anything
//! implementing [`session::TransportSession`] can carry it.

pub mod access;
pub mod client;
pub mod config;
pub mod connection;
pub mod forward;
pub mod handshake;
pub mod metrics;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod spec;
pub mod tunnel;
pub mod udp;
pub mod util;

pub use client::Client;
pub use server::Server;
pub use spec::ForwardSpec;
pub use tunnel::TunnelManager;

/// Version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
