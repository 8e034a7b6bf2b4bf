//! Session handshake
//!
//! The client sends its rule set as the first control request; the server
//! validates it and answers before anything else runs on the session.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::session::{IncomingRequest, Reply, SessionError, SessionHandle};
use crate::spec::{encode_all, ForwardSpec};
use crate::tunnel::TunnelError;

/// Name of the rule-set request
pub const CONFIG_REQUEST: &str = "config";

/// Liveness probe request and its expected reply payload
pub const PING_REQUEST: &str = "ping";
pub const PONG_REPLY: &[u8] = b"pong";

/// Protocol version advertised in the handshake
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Handshake payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub version: String,
    #[serde(default)]
    pub remotes: Vec<String>,
}

impl HandshakeConfig {
    pub fn new(specs: &[ForwardSpec]) -> Self {
        Self {
            version: VERSION.to_string(),
            remotes: encode_all(specs),
        }
    }
}

/// Send the rule set and wait for the server's verdict
pub async fn send_config(
    session: &SessionHandle,
    specs: &[ForwardSpec],
    timeout: Duration,
) -> Result<(), TunnelError> {
    let payload = serde_json::to_vec(&HandshakeConfig::new(specs))
        .map_err(|e| TunnelError::Handshake(e.to_string()))?;

    let reply = tokio::time::timeout(timeout, session.request(CONFIG_REQUEST, Bytes::from(payload)))
        .await
        .map_err(|_| TunnelError::Session(SessionError::Timeout))??;

    if !reply.ok {
        return Err(TunnelError::Rejected(reply.text()));
    }
    debug!(rules = specs.len(), "Handshake accepted");
    Ok(())
}

/// Wait for the peer's rule set
///
/// The returned request must be answered by the caller once the rules have
/// been checked. Malformed handshakes are answered here.
pub async fn receive_config(
    session: &SessionHandle,
    timeout: Duration,
) -> Result<(HandshakeConfig, IncomingRequest), TunnelError> {
    let request = tokio::time::timeout(timeout, session.accept_request())
        .await
        .map_err(|_| TunnelError::Handshake("timed out waiting for config".into()))?
        .ok_or(TunnelError::Session(SessionError::Closed))?;

    if request.name != CONFIG_REQUEST {
        let reason = format!("expected '{}' request, got '{}'", CONFIG_REQUEST, request.name);
        request.respond(Reply::fail(reason.clone()));
        return Err(TunnelError::Handshake(reason));
    }

    let config: HandshakeConfig = match serde_json::from_slice(&request.payload) {
        Ok(config) => config,
        Err(e) => {
            let reason = format!("invalid config: {}", e);
            request.respond(Reply::fail(reason.clone()));
            return Err(TunnelError::Handshake(reason));
        }
    };

    if config.version != VERSION {
        warn!(
            peer = %session.identity(),
            client = %config.version,
            server = VERSION,
            "Version mismatch"
        );
    }
    Ok((config, request))
}
