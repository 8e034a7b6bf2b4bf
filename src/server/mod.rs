//! Server implementation
//!
//! QUIC listener, per-session handshake validation, and the per-session
//! tunnel that runs the client's reverse rules.

mod acceptor;
mod listener;

pub use acceptor::SessionHandler;
pub use listener::Server;

use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::access::AccessPolicy;
use crate::config::{ServerFileConfig, TunnelConfig};
use crate::handshake;
use crate::session::{Reply, SessionHandle};
use crate::spec::ForwardSpec;
use crate::tunnel::{InboundRules, TunnelError, TunnelManager};

/// What the server lets its clients do
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    /// Clients may ask for listeners on the server
    pub reverse: bool,
    /// Clients may use the server as a SOCKS5 egress
    pub socks5: bool,
    pub tunnel: TunnelConfig,
}

impl ServerSettings {
    pub fn from_config(config: &ServerFileConfig) -> Self {
        Self {
            reverse: config.server.reverse,
            socks5: config.server.socks5,
            tunnel: config.tunnel.resolve(),
        }
    }
}

/// Check one requested rule against the server's settings and policy
pub fn check_rule(
    spec: &ForwardSpec,
    settings: &ServerSettings,
    policy: &dyn AccessPolicy,
    identity: &str,
) -> Result<(), String> {
    if spec.reverse && !settings.reverse {
        return Err("reverse port forwarding not enabled on server".to_string());
    }
    if !spec.reverse && spec.socks && !settings.socks5 {
        return Err("SOCKS5 is not enabled on server".to_string());
    }
    let target = spec.access_target();
    if !policy.allow(identity, &target) {
        return Err(format!("access to '{}' denied", target));
    }
    if spec.reverse && !spec.can_listen() {
        return Err(format!("server cannot listen on {}", spec.local_addr()));
    }
    Ok(())
}

/// Receive the client's rule set and answer it
///
/// On rejection the reason is sent back and the session is closed.
pub async fn accept_rules(
    session: &SessionHandle,
    settings: &ServerSettings,
    policy: &dyn AccessPolicy,
) -> Result<Vec<ForwardSpec>, TunnelError> {
    let (config, request) =
        match handshake::receive_config(session, settings.tunnel.handshake_timeout).await {
            Ok(received) => received,
            Err(e) => {
                session.close("handshake failed");
                return Err(e);
            }
        };

    let verdict = config
        .remotes
        .iter()
        .map(|rule| {
            let spec = ForwardSpec::parse(rule).map_err(|e| e.to_string())?;
            check_rule(&spec, settings, policy, session.identity())?;
            Ok(spec)
        })
        .collect::<Result<Vec<_>, String>>();

    match verdict {
        Ok(specs) => {
            request.respond(Reply::ok(Bytes::new()));
            debug!(peer = %session.identity(), rules = specs.len(), "Rules accepted");
            Ok(specs)
        }
        Err(reason) => {
            info!(peer = %session.identity(), %reason, "Rules rejected");
            request.respond(Reply::fail(reason.clone()));
            session.close(&reason);
            Err(TunnelError::Rejected(reason))
        }
    }
}

/// Serve an accepted session: inbound channels plus the reverse listeners
pub async fn run_tunnel(
    session: SessionHandle,
    specs: Vec<ForwardSpec>,
    settings: &ServerSettings,
    policy: Arc<dyn AccessPolicy>,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let inbound = InboundRules {
        channels: true,
        socks: settings.socks5,
    };
    let tunnel = TunnelManager::new(settings.tunnel.clone(), policy, inbound);
    let reverse: Vec<ForwardSpec> = specs.into_iter().filter(|s| s.reverse).collect();
    tunnel.run_session_with(session, reverse, cancel).await
}

/// Handshake then serve, for transports that need no registry bookkeeping
pub async fn serve_session(
    session: SessionHandle,
    settings: &ServerSettings,
    policy: Arc<dyn AccessPolicy>,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let specs = accept_rules(&session, settings, policy.as_ref()).await?;
    run_tunnel(session, specs, settings, policy, cancel).await
}
