//! Connection acceptor and handler
//!
//! Handles individual QUIC connections after acceptance.

use anyhow::Result;
use quinn::Incoming;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};

use super::{accept_rules, run_tunnel, ServerSettings};
use crate::access::AccessPolicy;
use crate::connection::SessionRegistry;
use crate::metrics::METRICS;
use crate::session::{QuicSession, SessionHandle};
use crate::spec::encode_all;

/// Handles a single client connection from handshake to close
pub struct SessionHandler {
    registry: Arc<SessionRegistry>,
    settings: Arc<ServerSettings>,
    policy: Arc<dyn AccessPolicy>,
    cancel: CancellationToken,
}

impl SessionHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        settings: Arc<ServerSettings>,
        policy: Arc<dyn AccessPolicy>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            settings,
            policy,
            cancel,
        }
    }

    /// Handle an incoming connection
    #[instrument(skip(self, incoming), fields(client_addr))]
    pub async fn handle(self, incoming: Incoming) -> Result<()> {
        let client_addr = incoming.remote_address();
        Span::current().record("client_addr", client_addr.to_string());

        let connection = match incoming.await {
            Ok(conn) => conn,
            Err(e) => {
                METRICS.session_failed();
                return Err(e.into());
            }
        };

        let Some(id) = self.registry.register(client_addr) else {
            warn!("Session rejected: server at capacity");
            connection.close(quinn::VarInt::from_u32(1), b"server at capacity");
            return Ok(());
        };

        let session: SessionHandle = QuicSession::new(connection);
        self.registry.attach(id, session.clone());
        info!(session_id = %id, "Connection established");

        let result = match accept_rules(&session, &self.settings, self.policy.as_ref()).await {
            Ok(specs) => {
                self.registry.activate(id, encode_all(&specs));
                run_tunnel(
                    session,
                    specs,
                    &self.settings,
                    self.policy.clone(),
                    self.cancel.child_token(),
                )
                .await
            }
            Err(e) => {
                METRICS.session_failed();
                Err(e)
            }
        };

        self.registry.unregister(id);
        match result {
            Ok(()) => debug!(session_id = %id, "Session closed normally"),
            Err(e) if e.is_benign() => debug!(session_id = %id, error = %e, "Session closed"),
            Err(e) => info!(session_id = %id, error = %e, "Session closed with error"),
        }
        Ok(())
    }
}
