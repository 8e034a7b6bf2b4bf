//! Tunnel client
//!
//! Runs the forward rules locally and keeps one session to the server alive
//! through the reconnect loop. Reverse rules are sent to the server during
//! the handshake; their channels arrive here and are dialed locally.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use quinn::Endpoint;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::access::AllowAll;
use crate::config::{ClientSection, TunnelConfig};
use crate::handshake;
use crate::reconnect::{AttemptContext, Connect, ReconnectError, ReconnectLoop, ReconnectPolicy};
use crate::session::{tls, QuicSession, SessionError, SessionHandle};
use crate::spec::ForwardSpec;
use crate::tunnel::{InboundRules, TunnelError, TunnelManager};
use crate::util;

/// Establishes a fresh transport session per attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<SessionHandle, TunnelError>;
}

/// QUIC connector toward one server
pub struct QuicConnector {
    endpoint: Endpoint,
    server: String,
    server_name: String,
}

impl QuicConnector {
    pub async fn new(section: &ClientSection, server: &str) -> Result<Self> {
        let server_addr = util::resolve(server)
            .await
            .with_context(|| format!("Failed to resolve server {}", server))?;
        let client_config = tls::build_client_config(section)?;
        let endpoint = tls::client_endpoint(client_config, server_addr)?;

        Ok(Self {
            endpoint,
            server: server.to_string(),
            server_name: section.server_name_for(server),
        })
    }
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self) -> Result<SessionHandle, TunnelError> {
        // Re-resolve every attempt; the server may have moved
        let addr = util::resolve(&self.server)
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;
        let connecting = self
            .endpoint
            .connect(addr, &self.server_name)
            .map_err(|e| TunnelError::Connect(e.to_string()))?;
        let connection = connecting
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;

        info!(addr = %connection.remote_address(), "Connected to server");
        Ok(QuicSession::new(connection))
    }
}

/// Reject rule sets the client cannot run
pub fn validate_rules(specs: &[ForwardSpec]) -> Result<()> {
    let mut stdio = 0;
    for spec in specs {
        if spec.stdio {
            stdio += 1;
            if spec.channel_metadata().is_none() {
                bail!("stdio rule '{}' needs a remote target", spec.encode());
            }
            continue;
        }
        if !spec.reverse && !spec.can_listen() {
            bail!("cannot listen on {}", spec.local_addr());
        }
    }
    if stdio > 1 {
        bail!("only one stdio rule is allowed");
    }
    Ok(())
}

/// Client side of the tunnel
pub struct Client {
    specs: Vec<ForwardSpec>,
    tunnel: Arc<TunnelManager>,
    reconnect: ReconnectLoop,
    connector: Arc<dyn Connector>,
}

impl Client {
    pub fn new(
        specs: Vec<ForwardSpec>,
        config: TunnelConfig,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        validate_rules(&specs)?;

        // Reverse rules are the only reason the server opens channels here
        let inbound = InboundRules {
            channels: specs.iter().any(|s| s.reverse),
            socks: specs.iter().any(|s| s.reverse && s.socks),
        };
        let tunnel = TunnelManager::new(config, Arc::new(AllowAll), inbound);

        Ok(Self {
            specs,
            tunnel,
            reconnect: ReconnectLoop::new(policy),
            connector,
        })
    }

    pub fn tunnel(&self) -> &Arc<TunnelManager> {
        &self.tunnel
    }

    pub fn reconnect(&self) -> &ReconnectLoop {
        &self.reconnect
    }

    /// Run until cancelled, the retry budget is spent, or the stdio rule ends
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ReconnectError> {
        let local: Vec<ForwardSpec> = self.specs.iter().filter(|s| !s.reverse).cloned().collect();
        let has_stdio = local.iter().any(|s| s.stdio);
        info!(
            forward = local.len(),
            reverse = self.specs.len() - local.len(),
            "Starting client"
        );

        let forwarders_cancel = cancel.child_token();
        let reconnect_cancel = cancel.child_token();

        let forwarders = {
            let tunnel = self.tunnel.clone();
            let cancel = forwarders_cancel.clone();
            async move {
                tunnel.run_forwarders(local, cancel).await;
                // Only a stdio rule ends the client when its forwarder ends
                if !has_stdio {
                    std::future::pending::<()>().await;
                }
            }
        };
        let reconnect = self.reconnect.run(self, reconnect_cancel.clone());
        tokio::pin!(forwarders, reconnect);

        let result = tokio::select! {
            result = &mut reconnect => {
                forwarders_cancel.cancel();
                result
            }
            _ = &mut forwarders => {
                debug!("stdio forwarder finished");
                reconnect_cancel.cancel();
                (&mut reconnect).await
            }
        };
        forwarders_cancel.cancel();
        result
    }
}

#[async_trait]
impl Connect for Client {
    #[instrument(skip_all, fields(attempt = ctx.attempt()))]
    async fn attempt(
        &self,
        ctx: &AttemptContext,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        self.tunnel.set_connecting();

        let session = tokio::select! {
            _ = cancel.cancelled() => {
                self.tunnel.clear_connecting();
                return Ok(());
            }
            session = self.connector.connect() => match session {
                Ok(session) => session,
                Err(e) => {
                    self.tunnel.clear_connecting();
                    return Err(e);
                }
            },
        };

        let timeout = self.tunnel.config().handshake_timeout;
        if let Err(e) = handshake::send_config(&session, &self.specs, timeout).await {
            session.close("handshake failed");
            self.tunnel.clear_connecting();
            return Err(e);
        }
        ctx.connected();
        info!(peer = %session.identity(), "Tunnel established");

        self.tunnel.run_session(session, cancel.clone()).await
    }
}

/// Hands out already established sessions, one per attempt
pub struct SessionQueue {
    sessions: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<SessionHandle>>,
}

impl SessionQueue {
    pub fn channel() -> (tokio::sync::mpsc::Sender<SessionHandle>, Self) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        (
            tx,
            Self {
                sessions: tokio::sync::Mutex::new(rx),
            },
        )
    }
}

#[async_trait]
impl Connector for SessionQueue {
    async fn connect(&self) -> Result<SessionHandle, TunnelError> {
        self.sessions
            .lock()
            .await
            .recv()
            .await
            .ok_or(TunnelError::Session(SessionError::Closed))
    }
}
