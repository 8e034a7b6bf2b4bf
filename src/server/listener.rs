//! QUIC server listener

use anyhow::Result;
use quinn::{Endpoint, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::acceptor::SessionHandler;
use super::ServerSettings;
use crate::access::AccessPolicy;
use crate::config::ServerFileConfig;
use crate::connection::SessionRegistry;
use crate::session::tls;

/// How long shutdown waits for sessions to wind down
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often live sessions are logged
const REPORT_INTERVAL: Duration = Duration::from_secs(300);

/// QUIC tunnel server
pub struct Server {
    endpoint: Endpoint,
    registry: Arc<SessionRegistry>,
    settings: Arc<ServerSettings>,
    policy: Arc<dyn AccessPolicy>,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a server bound to the configured address
    pub async fn new(config: &ServerFileConfig, policy: Arc<dyn AccessPolicy>) -> Result<Self> {
        let server_config = tls::build_server_config(&config.tls).await?;
        let endpoint = tls::server_endpoint(server_config, config.server.bind_addr)?;
        let settings = ServerSettings::from_config(config);

        info!(
            reverse = settings.reverse,
            socks5 = settings.socks5,
            max_sessions = config.server.max_sessions,
            "Server configured"
        );

        Ok(Self {
            endpoint,
            registry: SessionRegistry::new(config.server.max_sessions),
            settings: Arc::new(settings),
            policy,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run the accept loop until shutdown
    pub async fn run(&self) -> Result<()> {
        info!(bind_addr = %self.local_addr()?, "Server accepting connections");

        let mut report = tokio::time::interval(REPORT_INTERVAL);
        report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        report.tick().await;

        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        // Endpoint closed
                        break;
                    };
                    if self.registry.is_full() {
                        warn!(peer = %incoming.remote_address(), "Connection refused: at capacity");
                        incoming.refuse();
                        continue;
                    }

                    let handler = SessionHandler::new(
                        self.registry.clone(),
                        self.settings.clone(),
                        self.policy.clone(),
                        self.shutdown.child_token(),
                    );
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(incoming).await {
                            debug!(error = %e, "Connection error");
                        }
                    });
                }
                _ = report.tick() => {
                    let sessions = self.registry.report();
                    debug!(sessions, "Session report");
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.shutdown.cancel();
        self.registry.close_all("server shutdown");
        self.registry.drain(DRAIN_TIMEOUT).await;
        self.endpoint.close(VarInt::from_u32(0), b"server shutdown");
        info!("Server shutdown complete");
    }
}
