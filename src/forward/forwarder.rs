//! Per-rule listening worker

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::pipe::{self, Traffic};
use super::{channel_stats, ForwardError};
use crate::metrics::METRICS;
use crate::spec::{ForwardSpec, Protocol};
use crate::tunnel::TunnelManager;
use crate::udp::UdpEgress;
use crate::util;

/// Listens for one rule and relays through the tunnel's current session
pub struct Forwarder {
    spec: ForwardSpec,
    tunnel: Arc<TunnelManager>,
}

impl Forwarder {
    pub fn new(spec: ForwardSpec, tunnel: Arc<TunnelManager>) -> Self {
        Self { spec, tunnel }
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    /// Run until cancelled; a listen failure ends only this forwarder
    #[instrument(skip_all, fields(rule = %self.spec))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ForwardError> {
        let metadata = self
            .spec
            .channel_metadata()
            .ok_or_else(|| ForwardError::NoTarget(self.spec.encode()))?;

        if self.spec.stdio {
            return self.run_stdio(metadata, cancel).await;
        }
        match self.spec.protocol {
            Protocol::Tcp => self.run_tcp(metadata, cancel).await,
            Protocol::Udp => self.run_udp(metadata, cancel).await,
        }
    }

    async fn run_tcp(&self, metadata: String, cancel: CancellationToken) -> Result<(), ForwardError> {
        let addr = self.spec.local_addr();
        let listener = util::bind_tcp_listener(&addr)
            .await
            .map_err(|source| ForwardError::Listen {
                addr: addr.clone(),
                source,
            })?;
        info!(addr = %listener_addr(&listener, &addr), "Listening");

        let metadata: Arc<str> = metadata.into();
        let mut connections = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(relay_tcp(
                            self.tunnel.clone(),
                            stream,
                            peer,
                            metadata.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        debug!(error = %e, "Transient accept error");
                    }
                    Err(e) => break Err(ForwardError::Io(e)),
                },
            }
        };

        // Dropping the group closes every child connection
        connections.shutdown().await;
        debug!("Listener closed");
        result
    }

    async fn run_udp(&self, metadata: String, cancel: CancellationToken) -> Result<(), ForwardError> {
        let addr = self.spec.local_addr();
        let socket = util::bind_udp_socket(&addr)
            .await
            .map_err(|source| ForwardError::Listen {
                addr: addr.clone(),
                source,
            })?;
        let socket = Arc::new(socket);
        info!(addr = %socket.local_addr().map(|a| a.to_string()).unwrap_or(addr), "Listening (udp)");

        let udp = &self.tunnel.config().udp;
        let egress = UdpEgress::new(
            socket.clone(),
            metadata,
            self.tunnel.clone(),
            udp.max_payload,
            cancel.clone(),
        );

        // One spare byte detects oversized datagrams
        let mut buf = vec![0u8; udp.max_payload + 1];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((n, _)) if n > udp.max_payload => {
                    debug!(len = n, max = udp.max_payload, "Dropping oversized datagram");
                }
                Ok((n, source)) => {
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    if let Err(e) = egress.send(source, payload).await {
                        if e.is_benign() {
                            debug!(%source, error = %e, "Datagram not forwarded");
                        } else {
                            info!(%source, error = %e, "Datagram not forwarded");
                        }
                    }
                }
                Err(e) => debug!(error = %e, "UDP receive error"),
            }
        }

        egress.close().await;
        Ok(())
    }

    /// Standard input/output as the single accepted connection
    async fn run_stdio(&self, metadata: String, cancel: CancellationToken) -> Result<(), ForwardError> {
        let session = self.tunnel.current_session(&cancel).await?;
        let channel = session.open_channel(&metadata).await?;
        METRICS.channel_opened();
        info!(stats = %channel_stats(), "stdio channel open");

        let traffic = Traffic::default();
        let result = pipe::relay(
            (tokio::io::stdin(), tokio::io::stdout()),
            channel.into_split(),
            self.tunnel.config().buffer_size,
            &traffic,
            &cancel,
        )
        .await;

        METRICS.channel_closed();
        info!(sent = traffic.sent(), received = traffic.received(), "stdio channel closed");
        result.map_err(ForwardError::from)
    }
}

/// One accepted TCP connection: wait for a session, open a channel, relay
async fn relay_tcp(
    tunnel: Arc<TunnelManager>,
    stream: TcpStream,
    peer: SocketAddr,
    metadata: Arc<str>,
    cancel: CancellationToken,
) {
    if let Err(e) = util::tune_tcp_stream(&stream) {
        debug!(%peer, error = %e, "Socket tuning failed");
    }

    let channel = match open_channel(&tunnel, &metadata, &cancel).await {
        Ok(channel) => channel,
        Err(e) if e.is_benign() => {
            debug!(%peer, error = %e, "Connection dropped");
            return;
        }
        Err(e) => {
            info!(%peer, target = %metadata, error = %e, "Connection dropped");
            return;
        }
    };
    METRICS.channel_opened();
    debug!(%peer, target = %metadata, stats = %channel_stats(), "Channel open");

    let traffic = Traffic::default();
    let (read, write) = stream.into_split();
    let result = pipe::relay(
        (read, write),
        channel.into_split(),
        tunnel.config().buffer_size,
        &traffic,
        &cancel,
    )
    .await;

    METRICS.channel_closed();
    match result {
        Ok(()) => debug!(
            %peer,
            sent = traffic.sent(),
            received = traffic.received(),
            stats = %channel_stats(),
            "Channel closed"
        ),
        Err(e) => debug!(%peer, error = %e, stats = %channel_stats(), "Channel closed with error"),
    }
}

async fn open_channel(
    tunnel: &TunnelManager,
    metadata: &str,
    cancel: &CancellationToken,
) -> Result<crate::session::Channel, ForwardError> {
    let session = tunnel.current_session(cancel).await?;
    Ok(session.open_channel(metadata).await?)
}

fn listener_addr(listener: &TcpListener, fallback: &str) -> String {
    listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| fallback.to_string())
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}
