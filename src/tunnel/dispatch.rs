//! Inbound channel dispatch
//!
//! The peer opens a channel tagged with target metadata; this side checks it
//! against the inbound rules and the access policy, then dials the target.
//! A denied request is rejected with a reason and allocates nothing.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::TunnelManager;
use crate::forward::{channel_stats, pipe, socks, ForwardError, Traffic};
use crate::metrics::METRICS;
use crate::session::{IncomingChannel, SessionHandle};
use crate::spec::{parse_target, Target};
use crate::udp::CircuitMux;
use crate::util;

/// Accept inbound channels for the lifetime of `session`
pub async fn serve_channels(
    tunnel: Arc<TunnelManager>,
    session: SessionHandle,
    cancel: CancellationToken,
) {
    let identity: Arc<str> = session.identity().into();
    let mut channels = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = channels.join_next(), if !channels.is_empty() => {}
            incoming = session.accept_channel() => {
                let Some(incoming) = incoming else { break };
                channels.spawn(handle_inbound(
                    tunnel.clone(),
                    identity.clone(),
                    incoming,
                    cancel.clone(),
                ));
            }
        }
    }

    channels.shutdown().await;
}

/// Check an inbound request; on success returns the target to dial
pub fn admit(tunnel: &TunnelManager, identity: &str, metadata: &str) -> Result<Target, String> {
    let inbound = tunnel.inbound();
    if !inbound.channels {
        return Err("inbound channels are not enabled".to_string());
    }
    let target = parse_target(metadata).map_err(|e| e.to_string())?;
    if target == Target::Socks && !inbound.socks {
        return Err("socks is not enabled".to_string());
    }
    if !tunnel.policy().allow(identity, target.access_target()) {
        return Err(format!("access to '{}' denied", target));
    }
    Ok(target)
}

async fn handle_inbound(
    tunnel: Arc<TunnelManager>,
    identity: Arc<str>,
    incoming: IncomingChannel,
    cancel: CancellationToken,
) {
    let target = match admit(&tunnel, &identity, incoming.metadata()) {
        Ok(target) => target,
        Err(reason) => {
            info!(peer = %identity, metadata = %incoming.metadata(), %reason, "Channel rejected");
            METRICS.channel_rejected();
            incoming.reject(&reason).await;
            return;
        }
    };

    if let Err(e) = relay_inbound(&tunnel, &identity, incoming, &target, cancel).await {
        debug!(peer = %identity, %target, error = %e, "Inbound channel closed with error");
    }
}

async fn relay_inbound(
    tunnel: &TunnelManager,
    identity: &str,
    incoming: IncomingChannel,
    target: &Target,
    cancel: CancellationToken,
) -> Result<(), ForwardError> {
    match target {
        Target::Tcp(addr) => {
            // Dial first so a failure is reported to the opener as a rejection
            let stream = match util::connect_tcp(addr).await {
                Ok(stream) => stream,
                Err(source) => {
                    incoming.reject(&format!("dial {} failed: {}", addr, source)).await;
                    return Err(ForwardError::Dial {
                        addr: addr.clone(),
                        source,
                    });
                }
            };
            let channel = incoming.accept().await?;
            METRICS.channel_opened();
            debug!(peer = %identity, %target, stats = %channel_stats(), "Channel open");

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
            debug!(
                peer = %identity,
                %target,
                sent = traffic.sent(),
                received = traffic.received(),
                stats = %channel_stats(),
                "Channel closed"
            );
            result.map_err(ForwardError::from)
        }
        Target::Udp(addr) => {
            let channel = incoming.accept().await?;
            METRICS.channel_opened();
            debug!(peer = %identity, %target, stats = %channel_stats(), "UDP channel open");

            let mux = CircuitMux::new(addr.clone(), tunnel.config().udp.clone());
            let result = mux.run(channel, cancel).await;

            METRICS.channel_closed();
            debug!(peer = %identity, %target, stats = %channel_stats(), "UDP channel closed");
            result
        }
        Target::Socks => {
            let channel = incoming.accept().await?;
            METRICS.channel_opened();
            let result = socks::serve(
                channel,
                tunnel.policy().as_ref(),
                identity,
                tunnel.config().buffer_size,
                &cancel,
            )
            .await;
            METRICS.channel_closed();
            result
        }
    }
}
