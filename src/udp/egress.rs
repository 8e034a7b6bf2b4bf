//! Sending side of a UDP forwarder
//!
//! All local flows share one lazily opened channel. Outgoing records are
//! written under the slot lock, so frames never interleave and only one
//! caller opens the channel at a time. Replies are read by a dedicated task
//! and sent back to the source address each record names.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Record, RecordCodec};
use crate::forward::{channel_stats, ForwardError};
use crate::metrics::METRICS;
use crate::session::{ChannelReader, ChannelWriter, SessionHandle};
use crate::tunnel::TunnelManager;

type RecordWriter = FramedWrite<ChannelWriter, RecordCodec>;

#[derive(Default)]
struct EgressSlot {
    /// Bumped per opened channel; a stale reply task must not clear a newer writer
    generation: u64,
    writer: Option<RecordWriter>,
}

/// Shared egress channel of one UDP forwarder
pub struct UdpEgress {
    socket: Arc<UdpSocket>,
    metadata: String,
    tunnel: Arc<TunnelManager>,
    max_payload: usize,
    slot: Arc<tokio::sync::Mutex<EgressSlot>>,
    readers: parking_lot::Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl UdpEgress {
    pub fn new(
        socket: Arc<UdpSocket>,
        metadata: String,
        tunnel: Arc<TunnelManager>,
        max_payload: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket,
            metadata,
            tunnel,
            max_payload,
            slot: Arc::new(tokio::sync::Mutex::new(EgressSlot::default())),
            readers: parking_lot::Mutex::new(JoinSet::new()),
            cancel: cancel.child_token(),
        }
    }

    /// Encode one datagram from `source` onto the shared channel
    pub async fn send(&self, source: SocketAddr, payload: Bytes) -> Result<(), ForwardError> {
        let mut slot = self.slot.lock().await;
        if slot.writer.is_none() {
            self.open(&mut slot).await?;
        }
        let Some(writer) = slot.writer.as_mut() else {
            return Ok(());
        };

        if let Err(e) = writer.send(Record::new(source.to_string(), payload)).await {
            // Next datagram reopens
            slot.writer = None;
            return Err(e.into());
        }
        METRICS.udp_record_out();
        trace!(%source, "Record sent");
        Ok(())
    }

    async fn open(&self, slot: &mut EgressSlot) -> Result<(), ForwardError> {
        let session = self.tunnel.current_session(&self.cancel).await?;
        let channel = session.open_channel(&self.metadata).await?;
        METRICS.channel_opened();
        debug!(target = %self.metadata, stats = %channel_stats(), "UDP channel open");

        let (reader, writer) = channel.into_split();
        slot.generation += 1;
        slot.writer = Some(FramedWrite::new(writer, RecordCodec::new(self.max_payload)));

        let mut readers = self.readers.lock();
        while readers.try_join_next().is_some() {}
        readers.spawn(deliver_replies(
            reader,
            session,
            self.socket.clone(),
            self.slot.clone(),
            slot.generation,
            self.max_payload,
            self.cancel.clone(),
        ));
        Ok(())
    }

    /// Close the shared channel and stop reply delivery
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut writer) = self.slot.lock().await.writer.take() {
            let _ = writer.close().await;
        }
        let mut readers = std::mem::take(&mut *self.readers.lock());
        readers.shutdown().await;
    }
}

async fn deliver_replies(
    reader: ChannelReader,
    session: SessionHandle,
    socket: Arc<UdpSocket>,
    slot: Arc<tokio::sync::Mutex<EgressSlot>>,
    generation: u64,
    max_payload: usize,
    cancel: CancellationToken,
) {
    let mut records = FramedRead::new(reader, RecordCodec::new(max_payload));
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = session.closed() => break,
            next = records.next() => next,
        };
        let record = match next {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                debug!(error = %e, "UDP channel decode failed");
                break;
            }
            None => break,
        };
        METRICS.udp_record_in();

        let Ok(source) = record.source.parse::<SocketAddr>() else {
            debug!(source = %record.source, "Reply for unparseable source");
            continue;
        };
        if let Err(e) = socket.send_to(&record.payload, source).await {
            debug!(%source, error = %e, "Reply not delivered");
        }
    }

    let mut slot = slot.lock().await;
    if slot.generation == generation {
        slot.writer = None;
    }
    METRICS.channel_closed();
    debug!(stats = %channel_stats(), "UDP channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AllowAll;
    use crate::config::TunnelConfig;
    use crate::session::{memory, TransportSession};
    use crate::tunnel::InboundRules;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_channel_carries_all_sources() {
        let tunnel = TunnelManager::new(
            TunnelConfig::default(),
            Arc::new(AllowAll),
            InboundRules::default(),
        );
        let (near, far) = memory::pair();
        tunnel.bind(near.clone()).unwrap();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let egress = UdpEgress::new(
            socket.clone(),
            "1.1.1.1:53/udp".into(),
            tunnel,
            1024,
            CancellationToken::new(),
        );
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let first_addr = first.local_addr().unwrap();
        let second_addr = second.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let incoming = far.accept_channel().await.unwrap();
            assert_eq!(incoming.metadata(), "1.1.1.1:53/udp");
            let (reader, writer) = incoming.accept().await.unwrap().into_split();
            let mut records = FramedRead::new(reader, RecordCodec::new(1024));
            let mut replies = FramedWrite::new(writer, RecordCodec::new(1024));
            for _ in 0..2 {
                let record = records.next().await.unwrap().unwrap();
                let reply = [b"re:".as_slice(), &record.payload[..]].concat();
                replies
                    .send(Record::new(record.source, reply))
                    .await
                    .unwrap();
            }
            // A second channel would show up here
            let extra = tokio::time::timeout(Duration::from_millis(50), far.accept_channel()).await;
            assert!(extra.is_err());
            (far, records, replies)
        });

        egress.send(first_addr, Bytes::from_static(b"one")).await.unwrap();
        egress.send(second_addr, Bytes::from_static(b"two")).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = first.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"re:one");
        assert_eq!(from, socket.local_addr().unwrap());
        let (n, _) = second.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"re:two");

        let _keep = peer.await.unwrap();
        egress.close().await;
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let config = TunnelConfig {
            session_wait: Duration::from_millis(20),
            ..Default::default()
        };
        let tunnel = TunnelManager::new(config, Arc::new(AllowAll), InboundRules::default());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let egress = UdpEgress::new(
            socket,
            "1.1.1.1:53/udp".into(),
            tunnel,
            1024,
            CancellationToken::new(),
        );

        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let result = egress.send(source, Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(ForwardError::Wait(_))));
    }
}
