//! In-memory session pair
//!
//! Two connected [`MemorySession`] ends backed by `tokio::io::duplex`
//! channels. Closing either end (or dropping it) terminates both.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    Channel, ChannelResponder, IncomingChannel, IncomingRequest, Reply, SessionError,
    TransportSession,
};

/// Per-channel pipe capacity
const CHANNEL_BUFFER: usize = 64 * 1024;

/// Pending channel-open / request queue depth
const QUEUE_DEPTH: usize = 64;

/// One end of an in-memory session
pub struct MemorySession {
    identity: String,
    to_peer_channels: mpsc::Sender<IncomingChannel>,
    to_peer_requests: mpsc::Sender<IncomingRequest>,
    channels: Mutex<mpsc::Receiver<IncomingChannel>>,
    requests: Mutex<mpsc::Receiver<IncomingRequest>>,
    closed: CancellationToken,
}

/// Create a connected pair; each end's identity names the other end
pub fn pair() -> (Arc<MemorySession>, Arc<MemorySession>) {
    pair_named("memory:a", "memory:b")
}

/// Like [`pair`] with explicit names for end `a` and end `b`
pub fn pair_named(a: &str, b: &str) -> (Arc<MemorySession>, Arc<MemorySession>) {
    let (a_channels_tx, a_channels_rx) = mpsc::channel(QUEUE_DEPTH);
    let (b_channels_tx, b_channels_rx) = mpsc::channel(QUEUE_DEPTH);
    let (a_requests_tx, a_requests_rx) = mpsc::channel(QUEUE_DEPTH);
    let (b_requests_tx, b_requests_rx) = mpsc::channel(QUEUE_DEPTH);
    let closed = CancellationToken::new();

    let end_a = MemorySession {
        identity: b.to_string(),
        to_peer_channels: b_channels_tx,
        to_peer_requests: b_requests_tx,
        channels: Mutex::new(a_channels_rx),
        requests: Mutex::new(a_requests_rx),
        closed: closed.clone(),
    };
    let end_b = MemorySession {
        identity: a.to_string(),
        to_peer_channels: a_channels_tx,
        to_peer_requests: a_requests_tx,
        channels: Mutex::new(b_channels_rx),
        requests: Mutex::new(b_requests_rx),
        closed,
    };
    (Arc::new(end_a), Arc::new(end_b))
}

struct MemoryResponder {
    stream: DuplexStream,
    decision: oneshot::Sender<Result<(), String>>,
}

#[async_trait]
impl ChannelResponder for MemoryResponder {
    async fn accept(self: Box<Self>) -> Result<Channel, SessionError> {
        let MemoryResponder { stream, decision } = *self;
        decision.send(Ok(())).map_err(|_| SessionError::Closed)?;
        Ok(Channel::from_stream(stream))
    }

    async fn reject(self: Box<Self>, reason: &str) {
        let _ = self.decision.send(Err(reason.to_string()));
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn open_channel(&self, metadata: &str) -> Result<Channel, SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Closed);
        }

        let (local, remote) = tokio::io::duplex(CHANNEL_BUFFER);
        let (decision_tx, decision_rx) = oneshot::channel();
        let incoming = IncomingChannel::new(
            metadata.to_string(),
            Box::new(MemoryResponder {
                stream: remote,
                decision: decision_tx,
            }),
        );

        tokio::select! {
            sent = self.to_peer_channels.send(incoming) => {
                sent.map_err(|_| SessionError::Closed)?;
            }
            _ = self.closed.cancelled() => return Err(SessionError::Closed),
        }

        tokio::select! {
            decision = decision_rx => match decision {
                Ok(Ok(())) => Ok(Channel::from_stream(local)),
                Ok(Err(reason)) => Err(SessionError::Rejected(reason)),
                Err(_) => Err(SessionError::Rejected("channel dropped".to_string())),
            },
            _ = self.closed.cancelled() => Err(SessionError::Closed),
        }
    }

    async fn accept_channel(&self) -> Option<IncomingChannel> {
        let mut channels = self.channels.lock().await;
        tokio::select! {
            incoming = channels.recv() => incoming,
            _ = self.closed.cancelled() => None,
        }
    }

    async fn request(&self, name: &str, payload: Bytes) -> Result<Reply, SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Closed);
        }

        let (request, reply_rx) = IncomingRequest::new(name.to_string(), payload);
        tokio::select! {
            sent = self.to_peer_requests.send(request) => {
                sent.map_err(|_| SessionError::Closed)?;
            }
            _ = self.closed.cancelled() => return Err(SessionError::Closed),
        }

        tokio::select! {
            reply = reply_rx => Ok(reply.unwrap_or_else(|_| Reply::fail("request not handled"))),
            _ = self.closed.cancelled() => Err(SessionError::Closed),
        }
    }

    async fn accept_request(&self) -> Option<IncomingRequest> {
        let mut requests = self.requests.lock().await;
        tokio::select! {
            request = requests.recv() => request,
            _ = self.closed.cancelled() => None,
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn close(&self, reason: &str) {
        if !self.closed.is_cancelled() {
            debug!(peer = %self.identity, reason, "Closing in-memory session");
            self.closed.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_channel_open_accept() {
        let (client, server) = pair_named("client", "server");
        assert_eq!(client.identity(), "server");
        assert_eq!(server.identity(), "client");

        let acceptor = tokio::spawn(async move {
            let incoming = server.accept_channel().await.unwrap();
            assert_eq!(incoming.metadata(), "example.com:80");
            let mut channel = incoming.accept().await.unwrap();
            let mut buf = [0u8; 4];
            channel.read_exact(&mut buf).await.unwrap();
            channel.write_all(&buf).await.unwrap();
            server
        });

        let mut channel = client.open_channel("example.com:80").await.unwrap();
        channel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        let _server = acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_reject_carries_reason() {
        let (client, server) = pair();
        tokio::spawn(async move {
            let incoming = server.accept_channel().await.unwrap();
            incoming.reject("access denied").await;
            server.closed().await;
        });

        match client.open_channel("10.0.0.1:22").await {
            Err(SessionError::Rejected(reason)) => assert_eq!(reason, "access denied"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_request_reply_and_unanswered() {
        let (client, server) = pair();
        tokio::spawn(async move {
            let ping = server.accept_request().await.unwrap();
            assert_eq!(ping.name, "ping");
            ping.respond(Reply::ok("pong"));

            // dropped without an answer
            drop(server.accept_request().await.unwrap());
            server.closed().await;
        });

        let reply = client.request("ping", Bytes::new()).await.unwrap();
        assert_eq!(reply, Reply::ok("pong"));

        let reply = client.request("other", Bytes::new()).await.unwrap();
        assert!(!reply.ok);
    }

    #[tokio::test]
    async fn test_close_ends_both_sides() {
        let (client, server) = pair();
        client.close("done");
        server.closed().await;
        assert!(server.is_closed());
        assert!(server.accept_channel().await.is_none());
        assert!(matches!(
            server.open_channel("x:1").await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_drop_closes_peer() {
        let (client, server) = pair();
        drop(client);
        server.closed().await;
        assert!(server.accept_request().await.is_none());
    }
}
