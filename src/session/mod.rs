//! Transport sessions
//!
//! A session is one secure, multiplexed connection to the peer. It carries
//! virtual channels (byte streams tagged with target metadata) and small
//! control requests with a reply. The QUIC implementation is what runs in
//! production; the in-memory pair backs embedding and tests.

pub mod memory;
pub mod quic;
pub mod tls;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

pub use quic::QuicSession;

/// Shared handle to a live session
pub type SessionHandle = Arc<dyn TransportSession>;

/// Read half of a channel
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a channel
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Session and channel failures
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("channel rejected: {0}")]
    Rejected(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Peer went away or the link was already gone; not worth an error log
    pub fn is_benign(&self) -> bool {
        match self {
            SessionError::Closed => true,
            SessionError::Io(e) => is_benign_io(e),
            _ => false,
        }
    }
}

/// End-of-stream class I/O errors
pub fn is_benign_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// The capabilities the tunnel fabric needs from a secure transport
#[async_trait]
pub trait TransportSession: Send + Sync + 'static {
    /// Who the peer is, as seen by the access policy
    fn identity(&self) -> &str;

    /// Open a virtual channel tagged with `metadata`
    async fn open_channel(&self, metadata: &str) -> Result<Channel, SessionError>;

    /// Next channel-open request from the peer, `None` once the session ends
    async fn accept_channel(&self) -> Option<IncomingChannel>;

    /// Send a control request and wait for its reply
    async fn request(&self, name: &str, payload: Bytes) -> Result<Reply, SessionError>;

    /// Next control request from the peer, `None` once the session ends
    async fn accept_request(&self) -> Option<IncomingRequest>;

    /// Resolves when the session has terminated
    async fn closed(&self);

    /// Tear the session down
    fn close(&self, reason: &str);

    fn is_closed(&self) -> bool;
}

/// One virtual channel: a bidirectional byte stream
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    pub fn new(reader: ChannelReader, writer: ChannelWriter) -> Self {
        Self { reader, writer }
    }

    /// Wrap any duplex stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(Box::new(reader), Box::new(writer))
    }

    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// Transport-specific answer to a channel-open request
#[async_trait]
pub trait ChannelResponder: Send {
    async fn accept(self: Box<Self>) -> Result<Channel, SessionError>;
    async fn reject(self: Box<Self>, reason: &str);
}

/// A channel-open request from the peer, answered exactly once
pub struct IncomingChannel {
    metadata: String,
    responder: Box<dyn ChannelResponder>,
}

impl IncomingChannel {
    pub fn new(metadata: String, responder: Box<dyn ChannelResponder>) -> Self {
        Self {
            metadata,
            responder,
        }
    }

    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    pub async fn accept(self) -> Result<Channel, SessionError> {
        self.responder.accept().await
    }

    /// Reject with a human-readable reason delivered to the opener
    pub async fn reject(self, reason: &str) {
        self.responder.reject(reason).await
    }
}

/// Control request reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    pub payload: Bytes,
}

impl Reply {
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            ok: true,
            payload: payload.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: Bytes::from(reason.into()),
        }
    }

    /// Reply payload as text (failure reasons are human readable)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A control request from the peer. Dropping it unanswered sends a failure.
#[derive(Debug)]
pub struct IncomingRequest {
    pub name: String,
    pub payload: Bytes,
    reply: oneshot::Sender<Reply>,
}

impl IncomingRequest {
    pub fn new(name: String, payload: Bytes) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                name,
                payload,
                reply: tx,
            },
            rx,
        )
    }

    pub fn respond(self, reply: Reply) {
        let _ = self.reply.send(reply);
    }
}
