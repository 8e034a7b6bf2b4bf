//! QUIC-backed session
//!
//! Every virtual channel and every control request is one bidirectional
//! QUIC stream. The first byte of a stream selects its kind:
//!
//! - Channel: `[0x01][len u16][metadata]`, answered `[status u8][len u16][reason]`
//! - Request: `[0x02][len u16][name][len u32][payload]`, answered
//!   `[ok u8][len u32][payload]`

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use quinn::{Connection, ConnectionError, RecvStream, SendStream, VarInt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{
    Channel, ChannelResponder, IncomingChannel, IncomingRequest, Reply, SessionError,
    TransportSession,
};

/// Stream kinds
pub const KIND_CHANNEL: u8 = 0x01;
pub const KIND_REQUEST: u8 = 0x02;

/// Channel-open status codes
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_REJECTED: u8 = 0x01;

/// Largest control request or reply payload
pub const MAX_REQUEST_PAYLOAD: usize = 1024 * 1024;

/// Pending queue depth per stream kind
const QUEUE_DEPTH: usize = 64;

/// A live QUIC connection exposed as a transport session
pub struct QuicSession {
    conn: Connection,
    identity: String,
    channels: Mutex<mpsc::Receiver<IncomingChannel>>,
    requests: Mutex<mpsc::Receiver<IncomingRequest>>,
    accept_task: JoinHandle<()>,
}

impl QuicSession {
    /// Wrap an established connection and start routing inbound streams
    pub fn new(conn: Connection) -> Arc<Self> {
        let (channels_tx, channels_rx) = mpsc::channel(QUEUE_DEPTH);
        let (requests_tx, requests_rx) = mpsc::channel(QUEUE_DEPTH);
        let accept_task = tokio::spawn(accept_streams(conn.clone(), channels_tx, requests_tx));

        Arc::new(Self {
            identity: conn.remote_address().to_string(),
            conn,
            channels: Mutex::new(channels_rx),
            requests: Mutex::new(requests_rx),
            accept_task,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl TransportSession for QuicSession {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn open_channel(&self, metadata: &str) -> Result<Channel, SessionError> {
        let (mut send, mut recv) = self.conn.open_bi().await.map_err(map_connection_error)?;
        AsyncWriteExt::write_all(&mut send, &encode_channel_open(metadata)?).await?;
        read_channel_status(&mut recv).await?;
        Ok(Channel::new(Box::new(recv), Box::new(send)))
    }

    async fn accept_channel(&self) -> Option<IncomingChannel> {
        let mut channels = self.channels.lock().await;
        tokio::select! {
            incoming = channels.recv() => incoming,
            _ = self.conn.closed() => None,
        }
    }

    async fn request(&self, name: &str, payload: Bytes) -> Result<Reply, SessionError> {
        let (mut send, mut recv) = self.conn.open_bi().await.map_err(map_connection_error)?;
        AsyncWriteExt::write_all(&mut send, &encode_request(name, &payload)?).await?;
        let _ = send.finish();
        read_reply(&mut recv).await
    }

    async fn accept_request(&self) -> Option<IncomingRequest> {
        let mut requests = self.requests.lock().await;
        tokio::select! {
            request = requests.recv() => request,
            _ = self.conn.closed() => None,
        }
    }

    async fn closed(&self) {
        let reason = self.conn.closed().await;
        debug!(peer = %self.identity, reason = %reason, "QUIC session closed");
    }

    fn close(&self, reason: &str) {
        self.conn.close(VarInt::from_u32(0), reason.as_bytes());
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }
}

/// Classify connection-level failures
pub fn map_connection_error(e: ConnectionError) -> SessionError {
    match e {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::LocallyClosed
        | ConnectionError::Reset => SessionError::Closed,
        ConnectionError::TimedOut => SessionError::Timeout,
        other => SessionError::Connection(other.to_string()),
    }
}

/// Route peer-initiated streams into the channel and request queues
async fn accept_streams(
    conn: Connection,
    channels: mpsc::Sender<IncomingChannel>,
    requests: mpsc::Sender<IncomingRequest>,
) {
    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let channels = channels.clone();
                let requests = requests.clone();
                tokio::spawn(async move {
                    if let Err(e) = route_stream(send, recv, channels, requests).await {
                        debug!(error = %e, "Inbound stream dropped");
                    }
                });
            }
            Err(e) => {
                trace!(error = %e, "Stream accept loop finished");
                break;
            }
        }
    }
}

async fn route_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    channels: mpsc::Sender<IncomingChannel>,
    requests: mpsc::Sender<IncomingRequest>,
) -> Result<(), SessionError> {
    match recv.read_u8().await? {
        KIND_CHANNEL => {
            let metadata = read_string_u16(&mut recv).await?;
            let incoming = IncomingChannel::new(metadata, Box::new(QuicResponder { send, recv }));
            if let Err(mpsc::error::SendError(incoming)) = channels.send(incoming).await {
                incoming.reject("not accepting channels").await;
            }
            Ok(())
        }
        KIND_REQUEST => {
            let (name, payload) = read_request_body(&mut recv).await?;
            let (request, reply_rx) = IncomingRequest::new(name, payload);
            let reply = match requests.send(request).await {
                Ok(()) => reply_rx
                    .await
                    .unwrap_or_else(|_| Reply::fail("request not handled")),
                Err(_) => Reply::fail("not accepting requests"),
            };
            write_reply(&mut send, &reply).await?;
            let _ = send.finish();
            Ok(())
        }
        other => {
            let _ = send.reset(VarInt::from_u32(1));
            Err(SessionError::Protocol(format!("unknown stream kind {:#04x}", other)))
        }
    }
}

struct QuicResponder {
    send: SendStream,
    recv: RecvStream,
}

#[async_trait]
impl ChannelResponder for QuicResponder {
    async fn accept(self: Box<Self>) -> Result<Channel, SessionError> {
        let QuicResponder { mut send, recv } = *self;
        write_channel_status(&mut send, None).await?;
        Ok(Channel::new(Box::new(recv), Box::new(send)))
    }

    async fn reject(self: Box<Self>, reason: &str) {
        let QuicResponder { mut send, .. } = *self;
        if write_channel_status(&mut send, Some(reason)).await.is_ok() {
            let _ = send.finish();
        }
    }
}

// Wire helpers

fn encode_channel_open(metadata: &str) -> Result<Bytes, SessionError> {
    let len = u16::try_from(metadata.len())
        .map_err(|_| SessionError::Protocol("channel metadata too long".to_string()))?;
    let mut buf = BytesMut::with_capacity(3 + metadata.len());
    buf.put_u8(KIND_CHANNEL);
    buf.put_u16(len);
    buf.put_slice(metadata.as_bytes());
    Ok(buf.freeze())
}

fn encode_request(name: &str, payload: &[u8]) -> Result<Bytes, SessionError> {
    let name_len = u16::try_from(name.len())
        .map_err(|_| SessionError::Protocol("request name too long".to_string()))?;
    if payload.len() > MAX_REQUEST_PAYLOAD {
        return Err(SessionError::Protocol("request payload too large".to_string()));
    }
    let mut buf = BytesMut::with_capacity(7 + name.len() + payload.len());
    buf.put_u8(KIND_REQUEST);
    buf.put_u16(name_len);
    buf.put_slice(name.as_bytes());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

async fn read_string_u16<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, SessionError> {
    let len = r.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| SessionError::Protocol("non-UTF-8 string".to_string()))
}

async fn read_payload_u32<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes, SessionError> {
    let len = r.read_u32().await? as usize;
    if len > MAX_REQUEST_PAYLOAD {
        return Err(SessionError::Protocol(format!("payload of {} bytes too large", len)));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn read_request_body<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(String, Bytes), SessionError> {
    let name = read_string_u16(r).await?;
    let payload = read_payload_u32(r).await?;
    Ok((name, payload))
}

async fn write_channel_status<W: AsyncWrite + Unpin>(
    w: &mut W,
    rejection: Option<&str>,
) -> Result<(), SessionError> {
    let reason = rejection.unwrap_or_default().as_bytes();
    let reason = &reason[..reason.len().min(u16::MAX as usize)];
    let mut buf = BytesMut::with_capacity(3 + reason.len());
    buf.put_u8(if rejection.is_some() { STATUS_REJECTED } else { STATUS_OK });
    buf.put_u16(reason.len() as u16);
    buf.put_slice(reason);
    w.write_all(&buf).await?;
    Ok(())
}

async fn read_channel_status<R: AsyncRead + Unpin>(r: &mut R) -> Result<(), SessionError> {
    let status = r.read_u8().await?;
    let reason = read_string_u16(r).await?;
    match status {
        STATUS_OK => Ok(()),
        STATUS_REJECTED => Err(SessionError::Rejected(reason)),
        other => Err(SessionError::Protocol(format!("unknown channel status {:#04x}", other))),
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(w: &mut W, reply: &Reply) -> Result<(), SessionError> {
    let payload = &reply.payload[..reply.payload.len().min(MAX_REQUEST_PAYLOAD)];
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(reply.ok as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    w.write_all(&buf).await?;
    Ok(())
}

async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<Reply, SessionError> {
    let ok = r.read_u8().await? != 0;
    let payload = read_payload_u32(r).await?;
    Ok(Reply { ok, payload })
}
