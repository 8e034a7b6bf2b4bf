//! Bidirectional byte relay
//!
//! Copies between a local stream and a channel until either direction ends,
//! then shuts both writers down. Byte order is preserved per direction.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS;
use crate::session::is_benign_io;

/// Per-connection byte counters
#[derive(Debug, Default)]
pub struct Traffic {
    sent: AtomicU64,
    received: AtomicU64,
}

impl Traffic {
    /// Bytes moved from the local side into the tunnel
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes moved from the tunnel to the local side
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}

/// Relay until the first end-of-stream, error or cancellation
pub async fn relay<LR, LW, RR, RW>(
    local: (LR, LW),
    remote: (RR, RW),
    buffer_size: usize,
    traffic: &Traffic,
    cancel: &CancellationToken,
) -> io::Result<()>
where
    LR: AsyncRead + Unpin,
    LW: AsyncWrite + Unpin,
    RR: AsyncRead + Unpin,
    RW: AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = local;
    let (mut remote_read, mut remote_write) = remote;

    let result = {
        let upstream = copy_counted(
            &mut local_read,
            &mut remote_write,
            buffer_size,
            traffic,
            Direction::Upstream,
        );
        let downstream = copy_counted(
            &mut remote_read,
            &mut local_write,
            buffer_size,
            traffic,
            Direction::Downstream,
        );
        tokio::pin!(upstream, downstream);

        tokio::select! {
            r = &mut upstream => r,
            r = &mut downstream => r,
            _ = cancel.cancelled() => Ok(()),
        }
    };

    // Each writer is owned here, so each is shut down exactly once
    let _ = remote_write.shutdown().await;
    let _ = local_write.shutdown().await;

    match result {
        Err(e) if is_benign_io(&e) => Ok(()),
        other => other,
    }
}

async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    traffic: &Traffic,
    direction: Direction,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;

        let n = n as u64;
        match direction {
            Direction::Upstream => {
                traffic.sent.fetch_add(n, Ordering::Relaxed);
                METRICS.add_bytes_in(n);
            }
            Direction::Downstream => {
                traffic.received.fetch_add(n, Ordering::Relaxed);
                METRICS.add_bytes_out(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let (local, mut local_peer) = duplex(1024);
        let (remote, mut remote_peer) = duplex(1024);
        let traffic = Traffic::default();
        let cancel = CancellationToken::new();

        let peers = async {
            local_peer.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            remote_peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");

            remote_peer.write_all(b"hi").await.unwrap();
            let mut buf = [0u8; 2];
            local_peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hi");

            // EOF from the remote ends the whole relay
            drop(remote_peer);
            let mut rest = Vec::new();
            local_peer.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        };

        let relay = relay(
            tokio::io::split(local),
            tokio::io::split(remote),
            64,
            &traffic,
            &cancel,
        );
        let (result, ()) = tokio::join!(relay, peers);
        result.unwrap();
        assert_eq!(traffic.sent(), 5);
        assert_eq!(traffic.received(), 2);
    }

    #[tokio::test]
    async fn test_relay_stops_on_cancel() {
        let (local, _local_peer) = duplex(64);
        let (remote, _remote_peer) = duplex(64);
        let traffic = Traffic::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        relay(
            tokio::io::split(local),
            tokio::io::split(remote),
            64,
            &traffic,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(traffic.sent(), 0);
    }
}
