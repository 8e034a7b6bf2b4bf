//! Receiving side of a UDP channel
//!
//! Records from the peer are demultiplexed by source address into virtual
//! circuits. Each circuit owns a connected socket toward the real target and
//! a listener task that tags replies with the circuit's source and writes
//! them back through the shared channel.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Record, RecordCodec};
use crate::config::UdpConfig;
use crate::forward::ForwardError;
use crate::metrics::METRICS;
use crate::session::{Channel, ChannelWriter};
use crate::util;

type SharedWriter = Arc<tokio::sync::Mutex<FramedWrite<ChannelWriter, RecordCodec>>>;

struct Circuit {
    socket: UdpSocket,
}

/// Live circuits keyed by source address
#[derive(Clone, Default)]
pub struct CircuitTable {
    inner: Arc<Mutex<HashMap<String, Arc<Circuit>>>>,
}

impl CircuitTable {
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn contains(&self, source: &str) -> bool {
        self.inner.lock().contains_key(source)
    }

    fn get(&self, source: &str) -> Option<Arc<Circuit>> {
        self.inner.lock().get(source).cloned()
    }

    fn insert(&self, source: String, circuit: Arc<Circuit>) {
        self.inner.lock().insert(source, circuit);
    }

    /// Remove `source` only if it still maps to `circuit`
    fn remove(&self, source: &str, circuit: &Arc<Circuit>) -> bool {
        let mut inner = self.inner.lock();
        match inner.get(source) {
            Some(current) if Arc::ptr_eq(current, circuit) => {
                inner.remove(source);
                true
            }
            _ => false,
        }
    }

    fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.len();
        inner.clear();
        count
    }
}

/// Demultiplexer for one inbound UDP channel
pub struct CircuitMux {
    target: String,
    config: UdpConfig,
    circuits: CircuitTable,
}

impl CircuitMux {
    pub fn new(target: String, config: UdpConfig) -> Self {
        Self {
            target,
            config,
            circuits: CircuitTable::default(),
        }
    }

    /// Handle onto the live circuit set
    pub fn circuits(&self) -> CircuitTable {
        self.circuits.clone()
    }

    /// Decode records until the channel ends or `cancel` fires, then close
    /// every circuit
    pub async fn run(self, channel: Channel, cancel: CancellationToken) -> Result<(), ForwardError> {
        let (reader, writer) = channel.into_split();
        let max_payload = self.config.max_payload;
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            writer,
            RecordCodec::new(max_payload),
        )));
        let mut records = FramedRead::new(reader, RecordCodec::new(max_payload));
        let mut listeners = JoinSet::new();

        let result = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(_) = listeners.join_next(), if !listeners.is_empty() => continue,
                next = records.next() => next,
            };
            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => break Err(ForwardError::from(e)),
                None => break Ok(()),
            };
            METRICS.udp_record_in();

            let circuit = match self.circuits.get(&record.source) {
                Some(circuit) => circuit,
                None => match self.open_circuit(&record.source, &writer, &mut listeners).await {
                    Some(circuit) => circuit,
                    None => continue,
                },
            };
            if let Err(e) = circuit.socket.send(&record.payload).await {
                debug!(source = %record.source, target = %self.target, error = %e, "Datagram not sent");
            }
        };

        listeners.shutdown().await;
        for _ in 0..self.circuits.clear() {
            METRICS.circuit_closed();
        }
        let _ = writer.lock().await.close().await;
        result
    }

    async fn open_circuit(
        &self,
        source: &str,
        writer: &SharedWriter,
        listeners: &mut JoinSet<()>,
    ) -> Option<Arc<Circuit>> {
        if self.circuits.len() >= self.config.max_circuits {
            METRICS.circuit_dropped();
            warn!(
                %source,
                max = self.config.max_circuits,
                "Circuit limit reached, dropping datagram"
            );
            return None;
        }

        let socket = match util::connect_udp(&self.target).await {
            Ok(socket) => socket,
            Err(e) => {
                debug!(target = %self.target, error = %e, "Failed to open circuit");
                return None;
            }
        };
        let circuit = Arc::new(Circuit { socket });
        self.circuits.insert(source.to_string(), circuit.clone());
        METRICS.circuit_opened();
        debug!(%source, target = %self.target, circuits = self.circuits.len(), "Circuit open");

        listeners.spawn(listen_replies(
            circuit.clone(),
            source.to_string(),
            writer.clone(),
            self.circuits.clone(),
            self.config.circuit_idle,
            self.config.max_payload,
        ));
        Some(circuit)
    }
}

/// Relay replies for one circuit until it idles out or fails
async fn listen_replies(
    circuit: Arc<Circuit>,
    source: String,
    writer: SharedWriter,
    circuits: CircuitTable,
    idle: Duration,
    max_payload: usize,
) {
    // One spare byte tells an oversized reply apart from a full one
    let mut buf = vec![0u8; max_payload + 1];
    loop {
        let n = match tokio::time::timeout(idle, circuit.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(%source, error = %e, "Circuit read failed");
                break;
            }
            Err(_) => {
                debug!(%source, "Circuit idle");
                break;
            }
        };
        if n > max_payload {
            debug!(%source, max_payload, "Oversized reply dropped");
            continue;
        }

        let record = Record::new(source.clone(), Bytes::copy_from_slice(&buf[..n]));
        if let Err(e) = writer.lock().await.send(record).await {
            debug!(%source, error = %e, "Reply not written");
            break;
        }
        METRICS.udp_record_out();
        trace!(%source, len = n, "Reply relayed");
    }

    if circuits.remove(&source, &circuit) {
        METRICS.circuit_closed();
    }
}
