//! Prometheus metrics exporter
//!
//! HTTP endpoint for Prometheus scraping.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

use super::counters::{MetricsSnapshot, METRICS};
use crate::config::MetricsConfig;

/// Monotonic counters exported as deltas: (name, description, accessor)
const COUNTERS: &[(&str, &str, fn(&MetricsSnapshot) -> u64)] = &[
    ("quictun_sessions_total", "Total sessions established", |s| s.sessions_total),
    ("quictun_sessions_failed", "Sessions that failed the handshake", |s| s.sessions_failed),
    ("quictun_reconnect_attempts", "Client connection attempts", |s| s.reconnect_attempts),
    ("quictun_channels_opened", "Virtual channels opened", |s| s.channels_opened),
    ("quictun_channels_closed", "Virtual channels closed", |s| s.channels_closed),
    ("quictun_channels_rejected", "Inbound channels rejected", |s| s.channels_rejected),
    ("quictun_bytes_in", "Bytes relayed toward the tunnel", |s| s.bytes_in),
    ("quictun_bytes_out", "Bytes relayed out of the tunnel", |s| s.bytes_out),
    ("quictun_udp_records_in", "UDP records decoded", |s| s.udp_records_in),
    ("quictun_udp_records_out", "UDP records encoded", |s| s.udp_records_out),
    ("quictun_circuits_opened", "UDP virtual circuits opened", |s| s.circuits_opened),
    ("quictun_circuits_closed", "UDP virtual circuits closed", |s| s.circuits_closed),
    ("quictun_circuits_dropped", "UDP datagrams dropped at the circuit cap", |s| s.circuits_dropped),
];

/// Initialize the Prometheus metrics exporter
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    for (name, description, _) in COUNTERS {
        describe_counter!(*name, *description);
    }
    describe_gauge!("quictun_sessions_active", "Currently active sessions");
    describe_gauge!("quictun_channels_open", "Currently open channels");

    PrometheusBuilder::new()
        .with_http_listener(config.bind_addr)
        .install()?;

    // Sync atomic counters into the metrics registry
    tokio::spawn(sync_metrics_task());

    Ok(())
}

/// Background task that periodically syncs the atomic counters to the metrics crate
async fn sync_metrics_task() {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last = MetricsSnapshot::default();

    loop {
        interval.tick().await;
        let snapshot = METRICS.snapshot();

        for (name, _, read) in COUNTERS {
            let delta = read(&snapshot).saturating_sub(read(&last));
            if delta > 0 {
                counter!(*name).increment(delta);
            }
        }

        gauge!("quictun_sessions_active").set(snapshot.sessions_active as f64);
        gauge!("quictun_channels_open").set(METRICS.channels_open() as f64);

        last = snapshot;
    }
}
