//! Metrics and observability
//!
//! Lock-free counters on the hot path, optionally exported to Prometheus.

mod counters;
mod exporter;

pub use counters::*;
pub use exporter::init_metrics;
