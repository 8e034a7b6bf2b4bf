//! Atomic counters for hot-path metrics
//!
//! Lock-free counters that can be safely updated from any task.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

/// Atomic metrics counters
pub struct Metrics {
    // Session metrics
    pub sessions_total: AtomicU64,
    pub sessions_active: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub reconnect_attempts: AtomicU64,

    // Channel metrics
    pub channels_opened: AtomicU64,
    pub channels_closed: AtomicU64,
    pub channels_rejected: AtomicU64,

    // Traffic metrics
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,

    // UDP multiplexer metrics
    pub udp_records_in: AtomicU64,
    pub udp_records_out: AtomicU64,
    pub circuits_opened: AtomicU64,
    pub circuits_closed: AtomicU64,
    pub circuits_dropped: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sessions_total: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            channels_opened: AtomicU64::new(0),
            channels_closed: AtomicU64::new(0),
            channels_rejected: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            udp_records_in: AtomicU64::new(0),
            udp_records_out: AtomicU64::new(0),
            circuits_opened: AtomicU64::new(0),
            circuits_closed: AtomicU64::new(0),
            circuits_dropped: AtomicU64::new(0),
        }
    }

    // Session tracking
    #[inline]
    pub fn session_opened(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    // Channel tracking
    #[inline]
    pub fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn channel_closed(&self) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn channel_rejected(&self) {
        self.channels_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Traffic tracking
    #[inline]
    pub fn add_bytes_in(&self, count: u64) {
        self.bytes_in.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_out(&self, count: u64) {
        self.bytes_out.fetch_add(count, Ordering::Relaxed);
    }

    // UDP tracking
    #[inline]
    pub fn udp_record_in(&self) {
        self.udp_records_in.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn udp_record_out(&self) {
        self.udp_records_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn circuit_opened(&self) {
        self.circuits_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn circuit_closed(&self) {
        self.circuits_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn circuit_dropped(&self) {
        self.circuits_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Channels currently open
    pub fn channels_open(&self) -> u64 {
        self.channels_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.channels_closed.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            channels_rejected: self.channels_rejected.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            udp_records_in: self.udp_records_in.load(Ordering::Relaxed),
            udp_records_out: self.udp_records_out.load(Ordering::Relaxed),
            circuits_opened: self.circuits_opened.load(Ordering::Relaxed),
            circuits_closed: self.circuits_closed.load(Ordering::Relaxed),
            circuits_dropped: self.circuits_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics for reporting
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub sessions_total: u64,
    pub sessions_active: u64,
    pub sessions_failed: u64,
    pub reconnect_attempts: u64,
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub channels_rejected: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub udp_records_in: u64,
    pub udp_records_out: u64,
    pub circuits_opened: u64,
    pub circuits_closed: u64,
    pub circuits_dropped: u64,
}
