// src/metrics.rs
use crate::http::Status;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Server-wide counters. Updated with relaxed atomics from the reactor and
/// the workers; a snapshot is only approximately consistent.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub rejected_conns: AtomicUsize,
    pub responses_2xx: AtomicUsize,
    pub responses_4xx: AtomicUsize,
    pub responses_5xx: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub requests: usize,
    pub active_conns: usize,
    pub bytes_sent: usize,
    pub rejected_conns: usize,
    pub responses_2xx: usize,
    pub responses_4xx: usize,
    pub responses_5xx: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            rejected_conns: AtomicUsize::new(0),
            responses_2xx: AtomicUsize::new(0),
            responses_4xx: AtomicUsize::new(0),
            responses_5xx: AtomicUsize::new(0),
        }
    }

    /// Count one staged response under its status class.
    pub fn record_response(&self, status: Status) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
        let class = match status.code() {
            200..=299 => &self.responses_2xx,
            400..=499 => &self.responses_4xx,
            _ => &self.responses_5xx,
        };
        class.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.req_count.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rejected_conns: self.rejected_conns.load(Ordering::Relaxed),
            responses_2xx: self.responses_2xx.load(Ordering::Relaxed),
            responses_4xx: self.responses_4xx.load(Ordering::Relaxed),
            responses_5xx: self.responses_5xx.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
