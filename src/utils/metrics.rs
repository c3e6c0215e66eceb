//! Observability and Metrics
//!
//! Counters describing relay and peer health: connections, handshakes,
//! envelope traffic, and the per-frame and per-handler failures that are
//! absorbed instead of closing a connection.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for relay and peer operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Successful handshakes
    pub handshakes_success: AtomicU64,
    /// Rejected handshakes
    pub handshakes_failed: AtomicU64,
    /// Envelopes received from peers
    pub envelopes_received: AtomicU64,
    /// Envelope copies written to peers
    pub envelopes_forwarded: AtomicU64,
    /// Bytes received in frame payloads
    pub bytes_received: AtomicU64,
    /// Envelopes that matched no target
    pub routing_failures: AtomicU64,
    /// Frames dropped because they arrived before authentication
    pub unauthenticated_frames: AtomicU64,
    /// Envelopes or packets that failed to decode
    pub decode_failures: AtomicU64,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            envelopes_received: AtomicU64::new(0),
            envelopes_forwarded: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            routing_failures: AtomicU64::new(0),
            unauthenticated_frames: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a handshake attempt
    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handshake
    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an inbound envelope
    pub fn envelope_received(&self, byte_count: u64) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record envelope copies handed to peer connections
    pub fn envelopes_forwarded(&self, count: u64) {
        self.envelopes_forwarded.fetch_add(count, Ordering::Relaxed);
    }

    /// Record an envelope that resolved to no target
    pub fn routing_failure(&self) {
        self.routing_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame dropped before authentication
    pub fn unauthenticated_frame(&self) {
        self.unauthenticated_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decode failure
    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handler failure
    pub fn handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            envelopes_forwarded: self.envelopes_forwarded.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            unauthenticated_frames: self.unauthenticated_frames.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            envelopes_received = snapshot.envelopes_received,
            envelopes_forwarded = snapshot.envelopes_forwarded,
            bytes_received = snapshot.bytes_received,
            routing_failures = snapshot.routing_failures,
            unauthenticated_frames = snapshot.unauthenticated_frames,
            decode_failures = snapshot.decode_failures,
            handler_failures = snapshot.handler_failures,
            uptime_seconds = snapshot.uptime_seconds,
            "Relay metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub envelopes_received: u64,
    pub envelopes_forwarded: u64,
    pub bytes_received: u64,
    pub routing_failures: u64,
    pub unauthenticated_frames: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub uptime_seconds: u64,
}
