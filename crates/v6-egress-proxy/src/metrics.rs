//! Proxy counters.
//!
//! Plain relaxed atomics, exported as JSON by the admin server.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Proxy metrics collector
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    // Request counters
    pub connect_requests: AtomicU64,
    pub rejected_requests: AtomicU64,

    // Allocation and dial
    pub allocation_failures: AtomicU64,
    pub dial_retries: AtomicU64,
    pub dial_failures: AtomicU64,

    // Tunnel lifecycle
    pub tunnels_established: AtomicU64,
    pub tunnels_active: AtomicU64,
    pub tunnels_closed: AtomicU64,
    pub relay_errors: AtomicU64,

    // Relay volume
    pub bytes_client_to_target: AtomicU64,
    pub bytes_target_to_client: AtomicU64,

    // Reclamation
    pub addresses_reclaimed: AtomicU64,
    pub reclaim_failures: AtomicU64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an incoming CONNECT
    pub fn record_connect(&self) {
        self.connect_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request answered with 4xx
    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_retry(&self) {
        self.dial_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record tunnel established
    pub fn record_tunnel_open(&self) {
        self.tunnels_established.fetch_add(1, Ordering::Relaxed);
        self.tunnels_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record tunnel closed with relayed byte counts
    pub fn record_tunnel_closed(&self, client_to_target: u64, target_to_client: u64, failed: bool) {
        self.tunnels_active.fetch_sub(1, Ordering::Relaxed);
        self.tunnels_closed.fetch_add(1, Ordering::Relaxed);
        self.bytes_client_to_target
            .fetch_add(client_to_target, Ordering::Relaxed);
        self.bytes_target_to_client
            .fetch_add(target_to_client, Ordering::Relaxed);
        if failed {
            self.relay_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the outcome of one sweep
    pub fn record_reclaim(&self, released: u64, failed: u64) {
        self.addresses_reclaimed
            .fetch_add(released, Ordering::Relaxed);
        self.reclaim_failures.fetch_add(failed, Ordering::Relaxed);
    }

    /// Export as a JSON object
    pub fn to_json(&self) -> Value {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        json!({
            "connect_requests": load(&self.connect_requests),
            "rejected_requests": load(&self.rejected_requests),
            "allocation_failures": load(&self.allocation_failures),
            "dial_retries": load(&self.dial_retries),
            "dial_failures": load(&self.dial_failures),
            "tunnels_established": load(&self.tunnels_established),
            "tunnels_active": load(&self.tunnels_active),
            "tunnels_closed": load(&self.tunnels_closed),
            "relay_errors": load(&self.relay_errors),
            "bytes_client_to_target": load(&self.bytes_client_to_target),
            "bytes_target_to_client": load(&self.bytes_target_to_client),
            "addresses_reclaimed": load(&self.addresses_reclaimed),
            "reclaim_failures": load(&self.reclaim_failures),
        })
    }
}
