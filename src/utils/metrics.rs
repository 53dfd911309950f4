//! Diagnostics and Metrics
//!
//! Per-handler traffic records and connection health counters.
//!
//! A [`Diagnostics`] instance is shared (through `Arc`) by the dispatchers and
//! connections of one application. Traffic records are inactive by default
//! and cost one atomic load per message until enabled. Counters use atomics
//! and are always on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info};

/// Aggregate traffic for one handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataRecordInfo {
    pub total_size: u64,
    pub count: u64,
}

/// Per-handler byte and message accounting
#[derive(Debug, Default)]
pub struct DataRecord {
    active: AtomicBool,
    records: Mutex<HashMap<String, DataRecordInfo>>,
}

impl DataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Record one message of `size` bytes for `handler`. Ignored while inactive.
    pub fn try_add(&self, handler: &str, size: usize) {
        if !self.is_active() {
            return;
        }

        if let Ok(mut records) = self.records.lock() {
            let info = records.entry(handler.to_string()).or_default();
            info.total_size += size as u64;
            info.count += 1;
        }
    }

    pub fn get(&self, handler: &str) -> Option<DataRecordInfo> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(handler).copied())
    }

    /// Copy of every record
    pub fn records(&self) -> HashMap<String, DataRecordInfo> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

/// Traffic records and health counters for one application
#[derive(Debug)]
pub struct Diagnostics {
    /// Bytes sent per handler
    pub sent: DataRecord,
    /// Bytes handled per handler
    pub handled: DataRecord,
    /// Connections created
    pub connections: AtomicU64,
    /// Connections that ended, by either side
    pub disconnects: AtomicU64,
    /// Malformed or unauthorized data received from peers
    pub protocol_errors: AtomicU64,
    /// Errors reported by the transport
    pub transport_errors: AtomicU64,
    start_time: Instant,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            sent: DataRecord::new(),
            handled: DataRecord::new(),
            connections: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Turn both traffic records on or off
    pub fn set_recording(&self, active: bool) {
        self.sent.set_active(active);
        self.handled.set_active(active);
    }

    pub fn connection_established(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log counters and, if recording, the per-handler totals
    pub fn log_diagnostics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections = snapshot.connections,
            disconnects = snapshot.disconnects,
            protocol_errors = snapshot.protocol_errors,
            transport_errors = snapshot.transport_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Network diagnostics snapshot"
        );

        for (handler, info) in self.sent.records() {
            debug!(handler = %handler, bytes = info.total_size, count = info.count, "Sent");
        }
        for (handler, info) in self.handled.records() {
            debug!(handler = %handler, bytes = info.total_size, count = info.count, "Handled");
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub connections: u64,
    pub disconnects: u64,
    pub protocol_errors: u64,
    pub transport_errors: u64,
    pub uptime_seconds: u64,
}
