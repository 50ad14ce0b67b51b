//! Server Statistics
//!
//! Lock-free counters shared by the acceptor, the workers and the reaper.
//! [`ServerStats::snapshot`] copies them into a plain struct that can be
//! logged or serialized.

use crate::error::CloseReason;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the whole server.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Connections admitted (ACCEPT)
    pub connections_accepted: AtomicU64,
    /// Admitted connections not yet closed
    pub active_connections: AtomicU64,
    /// Connections turned away (access policy, pool exhaustion, max connections)
    pub connections_rejected: AtomicU64,
    /// Frames handed to a handler or authenticator
    pub frames_processed: AtomicU64,
    /// Bytes read from clients
    pub bytes_read: AtomicU64,
    /// Bytes written to clients
    pub bytes_written: AtomicU64,
    /// Connections closed for idleness
    pub timeouts: AtomicU64,
    /// Rejected login attempts
    pub auth_failures: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the end of an admitted connection.
    pub fn connection_closed(&self, reason: CloseReason) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        if reason == CloseReason::Timeout {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn auth_failed(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub connections_rejected: u64,
    pub frames_processed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub timeouts: u64,
    pub auth_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed(CloseReason::Timeout);
        stats.connection_rejected();

        let snap = stats.snapshot();
        assert_eq!(snap.connections_accepted, 2);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.connections_rejected, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ServerStats::new();
        stats.bytes_read(10);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["bytes_read"], 10);
    }
}
