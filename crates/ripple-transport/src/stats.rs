//! # Transport Statistics
//!
//! Serializable snapshots of per-connection and per-socket counters. The live
//! counters are relaxed atomics bumped from whichever thread touches the
//! datagram; snapshots are taken on demand.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::memory::MemoryStats;

// ─── Connection ─────────────────────────────────────────────────────────────

/// Snapshot of one connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    /// Datagrams received from the peer (merged batches count once).
    pub packets_in: u64,
    /// Datagrams sent to the peer, resends and batches included.
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Payloads handed to the application.
    pub messages_delivered: u64,
    /// Reliable messages acknowledged by the peer.
    pub messages_acked: u64,
    /// Smoothed RTT in µs.
    pub srtt_us: u64,
    /// RTT variation in µs.
    pub rttvar_us: u64,
    /// Lowest RTT seen in µs (0 before the first sample).
    pub min_rtt_us: u64,
    /// Highest RTT variation seen in µs.
    pub max_rttvar_us: u64,
    /// Current path MTU.
    pub mtu: u16,
}

#[derive(Debug, Default)]
pub(crate) struct ConnectionCounters {
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub messages_acked: AtomicU64,
}

impl ConnectionCounters {
    pub fn record_in(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut ConnectionStats) {
        stats.packets_in = self.packets_in.load(Ordering::Relaxed);
        stats.packets_out = self.packets_out.load(Ordering::Relaxed);
        stats.bytes_in = self.bytes_in.load(Ordering::Relaxed);
        stats.bytes_out = self.bytes_out.load(Ordering::Relaxed);
        stats.messages_delivered = self.messages_delivered.load(Ordering::Relaxed);
        stats.messages_acked = self.messages_acked.load(Ordering::Relaxed);
    }
}

// ─── Socket ─────────────────────────────────────────────────────────────────

/// Snapshot of a whole socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SocketStats {
    /// Live connections, pending handshakes included.
    pub connections: u64,
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Datagrams dropped as malformed or unexpected.
    pub dropped_datagrams: u64,
    /// Connection attempts refused during the handshake.
    pub rejected_handshakes: u64,
    /// Connections ended by a timeout.
    pub timeouts: u64,
    pub memory: MemoryStats,
}

#[derive(Debug, Default)]
pub(crate) struct SocketCounters {
    pub datagrams_in: AtomicU64,
    pub datagrams_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub dropped_datagrams: AtomicU64,
    pub rejected_handshakes: AtomicU64,
    pub timeouts: AtomicU64,
}

impl SocketCounters {
    pub fn record_in(&self, bytes: usize) {
        self.datagrams_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.datagrams_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn dropped(&self) {
        self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, connections: usize, memory: MemoryStats) -> SocketStats {
        SocketStats {
            connections: connections as u64,
            datagrams_in: self.datagrams_in.load(Ordering::Relaxed),
            datagrams_out: self.datagrams_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dropped_datagrams: self.dropped_datagrams.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let counters = ConnectionCounters::default();
        counters.record_in(100);
        counters.record_in(50);
        counters.record_out(10);
        let mut stats = ConnectionStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.packets_in, 2);
        assert_eq!(stats.bytes_in, 150);
        assert_eq!(stats.packets_out, 1);
    }

    #[test]
    fn socket_stats_serialize() {
        let counters = SocketCounters::default();
        counters.record_out(32);
        counters.rejected();
        let stats = counters.snapshot(3, MemoryStats::default());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["connections"], 3);
        assert_eq!(json["bytes_out"], 32);
        assert_eq!(json["rejected_handshakes"], 1);
        assert_eq!(json["memory"]["live_blocks"], 0);
    }
}
