//! Traffic counters shared between a session and its observers

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters updated by the forwarding loops
///
/// Readers take a [`StatsSnapshot`]; reading never blocks the loops.
#[derive(Debug, Default)]
pub struct SessionStats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    dropped_frames: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Packets read from the interface and sent
    pub tx_packets: u64,
    /// Plaintext bytes sent
    pub tx_bytes: u64,
    /// Packets received and written to the interface
    pub rx_packets: u64,
    /// Plaintext bytes received
    pub rx_bytes: u64,
    /// Frames discarded because they failed to decrypt
    pub dropped_frames: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one packet sent to the network
    pub fn record_egress(&self, len: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Count one packet written to the interface
    pub fn record_ingress(&self, len: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Count one frame dropped on the receive path
    pub fn record_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}
