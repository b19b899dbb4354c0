//! Per-agent traffic counters.
//!
//! Counters are plain relaxed atomics: they are written from whichever task
//! touches the packet and only read for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::{ConnectionState, Role};

#[derive(Debug, Default)]
pub struct Stats {
    pub packets_sent: AtomicU64,
    pub retransmissions: AtomicU64,
    pub timeouts: AtomicU64,
    pub fast_retransmits: AtomicU64,
    pub flow_stalls: AtomicU64,
    pub dropped_injected: AtomicU64,
    pub corrupted_injected: AtomicU64,
    pub corrupt_received: AtomicU64,
    pub duplicates_received: AtomicU64,
    pub out_of_order_received: AtomicU64,
    pub buffer_rejections: AtomicU64,
    pub bytes_delivered: AtomicU64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_sent: get(&self.packets_sent),
            retransmissions: get(&self.retransmissions),
            timeouts: get(&self.timeouts),
            fast_retransmits: get(&self.fast_retransmits),
            flow_stalls: get(&self.flow_stalls),
            dropped_injected: get(&self.dropped_injected),
            corrupted_injected: get(&self.corrupted_injected),
            corrupt_received: get(&self.corrupt_received),
            duplicates_received: get(&self.duplicates_received),
            out_of_order_received: get(&self.out_of_order_received),
            buffer_rejections: get(&self.buffer_rejections),
            bytes_delivered: get(&self.bytes_delivered),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Every datagram handed to the channel, including retransmissions.
    pub packets_sent: u64,
    pub retransmissions: u64,
    /// Retransmission-timer expiries with data in flight.
    pub timeouts: u64,
    /// Go-back-N rounds triggered by a third duplicate ACK.
    pub fast_retransmits: u64,
    pub flow_stalls: u64,
    pub dropped_injected: u64,
    pub corrupted_injected: u64,
    /// Inbound datagrams rejected by the codec.
    pub corrupt_received: u64,
    pub duplicates_received: u64,
    pub out_of_order_received: u64,
    /// In-order data refused because the receive buffer was full.
    pub buffer_rejections: u64,
    /// Payload bytes accepted in order (receiver side).
    pub bytes_delivered: u64,
}

/// What an agent hands back when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub role: Role,
    pub final_state: ConnectionState,
    pub stats: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let s = Stats::default();
        Stats::bump(&s.timeouts);
        Stats::bump(&s.timeouts);
        Stats::add(&s.bytes_delivered, 1000);
        let snap = s.snapshot();
        assert_eq!(snap.timeouts, 2);
        assert_eq!(snap.bytes_delivered, 1000);
        assert_eq!(snap.retransmissions, 0);
    }
}
