//! Reno-style congestion control.
//!
//! The congestion window is counted in packets, not bytes.  It grows by one
//! packet per new ACK in slow start and by roughly one packet per round trip
//! in congestion avoidance.  Three duplicate ACKs halve it (fast recovery);
//! a retransmission timeout collapses it to one packet.
//!
//! ```text
//! new ACK        SS: cwnd += 1 (→ CA once cwnd ≥ ssthresh)
//!                CA: cwnd += 1 / ceil(cwnd)
//!                FR: cwnd = ssthresh (→ CA)
//! duplicate ACK  FR: cwnd += 1, otherwise dup += 1
//! 3rd duplicate  ssthresh = ceil(cwnd / 2), cwnd = ssthresh + 3 (→ FR)
//! timeout        ssthresh = ceil(cwnd / 2), cwnd = 1 (→ SS)
//! ```

use crate::packet::seq_lt;

/// Duplicate ACKs that trigger fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

/// How the controller classified one cumulative ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// The ACK acknowledged new data.
    New,
    /// The n-th duplicate, below the fast-retransmit threshold.
    Duplicate(u32),
    /// The third duplicate: the caller must resend the window.
    FastRetransmit,
    /// A duplicate during fast recovery; the window was inflated.
    Inflated,
    /// Older than the last ACK seen.
    Stale,
}

#[derive(Debug, Clone)]
pub struct CongestionController {
    cwnd: f64,
    ssthresh: u32,
    phase: Phase,
    dup_ack_count: u32,
    last_ack_seen: u32,
}

impl CongestionController {
    /// `start_ack` is the cumulative ACK that acknowledges nothing yet sent,
    /// i.e. the first data sequence number.
    pub fn new(initial_cwnd: u32, ssthresh: u32, start_ack: u32) -> Self {
        let phase = if initial_cwnd >= ssthresh {
            Phase::CongestionAvoidance
        } else {
            Phase::SlowStart
        };
        Self {
            cwnd: f64::from(initial_cwnd.max(1)),
            ssthresh: ssthresh.max(1),
            phase,
            dup_ack_count: 0,
            last_ack_seen: start_ack,
        }
    }

    pub fn on_ack(&mut self, ack: u32) -> AckKind {
        if seq_lt(self.last_ack_seen, ack) {
            self.last_ack_seen = ack;
            self.dup_ack_count = 0;
            match self.phase {
                Phase::SlowStart => {
                    self.cwnd += 1.0;
                    if self.cwnd >= f64::from(self.ssthresh) {
                        self.phase = Phase::CongestionAvoidance;
                    }
                }
                Phase::CongestionAvoidance => {
                    self.cwnd += 1.0 / self.cwnd.ceil();
                }
                Phase::FastRecovery => {
                    self.cwnd = f64::from(self.ssthresh);
                    self.phase = Phase::CongestionAvoidance;
                }
            }
            return AckKind::New;
        }

        if ack != self.last_ack_seen {
            return AckKind::Stale;
        }

        if self.phase == Phase::FastRecovery {
            self.cwnd += 1.0;
            return AckKind::Inflated;
        }

        self.dup_ack_count += 1;
        if self.dup_ack_count < DUP_ACK_THRESHOLD {
            return AckKind::Duplicate(self.dup_ack_count);
        }

        self.ssthresh = self.half_window();
        self.cwnd = f64::from(self.ssthresh) + 3.0;
        self.phase = Phase::FastRecovery;
        log::debug!(
            "fast recovery: ssthresh={} cwnd={}",
            self.ssthresh,
            self.cwnd
        );
        AckKind::FastRetransmit
    }

    /// Retransmission timer expired.
    pub fn on_timeout(&mut self) {
        self.ssthresh = self.half_window();
        self.cwnd = 1.0;
        self.dup_ack_count = 0;
        self.phase = Phase::SlowStart;
    }

    /// Maximum number of unacknowledged packets: `floor(cwnd)`, at least 1.
    pub fn window(&self) -> usize {
        (self.cwnd.floor() as usize).max(1)
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn dup_ack_count(&self) -> u32 {
        self.dup_ack_count
    }

    fn half_window(&self) -> u32 {
        ((self.cwnd / 2.0).ceil() as u32).max(1)
    }
}
