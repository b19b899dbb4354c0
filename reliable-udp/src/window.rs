//! Go-back-N send window.
//!
//! [`SendWindow`] holds every unacknowledged data packet and decides, for
//! each event, which packets must go on the wire.  It combines:
//!
//! - the congestion window ([`crate::congestion`]), which bounds the number
//!   of held packets,
//! - the peer's advertised window ([`crate::flow`]), which bounds the number
//!   of unacknowledged bytes,
//! - the RTT estimator ([`crate::rtt`]), which sets the retransmission timer.
//!
//! The window never performs I/O.  Every method that needs packets sent
//! returns them, so the caller can release its lock before touching the
//! socket.
//!
//! ```text
//!   base               next_seq
//!     │                    │
//! ────┼────────────────────┼──────────────────▶ seq space
//!     │ <── in flight ───▶ │ <── sendable ───▶
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::AgentConfig;
use crate::congestion::{AckKind, CongestionController, Phase};
use crate::flow::PeerWindow;
use crate::packet::{seq_le, seq_lt, Header, Packet, MAX_PAYLOAD};
use crate::rtt::RttEstimator;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Result of offering a packet to the window.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Transmit this packet (it now carries its sequence number).
    Accepted(Packet),
    /// `floor(cwnd)` packets are already held.
    WindowFull,
    /// The peer's receive window is exhausted.  The first refusal of a stall
    /// episode carries the window to retransmit; later ones are empty.
    FlowStalled(Vec<Packet>),
}

/// Result of processing one inbound ACK.
#[derive(Debug, PartialEq, Eq)]
pub enum AckEvent {
    /// `acked` packets were released.
    Advanced { acked: usize },
    /// A duplicate that did not trigger a retransmission.
    Duplicate,
    /// Third duplicate: retransmit these packets.
    FastRetransmit(Vec<Packet>),
    /// Stale, out of range, or nothing in flight.
    Ignored,
}

// ---------------------------------------------------------------------------
// WindowEntry
// ---------------------------------------------------------------------------

/// A single in-flight packet.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub packet: Packet,
    /// Total number of times this packet has been transmitted.
    pub tx_count: u32,
}

// ---------------------------------------------------------------------------
// SendWindow
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SendWindow {
    /// Oldest unacknowledged sequence number.
    base: u32,
    /// Sequence number of the next new payload byte.
    next_seq: u32,
    entries: VecDeque<WindowEntry>,
    congestion: CongestionController,
    rtt: RttEstimator,
    peer: PeerWindow,
    /// Retransmission deadline; `None` while nothing is in flight.
    deadline: Option<Instant>,
    min_timeout: Duration,
    max_timeout: Duration,
    /// A flow stall has already triggered its retransmission.
    stalled: bool,
}

impl SendWindow {
    /// `start_seq` is the first data sequence number (`ISN + 1`);
    /// `peer_window` the window advertised in the SYN+ACK.
    pub fn new(start_seq: u32, peer_window: u16, config: &AgentConfig) -> Self {
        Self {
            base: start_seq,
            next_seq: start_seq,
            entries: VecDeque::new(),
            congestion: CongestionController::new(config.initial_cwnd, config.ssthresh, start_seq),
            rtt: RttEstimator::new(config.initial_timeout),
            peer: PeerWindow::new(peer_window),
            deadline: None,
            min_timeout: config.min_timeout,
            max_timeout: config.max_timeout,
            stalled: false,
        }
    }

    /// Offer a data packet.  Its sequence number is assigned here.
    pub fn try_send(&mut self, packet: &Packet, now: Instant) -> Admission {
        if self.entries.len() >= self.congestion.window() {
            return Admission::WindowFull;
        }

        let len = packet.payload.len();
        if !self.entries.is_empty() && self.peer.would_exceed(self.in_flight_bytes(), len) {
            if self.stalled {
                return Admission::FlowStalled(Vec::new());
            }
            self.stalled = true;
            log::debug!(
                "flow stall: {} bytes in flight, peer window {}",
                self.in_flight_bytes(),
                self.peer.advertised()
            );
            return Admission::FlowStalled(self.retransmit_all());
        }
        self.stalled = false;

        let mut packet = packet.clone();
        packet.header.seq = self.next_seq;
        self.rtt.on_send(self.next_seq, now);
        self.next_seq = packet.end_seq();
        self.entries.push_back(WindowEntry {
            packet: packet.clone(),
            tx_count: 1,
        });
        if self.deadline.is_none() {
            self.deadline = Some(now + self.rto());
        }
        Admission::Accepted(packet)
    }

    /// The retransmission timer fired: back off and resend everything held.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<Packet> {
        if self.entries.is_empty() {
            self.deadline = None;
            return Vec::new();
        }
        self.congestion.on_timeout();
        let resend = self.retransmit_all();
        self.deadline = Some(now + self.rto());
        resend
    }

    /// Process the cumulative ACK and window carried by `header`.
    pub fn on_ack(&mut self, header: &Header, now: Instant) -> AckEvent {
        let ack = header.ack;
        if seq_lt(self.next_seq, ack) || seq_lt(ack, self.base) {
            return AckEvent::Ignored;
        }
        self.peer.update(header.window);

        if ack == self.base {
            if self.entries.is_empty() {
                return AckEvent::Ignored;
            }
            return match self.congestion.on_ack(ack) {
                AckKind::FastRetransmit => {
                    let resend = self.retransmit_all();
                    self.deadline = Some(now + self.rto());
                    AckEvent::FastRetransmit(resend)
                }
                AckKind::Stale => AckEvent::Ignored,
                _ => AckEvent::Duplicate,
            };
        }

        self.rtt.on_ack(ack, now);
        self.congestion.on_ack(ack);
        self.base = ack;

        let mut acked = 0;
        while let Some(front) = self.entries.front() {
            if seq_le(front.packet.end_seq(), ack) {
                self.entries.pop_front();
                acked += 1;
            } else {
                break;
            }
        }

        self.deadline = if self.entries.is_empty() {
            None
        } else {
            Some(now + self.rto())
        };
        AckEvent::Advanced { acked }
    }

    /// Time left until the retransmission timer fires.
    pub fn next_wait(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    pub fn timeout_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Current retransmission timeout, clamped to the configured bounds.
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rtt.timeout_interval()).clamp(self.min_timeout, self.max_timeout)
    }

    /// Payload size the producer should read next.
    ///
    /// An empty window always admits one full packet, so a shrunken peer
    /// window cannot wedge the sender.
    pub fn chunk_size(&self) -> usize {
        if self.entries.is_empty() {
            return MAX_PAYLOAD;
        }
        match self.peer.allowance(self.in_flight_bytes()) {
            0 => MAX_PAYLOAD,
            n => n.min(MAX_PAYLOAD),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn in_flight_bytes(&self) -> usize {
        self.next_seq.wrapping_sub(self.base) as usize
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter()
    }

    pub fn cwnd(&self) -> f64 {
        self.congestion.cwnd()
    }

    pub fn ssthresh(&self) -> u32 {
        self.congestion.ssthresh()
    }

    pub fn phase(&self) -> Phase {
        self.congestion.phase()
    }

    pub fn peer_window(&self) -> u16 {
        self.peer.advertised()
    }

    /// Go back N: mark every held packet as resent and return copies.
    fn retransmit_all(&mut self) -> Vec<Packet> {
        let rtt = &mut self.rtt;
        self.entries
            .iter_mut()
            .map(|entry| {
                rtt.on_retransmit(entry.packet.header.seq);
                entry.tx_count += 1;
                entry.packet.clone()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    fn config(cwnd: u32, ssthresh: u32) -> AgentConfig {
        AgentConfig {
            initial_cwnd: cwnd,
            ssthresh,
            ..AgentConfig::default()
        }
    }

    fn data(len: usize) -> Packet {
        Packet::new(
            Header {
                flags: flags::ACK,
                ..Header::default()
            },
            vec![7u8; len],
        )
    }

    fn ack(ack: u32, window: u16) -> Header {
        Header {
            ack,
            window,
            flags: flags::ACK,
            ..Header::default()
        }
    }

    fn fill(w: &mut SendWindow, n: usize, len: usize, now: Instant) -> Vec<Packet> {
        (0..n)
            .map(|_| match w.try_send(&data(len), now) {
                Admission::Accepted(p) => p,
                other => panic!("expected admission, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn initial_state() {
        let w = SendWindow::new(100, 0, &config(1, 16));
        assert_eq!(w.base(), 100);
        assert_eq!(w.next_seq(), 100);
        assert!(w.is_empty());
        assert_eq!(w.next_wait(Instant::now()), None);
        assert_eq!(w.chunk_size(), MAX_PAYLOAD);
    }

    #[test]
    fn admission_assigns_sequence_numbers() {
        let now = Instant::now();
        let mut w = SendWindow::new(100, 0, &config(4, 16));
        let sent = fill(&mut w, 3, 10, now);
        let seqs: Vec<u32> = sent.iter().map(|p| p.header.seq).collect();
        assert_eq!(seqs, vec![100, 110, 120]);
        assert_eq!(w.next_seq(), 130);
        assert_eq!(w.in_flight_bytes(), 30);
    }

    #[test]
    fn window_holds_at_most_floor_cwnd() {
        let now = Instant::now();
        let mut w = SendWindow::new(0, 0, &config(3, 16));
        fill(&mut w, 3, 10, now);
        assert_eq!(w.try_send(&data(10), now), Admission::WindowFull);
        assert_eq!(w.len(), 3);
    }

    #[test]
    fn first_admission_arms_timer_and_full_ack_disarms_it() {
        let now = Instant::now();
        let mut w = SendWindow::new(0, 0, &config(4, 16));
        fill(&mut w, 2, 10, now);
        assert_eq!(w.next_wait(now), Some(Duration::from_millis(100)));
        assert!(!w.timeout_due(now));
        assert!(w.timeout_due(now + Duration::from_millis(100)));

        let later = now + Duration::from_millis(5);
        assert_eq!(w.on_ack(&ack(10, 0), later), AckEvent::Advanced { acked: 1 });
        assert!(w.next_wait(later).is_some());
        assert_eq!(w.on_ack(&ack(20, 0), later), AckEvent::Advanced { acked: 1 });
        assert_eq!(w.next_wait(later), None);
        assert!(w.is_empty());
    }

    #[test]
    fn timeout_goes_back_n_once_per_packet() {
        let now = Instant::now();
        let mut w = SendWindow::new(0, 0, &config(4, 16));
        let sent = fill(&mut w, 4, 10, now);

        let resent = w.on_timeout(now + Duration::from_millis(100));
        assert_eq!(resent, sent);
        assert!(w.entries().all(|e| e.tx_count == 2));
        assert_eq!(w.cwnd(), 1.0);
        assert_eq!(w.ssthresh(), 2);
        assert_eq!(w.phase(), Phase::SlowStart);
    }

    #[test]
    fn each_expiry_resends_the_held_window() {
        let now = Instant::now();
        let mut w = SendWindow::new(0, 0, &config(4, 16));
        let sent = fill(&mut w, 4, 10, now);

        let mut resent = 0;
        for i in 1..=3 {
            let batch = w.on_timeout(now + Duration::from_millis(100 * i));
            assert_eq!(batch, sent);
            resent += batch.len();
        }
        assert_eq!(resent, 3 * sent.len());
        assert!(w.entries().all(|e| e.tx_count == 4));
        // cwnd collapsed but nothing held was released.
        assert_eq!(w.cwnd(), 1.0);
        assert_eq!(w.len(), 4);
    }

    /// Karn: the ACK of a resent window must not produce an RTT sample.
    #[test]
    fn resent_window_is_not_sampled() {
        let now = Instant::now();
        let mut w = SendWindow::new(0, 0, &config(4, 16));
        fill(&mut w, 3, 10, now);
        assert_eq!(w.rtt.tracking(), Some(0));

        w.on_timeout(now + Duration::from_millis(100));
        assert_eq!(w.rtt.tracking(), None);

        w.on_ack(&ack(30, 0), now + Duration::from_millis(400));
        assert_eq!(w.rtt.estimated_rtt(), 100.0);
        assert_eq!(w.rtt.deviation_rtt(), 0.0);
    }

    #[test]
    fn timeout_on_empty_window_does_nothing() {
        let mut w = SendWindow::new(0, 0, &config(4, 16));
        assert!(w.on_timeout(Instant::now()).is_empty());
        assert_eq!(w.cwnd(), 4.0);
    }

    #[test]
    fn triple_duplicate_triggers_fast_retransmit() {
        let now = Instant::now();
        let mut w = SendWindow::new(0, 0, &config(8, 64));
        fill(&mut w, 8, 100, now);

        assert_eq!(w.on_ack(&ack(100, 0), now), AckEvent::Advanced { acked: 1 });
        assert_eq!(w.cwnd(), 9.0);
        assert_eq!(w.on_ack(&ack(100, 0), now), AckEvent::Duplicate);
        assert_eq!(w.on_ack(&ack(100, 0), now), AckEvent::Duplicate);
        match w.on_ack(&ack(100, 0), now) {
            AckEvent::FastRetransmit(packets) => {
                assert_eq!(packets.len(), 7);
                assert_eq!(packets[0].header.seq, 100);
            }
            other => panic!("expected fast retransmit, got {other:?}"),
        }
        assert_eq!(w.ssthresh(), 5);
        assert_eq!(w.cwnd(), 8.0);
        assert_eq!(w.phase(), Phase::FastRecovery);

        assert_eq!(w.on_ack(&ack(100, 0), now), AckEvent::Duplicate);
        assert_eq!(w.cwnd(), 9.0);
        assert_eq!(w.on_ack(&ack(800, 0), now), AckEvent::Advanced { acked: 7 });
        assert_eq!(w.cwnd(), 5.0);
        assert_eq!(w.phase(), Phase::CongestionAvoidance);
    }

    #[test]
    fn duplicates_with_nothing_in_flight_are_not_counted() {
        let now = Instant::now();
        let mut w = SendWindow::new(0, 0, &config(4, 16));
        fill(&mut w, 1, 10, now);
        w.on_ack(&ack(10, 0), now);
        for _ in 0..5 {
            assert_eq!(w.on_ack(&ack(10, 0), now), AckEvent::Ignored);
        }
        assert_eq!(w.phase(), Phase::SlowStart);
    }

    #[test]
    fn ack_beyond_next_seq_is_ignored() {
        let now = Instant::now();
        let mut w = SendWindow::new(0, 0, &config(4, 16));
        fill(&mut w, 1, 10, now);
        assert_eq!(w.on_ack(&ack(1000, 0), now), AckEvent::Ignored);
        assert_eq!(w.base(), 0);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn flow_stall_retransmits_once_per_episode() {
        let now = Instant::now();
        let mut w = SendWindow::new(0, 1500, &config(8, 16));
        fill(&mut w, 1, 1000, now);
        assert_eq!(w.chunk_size(), 500);

        match w.try_send(&data(1000), now) {
            Admission::FlowStalled(p) => assert_eq!(p.len(), 1),
            other => panic!("expected stall, got {other:?}"),
        }
        assert_eq!(w.try_send(&data(1000), now), Admission::FlowStalled(vec![]));

        // Receiver now advertises less than one packet, but the window is
        // empty so one packet is still admitted.
        w.on_ack(&ack(1000, 200), now);
        assert!(matches!(w.try_send(&data(1000), now), Admission::Accepted(_)));
        assert_eq!(w.peer_window(), 200);
    }

    #[test]
    fn rto_is_clamped() {
        let cfg = AgentConfig {
            initial_timeout: Duration::from_millis(5),
            min_timeout: Duration::from_millis(20),
            ..AgentConfig::default()
        };
        let w = SendWindow::new(0, 0, &cfg);
        assert_eq!(w.rto(), Duration::from_millis(20));
    }

    #[test]
    fn window_survives_sequence_wrap() {
        let now = Instant::now();
        let start = u32::MAX - 5;
        let mut w = SendWindow::new(start, 0, &config(4, 16));
        fill(&mut w, 2, 10, now);
        let end = start.wrapping_add(20);
        assert_eq!(w.on_ack(&ack(end, 0), now), AckEvent::Advanced { acked: 2 });
        assert_eq!(w.base(), end);
    }
}
