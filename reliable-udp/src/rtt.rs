//! Round-trip-time estimation.
//!
//! [`RttEstimator`] follows Jacobson's algorithm:
//!
//! ```text
//! EstimatedRTT = 7/8 · EstimatedRTT + 1/8 · Sample
//! DevRTT       = 3/4 · DevRTT       + 1/4 · |Sample − EstimatedRTT|
//! Timeout      = EstimatedRTT + 4 · DevRTT
//! ```
//!
//! At most one segment is timed at a time.  Karn's rule applies: if the timed
//! segment is retransmitted its sample is discarded, because the ACK cannot
//! be attributed to a particular transmission.

use std::time::{Duration, Instant};

use crate::packet::seq_lt;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    estimated_rtt: f64,
    /// Mean deviation in milliseconds.
    deviation_rtt: f64,
    /// Sequence number being timed and when it was sent.
    tracking: Option<(u32, Instant)>,
}

impl RttEstimator {
    /// Seed the estimator so the first timeout equals `initial`.
    pub fn new(initial: Duration) -> Self {
        Self {
            estimated_rtt: millis(initial),
            deviation_rtt: 0.0,
            tracking: None,
        }
    }

    /// Start timing `seq` unless a sample is already in progress.
    pub fn on_send(&mut self, seq: u32, now: Instant) {
        if self.tracking.is_none() {
            self.tracking = Some((seq, now));
        }
    }

    /// Feed a cumulative ACK.  Returns the sample taken, if the ACK covers
    /// the tracked sequence number.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> Option<Duration> {
        let (seq, started) = self.tracking?;
        if !seq_lt(seq, ack) {
            return None;
        }
        self.tracking = None;

        let sample = now.saturating_duration_since(started);
        let ms = millis(sample);
        self.estimated_rtt = 0.875 * self.estimated_rtt + 0.125 * ms;
        self.deviation_rtt = 0.75 * self.deviation_rtt + 0.25 * (ms - self.estimated_rtt).abs();
        Some(sample)
    }

    /// Karn's rule: a retransmitted segment must not be sampled.
    pub fn on_retransmit(&mut self, seq: u32) {
        if matches!(self.tracking, Some((tracked, _)) if tracked == seq) {
            self.tracking = None;
        }
    }

    /// `floor(EstimatedRTT + 4 · DevRTT)` in milliseconds.
    pub fn timeout_interval(&self) -> u64 {
        (self.estimated_rtt + 4.0 * self.deviation_rtt).floor() as u64
    }

    pub fn estimated_rtt(&self) -> f64 {
        self.estimated_rtt
    }

    pub fn deviation_rtt(&self) -> f64 {
        self.deviation_rtt
    }

    pub fn tracking(&self) -> Option<u32> {
        self.tracking.map(|(seq, _)| seq)
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_timeout_is_initial() {
        let rtt = RttEstimator::new(Duration::from_millis(100));
        assert_eq!(rtt.timeout_interval(), 100);
        assert_eq!(rtt.tracking(), None);
    }

    #[test]
    fn one_sample_updates_both_terms() {
        let mut rtt = RttEstimator::new(Duration::from_millis(100));
        let t0 = Instant::now();
        rtt.on_send(1, t0);
        let sample = rtt.on_ack(1001, t0 + Duration::from_millis(20)).unwrap();
        assert_eq!(sample, Duration::from_millis(20));
        // est = 87.5 + 2.5 = 90; dev = 0.25 * |20 - 90| = 17.5
        assert!((rtt.estimated_rtt() - 90.0).abs() < 1e-6);
        assert!((rtt.deviation_rtt() - 17.5).abs() < 1e-6);
        assert_eq!(rtt.timeout_interval(), 160);
    }

    #[test]
    fn converges_to_constant_delay() {
        let mut rtt = RttEstimator::new(Duration::from_millis(500));
        let mut now = Instant::now();
        for i in 0..200u32 {
            rtt.on_send(i, now);
            now += Duration::from_millis(10);
            rtt.on_ack(i + 1, now).unwrap();
        }
        assert!((rtt.estimated_rtt() - 10.0).abs() < 0.01);
        assert!(rtt.deviation_rtt() < 0.01);
        assert_eq!(rtt.timeout_interval(), 10);
    }

    #[test]
    fn only_one_sample_tracked() {
        let mut rtt = RttEstimator::new(Duration::from_millis(100));
        let t0 = Instant::now();
        rtt.on_send(1, t0);
        rtt.on_send(500, t0 + Duration::from_millis(5));
        assert_eq!(rtt.tracking(), Some(1));
    }

    #[test]
    fn ack_not_covering_tracked_seq_takes_no_sample() {
        let mut rtt = RttEstimator::new(Duration::from_millis(100));
        let t0 = Instant::now();
        rtt.on_send(1000, t0);
        assert!(rtt.on_ack(1000, t0 + Duration::from_millis(1)).is_none());
        assert!(rtt.on_ack(500, t0 + Duration::from_millis(1)).is_none());
        assert_eq!(rtt.tracking(), Some(1000));
    }

    #[test]
    fn karn_discards_retransmitted_sample() {
        let mut rtt = RttEstimator::new(Duration::from_millis(100));
        let t0 = Instant::now();
        rtt.on_send(7, t0);
        rtt.on_retransmit(8);
        assert_eq!(rtt.tracking(), Some(7));
        rtt.on_retransmit(7);
        assert_eq!(rtt.tracking(), None);
        assert!(rtt.on_ack(100, t0 + Duration::from_millis(3)).is_none());
        assert_eq!(rtt.timeout_interval(), 100);
    }

    #[test]
    fn sample_across_sequence_wrap() {
        let mut rtt = RttEstimator::new(Duration::from_millis(100));
        let t0 = Instant::now();
        rtt.on_send(u32::MAX - 10, t0);
        assert!(rtt.on_ack(5, t0 + Duration::from_millis(1)).is_some());
    }
}
