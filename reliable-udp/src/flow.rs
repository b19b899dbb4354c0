//! Flow control: the receive buffer and the sender's view of it.
//!
//! - [`ReceiveBuffer`] holds in-order payloads until the application task
//!   drains them.  Every ACK advertises the space left in it.
//! - [`PeerWindow`] is the sender's copy of the last advertised window.  The
//!   sender keeps its unacknowledged bytes within it.
//!
//! Both sides count bytes, never packets.

use std::collections::VecDeque;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    /// Accepting the payload would overflow the receive buffer.
    #[error("receive buffer full: {requested} bytes offered, {available} free")]
    Rejected { available: usize, requested: usize },
}

// ---------------------------------------------------------------------------
// ReceiveBuffer
// ---------------------------------------------------------------------------

/// Bounded buffer of delivered-but-unread payloads.
///
/// ```text
///  last_byte_read      last_byte_received
///        │                     │
///  ──────┼─────────────────────┼───────────────────▶ stream offset
///        │ <──── buffered ───▶ │ <── available ──▶ │
///                                          max_buffer_size
/// ```
#[derive(Debug)]
pub struct ReceiveBuffer {
    max_buffer_size: usize,
    last_byte_read: u64,
    last_byte_received: u64,
    chunks: VecDeque<Vec<u8>>,
    end_of_stream: bool,
}

impl ReceiveBuffer {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            max_buffer_size,
            last_byte_read: 0,
            last_byte_received: 0,
            chunks: VecDeque::new(),
            end_of_stream: false,
        }
    }

    /// Free space in bytes.
    pub fn available(&self) -> usize {
        let buffered = (self.last_byte_received - self.last_byte_read) as usize;
        self.max_buffer_size.saturating_sub(buffered)
    }

    /// Window to advertise in the next ACK.
    pub fn advertised_window(&self) -> u16 {
        self.available().min(u16::MAX as usize) as u16
    }

    /// Buffer an in-order payload.  Returns the new advertised window.
    pub fn try_deliver(&mut self, data: &[u8]) -> Result<u16, FlowError> {
        let available = self.available();
        if data.len() > available {
            return Err(FlowError::Rejected {
                available,
                requested: data.len(),
            });
        }
        if !data.is_empty() {
            self.chunks.push_back(data.to_vec());
            self.last_byte_received += data.len() as u64;
        }
        Ok(self.advertised_window())
    }

    /// Hand every buffered chunk to the caller, freeing their space.
    pub fn take_ready(&mut self) -> Vec<Vec<u8>> {
        let ready: Vec<Vec<u8>> = self.chunks.drain(..).collect();
        self.last_byte_read += ready.iter().map(|c| c.len() as u64).sum::<u64>();
        ready
    }

    /// The peer has finished sending; no further [`try_deliver`](Self::try_deliver) follows.
    pub fn mark_end_of_stream(&mut self) {
        self.end_of_stream = true;
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Total bytes accepted so far.
    pub fn bytes_received(&self) -> u64 {
        self.last_byte_received
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PeerWindow
// ---------------------------------------------------------------------------

/// Last window advertised by the receiver.
///
/// A zero window means the receiver has not advertised one, so nothing is
/// enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerWindow {
    advertised: u16,
}

impl PeerWindow {
    pub fn new(advertised: u16) -> Self {
        Self { advertised }
    }

    pub fn update(&mut self, advertised: u16) {
        self.advertised = advertised;
    }

    pub fn advertised(&self) -> u16 {
        self.advertised
    }

    /// Bytes that may still be put in flight.
    pub fn allowance(&self, in_flight: usize) -> usize {
        if self.advertised == 0 {
            usize::MAX
        } else {
            (self.advertised as usize).saturating_sub(in_flight)
        }
    }

    /// `true` when sending `len` more bytes would overrun the window.
    pub fn would_exceed(&self, in_flight: usize, len: usize) -> bool {
        self.advertised != 0 && in_flight + len > self.advertised as usize
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_advertises_capacity() {
        let b = ReceiveBuffer::new(32_000);
        assert_eq!(b.available(), 32_000);
        assert_eq!(b.advertised_window(), 32_000);
        assert!(b.is_empty());
    }

    #[test]
    fn advertised_window_caps_at_u16() {
        let b = ReceiveBuffer::new(1 << 20);
        assert_eq!(b.advertised_window(), u16::MAX);
    }

    #[test]
    fn delivery_shrinks_window() {
        let mut b = ReceiveBuffer::new(3000);
        assert_eq!(b.try_deliver(&[0; 1000]).unwrap(), 2000);
        assert_eq!(b.try_deliver(&[0; 1000]).unwrap(), 1000);
        assert_eq!(b.bytes_received(), 2000);
    }

    #[test]
    fn overflow_is_rejected_without_side_effects() {
        let mut b = ReceiveBuffer::new(1500);
        b.try_deliver(&[1; 1000]).unwrap();
        assert_eq!(
            b.try_deliver(&[2; 1000]),
            Err(FlowError::Rejected {
                available: 500,
                requested: 1000
            })
        );
        assert_eq!(b.available(), 500);
        assert_eq!(b.take_ready(), vec![vec![1; 1000]]);
    }

    #[test]
    fn exact_fit_is_accepted() {
        let mut b = ReceiveBuffer::new(1000);
        assert_eq!(b.try_deliver(&[0; 1000]).unwrap(), 0);
    }

    #[test]
    fn take_ready_frees_space_in_order() {
        let mut b = ReceiveBuffer::new(2000);
        b.try_deliver(b"abc").unwrap();
        b.try_deliver(b"def").unwrap();
        assert_eq!(b.take_ready(), vec![b"abc".to_vec(), b"def".to_vec()]);
        assert_eq!(b.available(), 2000);
        assert!(b.take_ready().is_empty());
    }

    #[test]
    fn end_of_stream_flag() {
        let mut b = ReceiveBuffer::new(1000);
        assert!(!b.is_end_of_stream());
        b.mark_end_of_stream();
        assert!(b.is_end_of_stream());
    }

    #[test]
    fn zero_peer_window_is_unlimited() {
        let w = PeerWindow::default();
        assert_eq!(w.allowance(50_000), usize::MAX);
        assert!(!w.would_exceed(50_000, 1000));
    }

    #[test]
    fn peer_window_bounds_in_flight_bytes() {
        let mut w = PeerWindow::new(4000);
        assert_eq!(w.allowance(1000), 3000);
        assert!(!w.would_exceed(3000, 1000));
        assert!(w.would_exceed(3001, 1000));
        w.update(1000);
        assert_eq!(w.allowance(3000), 0);
    }
}
