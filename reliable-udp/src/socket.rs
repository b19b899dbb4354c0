//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] on the receive side and raw bytes on the send
//! side (the [`crate::simulator`] layer may have mangled them on purpose).
//! All protocol logic lives elsewhere; this module owns only byte I/O,
//! receive timeouts and cancellation.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{Packet, PacketError, DATAGRAM_LEN};
use crate::shutdown::KillSwitch;

/// Receive buffer size.  Larger than any valid datagram so oversized input
/// is reported as malformed instead of being silently truncated.
const RECV_BUF: usize = 2 * DATAGRAM_LEN;

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The socket was closed on purpose (agent stopped).
    #[error("socket closed")]
    Closed,
}

/// Outcome of one bounded receive.
#[derive(Debug)]
pub enum Inbound {
    /// A datagram that decoded cleanly.
    Packet(Packet, SocketAddr),
    /// A datagram that failed checksum or framing checks.
    Corrupt(PacketError, SocketAddr),
    /// Nothing arrived before the deadline.
    TimedOut,
}

/// An async, packet-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    closed: KillSwitch,
}

impl Socket {
    /// Bind a new socket to `local_addr`.  Flipping `closed` closes it.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr, closed: KillSwitch) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            closed,
        })
    }

    /// Send pre-encoded bytes as a single UDP datagram to `dest`.
    pub async fn send_bytes(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), SocketError> {
        if self.closed.is_killed() {
            return Err(SocketError::Closed);
        }
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it.
    ///
    /// `wait = None` blocks until a datagram arrives or the socket is closed.
    /// Closing the socket wakes a pending receive with
    /// [`SocketError::Closed`].
    pub async fn recv_from(&self, wait: Option<Duration>) -> Result<Inbound, SocketError> {
        if self.closed.is_killed() {
            return Err(SocketError::Closed);
        }

        let mut buf = [0u8; RECV_BUF];
        let received = tokio::select! {
            r = Self::recv_bounded(&self.inner, &mut buf, wait) => r?,
            _ = self.closed.killed() => return Err(SocketError::Closed),
        };

        Ok(match received {
            None => Inbound::TimedOut,
            Some((n, addr)) => match Packet::decode(&buf[..n]) {
                Ok(packet) => Inbound::Packet(packet, addr),
                Err(e) => Inbound::Corrupt(e, addr),
            },
        })
    }

    /// Close the socket: every pending and future receive fails with
    /// [`SocketError::Closed`].
    pub fn close(&self) {
        self.closed.kill();
    }

    async fn recv_bounded(
        inner: &UdpSocket,
        buf: &mut [u8],
        wait: Option<Duration>,
    ) -> std::io::Result<Option<(usize, SocketAddr)>> {
        match wait {
            None => inner.recv_from(buf).await.map(Some),
            Some(wait) => match tokio::time::timeout(wait, inner.recv_from(buf)).await {
                Ok(r) => r.map(Some),
                Err(_elapsed) => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{flags, Header};

    async fn ephemeral() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap(), KillSwitch::new())
            .await
            .expect("bind failed")
    }

    #[tokio::test]
    async fn packet_crosses_loopback() {
        let a = ephemeral().await;
        let b = ephemeral().await;
        let pkt = Packet::new(
            Header {
                seq: 5,
                flags: flags::SYN,
                ..Header::default()
            },
            vec![],
        );
        a.send_bytes(&pkt.encode(), b.local_addr).await.unwrap();

        match b.recv_from(Some(Duration::from_secs(2))).await.unwrap() {
            Inbound::Packet(got, from) => {
                assert_eq!(got.header.seq, 5);
                assert_eq!(from, a.local_addr);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_is_reported_corrupt() {
        let a = ephemeral().await;
        let b = ephemeral().await;
        a.send_bytes(&[0xFF; 30], b.local_addr).await.unwrap();
        assert!(matches!(
            b.recv_from(Some(Duration::from_secs(2))).await.unwrap(),
            Inbound::Corrupt(_, _)
        ));
    }

    #[tokio::test]
    async fn timeout_returns_timed_out() {
        let a = ephemeral().await;
        assert!(matches!(
            a.recv_from(Some(Duration::from_millis(20))).await.unwrap(),
            Inbound::TimedOut
        ));
    }

    #[tokio::test]
    async fn close_wakes_blocked_receive() {
        let a = std::sync::Arc::new(ephemeral().await);
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.recv_from(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close();
        let r = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("receive not woken")
            .unwrap();
        assert!(matches!(r, Err(SocketError::Closed)));
        assert!(matches!(
            a.send_bytes(b"x", a.local_addr).await,
            Err(SocketError::Closed)
        ));
    }
}
