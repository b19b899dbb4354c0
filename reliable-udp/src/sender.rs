//! The sending agent.
//!
//! [`Sender`] opens the connection, streams an [`AsyncRead`] source to the
//! peer and tears the connection down again:
//!
//! ```text
//! OPEN ─SYN─▶ SYN_SENT ─SYN+ACK─▶ ESTABLISHED ─EOF─▶ FIN_WAIT_1 ─FIN─▶ FIN_WAIT_2
//!                                                                         │ ACK
//!                 CLOSED ◀─linger── CLOSING ◀─FIN+ACK── TIME_WAIT ◀───────┘
//! ```
//!
//! During ESTABLISHED two tasks share the [`SendWindow`]:
//!
//! - the producer (this task) reads the source, one packet at a time, and
//!   waits for the window to admit each one;
//! - the ACK listener (a spawned task) feeds inbound ACKs to the window and
//!   fires the retransmission timer.
//!
//! Neither holds the window lock while touching the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

use crate::config::AgentConfig;
use crate::connection::{control_packet, illegal_flags, AgentError, AgentHandle, Link};
use crate::packet::{Control, Header, Packet, MAX_PAYLOAD};
use crate::shutdown::KillSwitch;
use crate::simulator::FaultModel;
use crate::socket::Inbound;
use crate::state::{ConnectionState, Role, StateMachine};
use crate::stats::{Stats, TransferReport};
use crate::window::{AckEvent, Admission, SendWindow};

/// Sequence numbers agreed during the handshake.
#[derive(Debug, Clone, Copy, Default)]
struct Session {
    isn: u32,
    /// Next byte expected from the peer (`peer ISN + 1`, `+ 2` after its FIN).
    rcv_nxt: u32,
    peer_window: u16,
    /// Sequence number carried by our FIN.
    fin_seq: u32,
}

impl Session {
    fn handshake_ack(&self) -> Packet {
        control_packet(Control::Ack, self.isn.wrapping_add(1), self.rcv_nxt, 0)
    }
}

pub struct Sender {
    link: Link,
    peer: SocketAddr,
    config: AgentConfig,
    machine: StateMachine,
}

impl Sender {
    /// Bind to `local` and prepare to send to the receiver at `peer`.
    pub async fn bind(
        local: SocketAddr,
        peer: SocketAddr,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let link = Link::bind(local, Role::Sender, &config).await?;
        Ok(Self {
            link,
            peer,
            config,
            machine: StateMachine::new(Role::Sender),
        })
    }

    /// Replace the random fault model with `model`.
    pub async fn with_fault_model(self, model: Box<dyn FaultModel>) -> Self {
        self.link.replace_faults(model).await;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.local_addr()
    }

    /// Run the agent on its own task.
    pub fn start<R>(self, source: R) -> AgentHandle<TransferReport>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let kill = self.link.kill_switch();
        AgentHandle::new(kill, tokio::spawn(self.run(source)))
    }

    /// Transfer `source` to the peer.  The socket is closed on return,
    /// whatever the outcome.
    pub async fn run<R>(mut self, source: R) -> Result<TransferReport, AgentError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let result = self.drive(source).await;
        self.link.close();
        if let Err(e) = &result {
            log::error!("[sender] aborted in {}: {e}", self.machine.state());
        }
        result
    }

    async fn drive<R>(&mut self, mut source: R) -> Result<TransferReport, AgentError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut session = Session {
            isn: rand::random(),
            ..Session::default()
        };
        let mut handshake_attempts = 0u32;
        let mut teardown_attempts = 0u32;
        let mut peer_fin: Option<u32> = None;

        loop {
            match self.machine.state() {
                ConnectionState::Init => self.machine.advance(ConnectionState::Open)?,

                ConnectionState::Open => {
                    handshake_attempts += 1;
                    if handshake_attempts > self.config.handshake_attempts {
                        log::warn!(
                            "[sender] no SYN+ACK after {} attempts",
                            self.config.handshake_attempts
                        );
                        return Err(AgentError::HandshakeFailed(self.config.handshake_attempts));
                    }
                    let syn = control_packet(Control::Syn, session.isn, 0, 0);
                    self.link.transmit(&syn, self.peer).await?;
                    self.machine.advance(ConnectionState::SynSent)?;
                }

                ConnectionState::SynSent => match self.await_syn_ack(session.isn).await? {
                    Some(header) => {
                        session.rcv_nxt = header.seq.wrapping_add(1);
                        session.peer_window = header.window;
                        self.link.transmit(&session.handshake_ack(), self.peer).await?;
                        self.machine.advance(ConnectionState::Established)?;
                    }
                    None => self.machine.advance(ConnectionState::Open)?,
                },

                ConnectionState::Established => {
                    session.fin_seq = self.transfer(&mut source, &session).await?;
                    self.machine.advance(ConnectionState::FinWait1)?;
                }

                ConnectionState::FinWait1 => {
                    teardown_attempts += 1;
                    let fin = control_packet(Control::Fin, session.fin_seq, session.rcv_nxt, 0);
                    self.link.transmit(&fin, self.peer).await?;
                    self.machine.advance(ConnectionState::FinWait2)?;
                }

                ConnectionState::FinWait2 => match self.await_fin_ack(session.fin_seq).await? {
                    Some(header) => {
                        if header.control().is_ok_and(Control::is_fin) {
                            peer_fin = Some(header.seq);
                        }
                        self.machine.advance(ConnectionState::TimeWait)?;
                    }
                    None if teardown_attempts >= self.config.teardown_attempts => {
                        log::warn!(
                            "[sender] FIN unacknowledged after {teardown_attempts} attempts, closing"
                        );
                        self.machine.advance(ConnectionState::Closed)?;
                    }
                    None => self.machine.advance(ConnectionState::FinWait1)?,
                },

                ConnectionState::TimeWait => {
                    if peer_fin.is_none() {
                        peer_fin = self.await_peer_fin().await?;
                    }
                    match peer_fin {
                        Some(seq) => {
                            session.rcv_nxt = seq.wrapping_add(1);
                            self.machine.advance(ConnectionState::Closing)?;
                        }
                        None => {
                            log::warn!("[sender] peer never sent its FIN, closing");
                            self.machine.advance(ConnectionState::Closed)?;
                        }
                    }
                }

                ConnectionState::Closing => {
                    let ack = control_packet(
                        Control::Ack,
                        session.fin_seq.wrapping_add(1),
                        session.rcv_nxt,
                        0,
                    );
                    self.linger(&ack).await?;
                    self.machine.advance(ConnectionState::Closed)?;
                }

                ConnectionState::Closed => {
                    let report = self.link.report(ConnectionState::Closed);
                    log::info!("[sender] transfer complete: {:?}", report.stats);
                    return Ok(report);
                }

                _ => return Err(self.machine.unexpected()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Handshake and teardown waits
    // -----------------------------------------------------------------------

    /// Next packet from the peer before `deadline`, or `None` on timeout.
    ///
    /// Corrupt datagrams and strangers are skipped.  Illegal control bits
    /// are fatal.
    async fn next_from_peer(&self, deadline: Instant) -> Result<Option<Packet>, AgentError> {
        loop {
            match self.link.recv_until(deadline).await? {
                Inbound::TimedOut => return Ok(None),
                Inbound::Corrupt(..) => continue,
                Inbound::Packet(_, from) if from != self.peer => {
                    log::debug!("[sender] ignoring datagram from stranger {from}");
                }
                Inbound::Packet(packet, _) => {
                    if packet.header.control().is_err() {
                        return Err(illegal_flags(self.machine.state(), &packet.header));
                    }
                    return Ok(Some(packet));
                }
            }
        }
    }

    async fn await_syn_ack(&self, isn: u32) -> Result<Option<Header>, AgentError> {
        let deadline = Instant::now() + self.config.initial_timeout;
        while let Some(packet) = self.next_from_peer(deadline).await? {
            let h = packet.header;
            if h.control() == Ok(Control::SynAck) && h.ack == isn.wrapping_add(1) {
                return Ok(Some(h));
            }
            log::debug!("[sender] SYN_SENT ignoring {:?} ack={}", h.control(), h.ack);
        }
        Ok(None)
    }

    /// Wait for the ACK (or FIN+ACK) that covers our FIN.
    async fn await_fin_ack(&self, fin_seq: u32) -> Result<Option<Header>, AgentError> {
        let deadline = Instant::now() + self.config.initial_timeout;
        let want = fin_seq.wrapping_add(1);
        while let Some(packet) = self.next_from_peer(deadline).await? {
            let h = packet.header;
            if matches!(h.control(), Ok(Control::Ack | Control::FinAck)) && h.ack == want {
                return Ok(Some(h));
            }
        }
        Ok(None)
    }

    /// Wait for the receiver's FIN, giving it `teardown_attempts` timeout
    /// intervals to flush its sink.
    async fn await_peer_fin(&self) -> Result<Option<u32>, AgentError> {
        let deadline = Instant::now() + self.config.initial_timeout * self.config.teardown_attempts;
        while let Some(packet) = self.next_from_peer(deadline).await? {
            if packet.header.control().is_ok_and(Control::is_fin) {
                return Ok(Some(packet.header.seq));
            }
        }
        Ok(None)
    }

    /// Send the final ACK, then stay around for `linger` to acknowledge a
    /// repeated FIN whose ACK was lost.
    async fn linger(&self, ack: &Packet) -> Result<(), AgentError> {
        self.link.transmit(ack, self.peer).await?;
        let deadline = Instant::now() + self.config.linger;
        while let Some(packet) = self.next_from_peer(deadline).await? {
            if packet.header.control().is_ok_and(Control::is_fin) {
                log::debug!("[sender] repeated FIN, re-acknowledging");
                self.link.transmit(ack, self.peer).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Stream `source` until EOF and until every packet is acknowledged.
    /// Returns the sequence number the FIN will carry.
    async fn transfer<R>(&self, source: &mut R, session: &Session) -> Result<u32, AgentError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let window = Arc::new(Mutex::new(SendWindow::new(
            session.isn.wrapping_add(1),
            session.peer_window,
            &self.config,
        )));
        let stop = KillSwitch::new();
        let listener = tokio::spawn(listen_for_acks(
            self.link.clone(),
            self.peer,
            window.clone(),
            stop.clone(),
            session.handshake_ack(),
            self.config.min_timeout,
        ));

        let mut produced = self.produce(source, &window, &stop, session.rcv_nxt).await;
        if produced.is_ok() {
            produced = self.drain(&window, &stop).await;
        }
        stop.kill();
        listener.await??;
        produced?;

        let w = window.lock().await;
        log::info!(
            "[sender] all data acknowledged: {} bytes, cwnd={:.2} ssthresh={}",
            w.next_seq().wrapping_sub(session.isn.wrapping_add(1)),
            w.cwnd(),
            w.ssthresh()
        );
        Ok(w.next_seq())
    }

    async fn produce<R>(
        &self,
        source: &mut R,
        window: &Mutex<SendWindow>,
        stop: &KillSwitch,
        ack: u32,
    ) -> Result<(), AgentError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let kill = self.link.kill_switch();
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            let size = window.lock().await.chunk_size();
            // A slow source must not keep a stopped agent alive.
            let n = tokio::select! {
                n = read_chunk(source, &mut buf[..size]) => n?,
                _ = kill.killed() => return Err(AgentError::Cancelled),
                _ = stop.killed() => return Err(AgentError::Cancelled),
            };
            if n == 0 {
                log::info!("[sender] end of input");
                return Ok(());
            }
            let packet = Packet::new(
                Header {
                    ack,
                    flags: Control::Ack.bits(),
                    ..Header::default()
                },
                buf[..n].to_vec(),
            );
            self.admit(&packet, window, stop).await?;
        }
    }

    /// Offer `packet` to the window until it is admitted, then send it.
    async fn admit(
        &self,
        packet: &Packet,
        window: &Mutex<SendWindow>,
        stop: &KillSwitch,
    ) -> Result<(), AgentError> {
        let mut refusals = 0u32;
        loop {
            if stop.is_killed() || self.link.is_killed() {
                return Err(AgentError::Cancelled);
            }
            let admission = window.lock().await.try_send(packet, Instant::now());
            match admission {
                Admission::Accepted(packet) => return self.link.transmit(&packet, self.peer).await,
                Admission::WindowFull => {}
                Admission::FlowStalled(resend) => {
                    if !resend.is_empty() {
                        Stats::bump(&self.link.stats().flow_stalls);
                        self.link.retransmit(&resend, self.peer).await?;
                    }
                }
            }

            refusals += 1;
            if let Some(max) = self.config.max_send_retries {
                if refusals >= max {
                    log::warn!("[sender] packet refused {refusals} times, giving up");
                    return Err(AgentError::SendRetriesExhausted(max));
                }
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Wait for the listener to see every packet acknowledged.
    async fn drain(&self, window: &Mutex<SendWindow>, stop: &KillSwitch) -> Result<(), AgentError> {
        while !window.lock().await.is_empty() {
            if stop.is_killed() || self.link.is_killed() {
                return Err(AgentError::Cancelled);
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
        Ok(())
    }
}

/// Fill `buf` from `source`, stopping early only at end of input.
async fn read_chunk<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Inbound half of ESTABLISHED: apply ACKs and run the retransmission timer
/// until `stop` is flipped.
async fn listen_for_acks(
    link: Link,
    peer: SocketAddr,
    window: Arc<Mutex<SendWindow>>,
    stop: KillSwitch,
    handshake_ack: Packet,
    idle_poll: Duration,
) -> Result<(), AgentError> {
    let result = ack_loop(&link, peer, &window, &stop, &handshake_ack, idle_poll).await;
    if result.is_err() {
        // Wake the producer.
        stop.kill();
    }
    result
}

async fn ack_loop(
    link: &Link,
    peer: SocketAddr,
    window: &Mutex<SendWindow>,
    stop: &KillSwitch,
    handshake_ack: &Packet,
    idle_poll: Duration,
) -> Result<(), AgentError> {
    loop {
        let now = Instant::now();
        let (resend, wait) = {
            let mut w = window.lock().await;
            let resend = if w.timeout_due(now) {
                let rto = w.rto();
                let resend = w.on_timeout(now);
                log::debug!(
                    "[sender] timeout: cwnd={} ssthresh={} rto={rto:?}",
                    w.cwnd(),
                    w.ssthresh()
                );
                resend
            } else {
                Vec::new()
            };
            // The producer may arm the timer while we wait, so never block
            // longer than `idle_poll` with nothing in flight.
            (resend, w.next_wait(now).unwrap_or(idle_poll))
        };
        if !resend.is_empty() {
            Stats::bump(&link.stats().timeouts);
            link.retransmit(&resend, peer).await?;
        }

        let inbound = tokio::select! {
            r = link.recv(Some(wait)) => r?,
            _ = stop.killed() => return Ok(()),
        };

        let packet = match inbound {
            Inbound::Packet(packet, from) if from == peer => packet,
            _ => continue,
        };

        match packet.header.control() {
            Ok(Control::Ack) => {
                let event = window.lock().await.on_ack(&packet.header, Instant::now());
                if let AckEvent::FastRetransmit(resend) = event {
                    Stats::bump(&link.stats().fast_retransmits);
                    log::debug!("[sender] triple duplicate ACK {}", packet.header.ack);
                    link.retransmit(&resend, peer).await?;
                }
            }
            Ok(Control::SynAck) => {
                log::debug!("[sender] SYN+ACK repeated, handshake ACK was lost");
                link.transmit(handshake_ack, peer).await?;
            }
            Ok(other) => {
                log::debug!("[sender] ESTABLISHED ignoring {other:?}");
            }
            Err(_) => return Err(illegal_flags(ConnectionState::Established, &packet.header)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_chunk_fills_across_short_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for part in [&b"abc"[..], b"defg", b"hij"] {
                tx.write_all(part).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        let mut buf = [0u8; 8];
        assert_eq!(read_chunk(&mut rx, &mut buf).await.unwrap(), 8);
        assert_eq!(&buf, b"abcdefgh");
        let mut rest = [0u8; 8];
        assert_eq!(read_chunk(&mut rx, &mut rest).await.unwrap(), 2);
        assert_eq!(&rest[..2], b"ij");
    }

    #[tokio::test]
    async fn handshake_gives_up_without_peer() {
        // Nothing listens on the peer socket.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = AgentConfig {
            handshake_attempts: 2,
            initial_timeout: Duration::from_millis(20),
            ..AgentConfig::default()
        };
        let sender = Sender::bind(
            "127.0.0.1:0".parse().unwrap(),
            silent.local_addr().unwrap(),
            config,
        )
        .await
        .unwrap();
        let err = tokio::time::timeout(Duration::from_secs(2), sender.run(&b"data"[..]))
            .await
            .expect("sender hung")
            .unwrap_err();
        assert!(matches!(err, AgentError::HandshakeFailed(2)));
    }
}
