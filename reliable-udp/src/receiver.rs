//! The receiving agent.
//!
//! [`Receiver`] waits for a sender, accepts its byte stream in order and
//! writes it to an [`AsyncWrite`] sink:
//!
//! ```text
//! LISTEN ─SYN─▶ SYN_RCVD ─ACK─▶ ESTABLISHED ─FIN─▶ CLOSE_WAIT ─flushed─▶ LAST_ACK ─ACK─▶ CLOSED
//!   ▲              │ give up
//!   └──────────────┘
//! ```
//!
//! Only the segment starting exactly at `rcv_nxt` is accepted.  Everything
//! else (duplicates, gaps, corrupt datagrams, payloads the buffer cannot
//! hold) is answered with the last ACK sent, which is what drives the
//! sender's fast retransmit.
//!
//! Accepted payloads go into a [`ReceiveBuffer`] that a spawned drain task
//! empties into the sink every `drain_interval`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::connection::{control_packet, illegal_flags, AgentError, AgentHandle, Link};
use crate::flow::{FlowError, ReceiveBuffer};
use crate::packet::{seq_lt, Control, Packet};
use crate::shutdown::KillSwitch;
use crate::simulator::FaultModel;
use crate::socket::Inbound;
use crate::state::{ConnectionState, Role, StateMachine};
use crate::stats::{Stats, TransferReport};

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

/// Where an inbound segment falls relative to `rcv_nxt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    Expected,
    /// Starts before `rcv_nxt`: already delivered.
    Duplicate,
    /// Starts after `rcv_nxt`: something in between is missing.
    Ahead,
}

/// In-order acceptance for a go-back-N receiver.
#[derive(Debug, Clone, Copy)]
pub struct Sequencer {
    rcv_nxt: u32,
}

impl Sequencer {
    pub fn new(rcv_nxt: u32) -> Self {
        Self { rcv_nxt }
    }

    pub fn classify(&self, seq: u32) -> Arrival {
        if seq == self.rcv_nxt {
            Arrival::Expected
        } else if seq_lt(seq, self.rcv_nxt) {
            Arrival::Duplicate
        } else {
            Arrival::Ahead
        }
    }

    pub fn advance(&mut self, len: u32) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(len);
    }

    /// Cumulative ACK number.
    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Peer and sequence numbers fixed by the handshake.
#[derive(Debug, Clone, Copy)]
struct Session {
    peer: SocketAddr,
    isn: u32,
    peer_isn: u32,
}

impl Session {
    fn our_seq(&self) -> u32 {
        self.isn.wrapping_add(1)
    }
}

/// The receive buffer and the task emptying it into the sink.
type Draining<W> = (Arc<Mutex<ReceiveBuffer>>, JoinHandle<Result<W, AgentError>>);

pub struct Receiver {
    link: Link,
    config: AgentConfig,
    machine: StateMachine,
}

impl Receiver {
    pub async fn bind(local: SocketAddr, config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let link = Link::bind(local, Role::Receiver, &config).await?;
        Ok(Self {
            link,
            config,
            machine: StateMachine::new(Role::Receiver),
        })
    }

    /// Replace the random fault model (applied to our ACKs) with `model`.
    pub async fn with_fault_model(self, model: Box<dyn FaultModel>) -> Self {
        self.link.replace_faults(model).await;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.local_addr()
    }

    /// Run the agent on its own task.  Joining yields the report and the
    /// sink back.
    pub fn start<W>(self, sink: W) -> AgentHandle<(TransferReport, W)>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let kill = self.link.kill_switch();
        AgentHandle::new(kill, tokio::spawn(self.run(sink)))
    }

    /// Receive one stream into `sink`.  The socket is closed on return,
    /// whatever the outcome.
    pub async fn run<W>(mut self, sink: W) -> Result<(TransferReport, W), AgentError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let result = self.drive(sink).await;
        self.link.close();
        if let Err(e) = &result {
            log::error!("[receiver] aborted in {}: {e}", self.machine.state());
        }
        result
    }

    async fn drive<W>(&mut self, sink: W) -> Result<(TransferReport, W), AgentError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let isn: u32 = rand::random();
        let mut session: Option<Session> = None;
        let mut pending: Option<Packet> = None;
        let mut sink = Some(sink);
        let mut buffer_and_drain: Option<Draining<W>> = None;
        let mut rcv_nxt = 0u32;

        loop {
            match self.machine.state() {
                ConnectionState::Init => self.machine.advance(ConnectionState::Listen)?,

                ConnectionState::Listen => {
                    let (peer, peer_isn) = self.await_syn().await?;
                    session = Some(Session {
                        peer,
                        isn,
                        peer_isn,
                    });
                    self.machine.advance(ConnectionState::SynRcvd)?;
                }

                ConnectionState::SynRcvd => {
                    let s = session.ok_or_else(|| self.machine.unexpected())?;
                    match self.await_handshake_ack(&s).await? {
                        Some(first) => {
                            pending = first;
                            self.machine.advance(ConnectionState::Established)?;
                        }
                        None => {
                            log::warn!(
                                "[receiver] handshake with {} abandoned, listening again",
                                s.peer
                            );
                            session = None;
                            self.machine.advance(ConnectionState::Listen)?;
                        }
                    }
                }

                ConnectionState::Established => {
                    let s = session.ok_or_else(|| self.machine.unexpected())?;
                    let sink = sink.take().ok_or_else(|| self.machine.unexpected())?;
                    let buffer = Arc::new(Mutex::new(ReceiveBuffer::new(
                        self.config.max_buffer as usize,
                    )));
                    let stop = KillSwitch::new();
                    let drain = tokio::spawn(drain_to_sink(
                        buffer.clone(),
                        sink,
                        self.config.drain_interval,
                        self.link.clone(),
                        stop.clone(),
                    ));
                    let received = self.receive(&s, &buffer, pending.take()).await;
                    if received.is_err() {
                        stop.kill();
                    }
                    rcv_nxt = received?;
                    buffer_and_drain = Some((buffer, drain));
                    self.machine.advance(ConnectionState::CloseWait)?;
                }

                ConnectionState::CloseWait => {
                    let (buffer, drain) = buffer_and_drain
                        .take()
                        .ok_or_else(|| self.machine.unexpected())?;
                    buffer.lock().await.mark_end_of_stream();
                    sink = Some(drain.await??);
                    log::info!("[receiver] sink flushed");
                    self.machine.advance(ConnectionState::LastAck)?;
                }

                ConnectionState::LastAck => {
                    let s = session.ok_or_else(|| self.machine.unexpected())?;
                    self.close_handshake(&s, rcv_nxt).await?;
                    self.machine.advance(ConnectionState::Closed)?;
                }

                ConnectionState::Closed => {
                    let sink = sink.take().ok_or_else(|| self.machine.unexpected())?;
                    let report = self.link.report(ConnectionState::Closed);
                    log::info!("[receiver] transfer complete: {:?}", report.stats);
                    return Ok((report, sink));
                }

                _ => return Err(self.machine.unexpected()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Wait, for as long as it takes, for a well-formed SYN.
    async fn await_syn(&self) -> Result<(SocketAddr, u32), AgentError> {
        loop {
            match self.link.recv(None).await? {
                Inbound::Packet(packet, from) if packet.header.control() == Ok(Control::Syn) => {
                    log::info!("[receiver] SYN from {from}");
                    return Ok((from, packet.header.seq));
                }
                Inbound::Packet(packet, from) => {
                    log::debug!(
                        "[receiver] LISTEN ignoring {:?} from {from}",
                        packet.header.control()
                    );
                }
                Inbound::Corrupt(..) | Inbound::TimedOut => {}
            }
        }
    }

    /// Send SYN+ACK until the handshake ACK arrives.
    ///
    /// Returns `Some(first)` once established, where `first` is a data
    /// packet or FIN that completed the handshake in place of a lost ACK.  Returns
    /// `None` when the sender stays silent for `handshake_attempts` tries.
    async fn await_handshake_ack(&self, s: &Session) -> Result<Option<Option<Packet>>, AgentError> {
        let window = self.config.max_buffer.min(u16::MAX as u32) as u16;
        let syn_ack = control_packet(Control::SynAck, s.isn, s.peer_isn.wrapping_add(1), window);
        let want = s.our_seq();

        for _ in 0..self.config.handshake_attempts {
            self.link.transmit(&syn_ack, s.peer).await?;
            let deadline = Instant::now() + self.config.initial_timeout;
            loop {
                let packet = match self.link.recv_until(deadline).await? {
                    Inbound::TimedOut => break,
                    Inbound::Corrupt(..) => continue,
                    Inbound::Packet(_, from) if from != s.peer => continue,
                    Inbound::Packet(packet, _) => packet,
                };
                match packet.header.control() {
                    Ok(Control::Ack) if packet.header.ack == want => {
                        let first = (!packet.payload.is_empty()).then_some(packet);
                        return Ok(Some(first));
                    }
                    // An empty stream goes straight from the lost ACK to FIN.
                    Ok(c) if c.is_fin() && packet.header.ack == want => {
                        return Ok(Some(Some(packet)));
                    }
                    // Our SYN+ACK was lost; answer the repeated SYN at once.
                    Ok(Control::Syn) => break,
                    Ok(other) => {
                        log::debug!("[receiver] SYN_RCVD ignoring {other:?}");
                    }
                    Err(_) => return Err(illegal_flags(self.machine.state(), &packet.header)),
                }
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Accept data until the sender's FIN.  Returns `rcv_nxt` after the FIN.
    async fn receive(
        &self,
        s: &Session,
        buffer: &Mutex<ReceiveBuffer>,
        first: Option<Packet>,
    ) -> Result<u32, AgentError> {
        let mut seq = Sequencer::new(s.peer_isn.wrapping_add(1));
        let initial_window = buffer.lock().await.advertised_window();
        let mut last_ack = control_packet(Control::Ack, s.our_seq(), seq.rcv_nxt(), initial_window);
        let stats = self.link.stats();
        let mut next = first;

        loop {
            let packet = match next.take() {
                Some(packet) => packet,
                None => match self.link.recv(Some(self.config.idle_timeout)).await? {
                    Inbound::TimedOut => {
                        log::warn!(
                            "[receiver] nothing from {} for {:?}",
                            s.peer,
                            self.config.idle_timeout
                        );
                        return Err(AgentError::PeerTimedOut(self.config.idle_timeout));
                    }
                    Inbound::Corrupt(..) => {
                        self.link.transmit(&last_ack, s.peer).await?;
                        continue;
                    }
                    Inbound::Packet(_, from) if from != s.peer => continue,
                    Inbound::Packet(packet, _) => packet,
                },
            };

            let h = &packet.header;
            match h.control() {
                Ok(Control::Ack) if packet.payload.is_empty() => {
                    // Repeated handshake ACK.
                }
                Ok(Control::Ack) => match seq.classify(h.seq) {
                    Arrival::Expected => {
                        let delivered = buffer.lock().await.try_deliver(&packet.payload);
                        match delivered {
                            Ok(window) => {
                                let len = packet.payload.len();
                                seq.advance(len as u32);
                                Stats::add(&stats.bytes_delivered, len as u64);
                                last_ack =
                                    control_packet(Control::Ack, s.our_seq(), seq.rcv_nxt(), window);
                            }
                            Err(FlowError::Rejected { available, requested }) => {
                                Stats::bump(&stats.buffer_rejections);
                                log::debug!(
                                    "[receiver] buffer full ({available} free, {requested} offered)"
                                );
                            }
                        }
                        self.link.transmit(&last_ack, s.peer).await?;
                    }
                    Arrival::Duplicate => {
                        Stats::bump(&stats.duplicates_received);
                        self.link.transmit(&last_ack, s.peer).await?;
                    }
                    Arrival::Ahead => {
                        Stats::bump(&stats.out_of_order_received);
                        self.link.transmit(&last_ack, s.peer).await?;
                    }
                },
                Ok(c) if c.is_fin() => {
                    if h.seq != seq.rcv_nxt() {
                        // Data before the FIN is still missing.
                        self.link.transmit(&last_ack, s.peer).await?;
                        continue;
                    }
                    seq.advance(1);
                    let window = buffer.lock().await.advertised_window();
                    let ack = control_packet(Control::Ack, s.our_seq(), seq.rcv_nxt(), window);
                    self.link.transmit(&ack, s.peer).await?;
                    log::info!(
                        "[receiver] FIN received after {} bytes",
                        buffer.lock().await.bytes_received()
                    );
                    return Ok(seq.rcv_nxt());
                }
                Ok(other) => {
                    log::debug!("[receiver] ESTABLISHED ignoring {other:?}");
                }
                Err(_) => {
                    return Err(illegal_flags(ConnectionState::Established, h));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Send FIN+ACK until the sender acknowledges it.
    async fn close_handshake(&self, s: &Session, rcv_nxt: u32) -> Result<(), AgentError> {
        let fin_ack = control_packet(Control::FinAck, s.our_seq(), rcv_nxt, 0);
        let want = s.our_seq().wrapping_add(1);

        for _ in 0..self.config.teardown_attempts {
            self.link.transmit(&fin_ack, s.peer).await?;
            let deadline = Instant::now() + self.config.initial_timeout;
            loop {
                let packet = match self.link.recv_until(deadline).await? {
                    Inbound::TimedOut => break,
                    Inbound::Corrupt(..) => continue,
                    Inbound::Packet(_, from) if from != s.peer => continue,
                    Inbound::Packet(packet, _) => packet,
                };
                match packet.header.control() {
                    Ok(Control::Ack) if packet.header.ack == want => return Ok(()),
                    // Sender missed our ACK of its FIN; the FIN+ACK covers it.
                    Ok(c) if c.is_fin() => break,
                    Ok(_) => {}
                    Err(_) => return Err(illegal_flags(self.machine.state(), &packet.header)),
                }
            }
        }
        log::warn!(
            "[receiver] final ACK not seen after {} attempts, closing",
            self.config.teardown_attempts
        );
        Ok(())
    }
}

/// Move delivered payloads into `sink` every `interval` until end of stream.
async fn drain_to_sink<W>(
    buffer: Arc<Mutex<ReceiveBuffer>>,
    mut sink: W,
    interval: Duration,
    link: Link,
    stop: KillSwitch,
) -> Result<W, AgentError>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        if stop.is_killed() || link.is_killed() {
            return Err(AgentError::Cancelled);
        }
        let (chunks, done) = {
            let mut b = buffer.lock().await;
            (b.take_ready(), b.is_end_of_stream())
        };
        for chunk in &chunks {
            sink.write_all(chunk).await?;
        }
        if done {
            sink.flush().await?;
            return Ok(sink);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    #[test]
    fn classify_relative_to_rcv_nxt() {
        let s = Sequencer::new(1000);
        assert_eq!(s.classify(1000), Arrival::Expected);
        assert_eq!(s.classify(0), Arrival::Duplicate);
        assert_eq!(s.classify(2000), Arrival::Ahead);
    }

    #[test]
    fn classify_across_wrap() {
        let mut s = Sequencer::new(u32::MAX - 1);
        s.advance(10);
        assert_eq!(s.rcv_nxt(), 8);
        assert_eq!(s.classify(u32::MAX - 1), Arrival::Duplicate);
        assert_eq!(s.classify(8), Arrival::Expected);
        assert_eq!(s.classify(20), Arrival::Ahead);
    }

    /// Shuffled, duplicated arrivals still come out in order and exactly
    /// once, as long as the sender keeps resending what is missing.
    #[test]
    fn in_order_delivery_under_shuffle_and_duplication() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let start = u32::MAX - 3000;
        let stream: Vec<u8> = (0..20_000).map(|_| rng.random()).collect();

        let mut segments = Vec::new();
        let mut seq_no = start;
        for chunk in stream.chunks(700) {
            segments.push((seq_no, chunk.to_vec()));
            seq_no = seq_no.wrapping_add(chunk.len() as u32);
        }

        let mut seq = Sequencer::new(start);
        let mut buffer = ReceiveBuffer::new(32_000);
        let mut out = Vec::new();

        for _round in 0..10_000 {
            if seq.rcv_nxt() == seq_no {
                break;
            }
            // Everything not yet acknowledged, shuffled, with duplicates.
            let mut flight: Vec<&(u32, Vec<u8>)> = segments
                .iter()
                .filter(|(s, _)| !seq_lt(*s, seq.rcv_nxt()))
                .collect();
            let dups: Vec<_> = flight
                .iter()
                .filter(|_| rng.random_bool(0.3))
                .copied()
                .collect();
            flight.extend(dups);
            flight.shuffle(&mut rng);

            for (s, payload) in flight {
                if seq.classify(*s) == Arrival::Expected
                    && buffer.try_deliver(payload).is_ok()
                {
                    seq.advance(payload.len() as u32);
                }
            }
            for chunk in buffer.take_ready() {
                out.extend(chunk);
            }
        }

        assert_eq!(seq.rcv_nxt(), seq_no);
        assert_eq!(out, stream);
    }
}
