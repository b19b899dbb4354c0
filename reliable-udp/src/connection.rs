//! Plumbing shared by both agents.
//!
//! - [`AgentError`] is the error type every agent operation returns.
//! - [`Link`] bundles one agent's socket, fault-injecting channel, counters
//!   and kill switch.  It is cheap to clone so worker tasks can hold their
//!   own copy.
//! - [`AgentHandle`] is what [`crate::sender::Sender::start`] and
//!   [`crate::receiver::Receiver::start`] hand back: a join handle plus the
//!   switch that stops the agent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::Level;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

use crate::config::{AgentConfig, ConfigError};
use crate::packet::{Control, Header, Packet};
use crate::shutdown::KillSwitch;
use crate::simulator::{FaultModel, RandomFaults, UnreliableChannel};
use crate::socket::{Inbound, Socket, SocketError};
use crate::state::{ConnectionState, Role};
use crate::stats::{Stats, TransferReport};

// ---------------------------------------------------------------------------
// AgentError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Socket(SocketError),

    /// Reading the source or writing the sink failed.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation in {state}: {reason}")]
    ProtocolViolation {
        state: ConnectionState,
        reason: String,
    },

    #[error("handshake not completed after {0} attempts")]
    HandshakeFailed(u32),

    #[error("peer silent for {0:?}")]
    PeerTimedOut(Duration),

    #[error("packet refused by the send window {0} times")]
    SendRetriesExhausted(u32),

    /// The agent was stopped through its kill switch.
    #[error("agent cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    WorkerFailed(#[from] JoinError),
}

impl From<SocketError> for AgentError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::Closed => AgentError::Cancelled,
            other => AgentError::Socket(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Link {
    socket: Arc<Socket>,
    channel: Arc<UnreliableChannel>,
    stats: Arc<Stats>,
    kill: KillSwitch,
    role: Role,
    packet_logging: bool,
}

impl Link {
    /// Bind the agent's socket and wrap it in a channel that injects faults
    /// at the configured rates.
    pub async fn bind(
        local: SocketAddr,
        role: Role,
        config: &AgentConfig,
    ) -> Result<Self, AgentError> {
        let kill = KillSwitch::new();
        let socket = Arc::new(Socket::bind(local, kill.clone()).await?);
        let stats = Arc::new(Stats::default());
        let model = RandomFaults::new(config.drop_pct, config.corruption_pct, config.seed);
        let channel = Arc::new(UnreliableChannel::new(
            socket.clone(),
            Box::new(model),
            config.seed,
            stats.clone(),
            role,
        ));
        log::info!("{} bound to {}", role.log_prefix(), socket.local_addr);
        Ok(Self {
            socket,
            channel,
            stats,
            kill,
            role,
            packet_logging: config.packet_logging,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }

    pub async fn replace_faults(&self, model: Box<dyn FaultModel>) {
        self.channel.replace_model(model).await;
    }

    /// Send one packet through the fault-injecting channel.
    pub async fn transmit(&self, packet: &Packet, dest: SocketAddr) -> Result<(), AgentError> {
        self.log_packet("→", &packet.header, packet.payload.len());
        Stats::bump(&self.stats.packets_sent);
        self.channel.send(packet, dest).await?;
        Ok(())
    }

    /// Resend a batch of previously sent packets.
    pub async fn retransmit(&self, packets: &[Packet], dest: SocketAddr) -> Result<(), AgentError> {
        if let (Some(first), Some(last)) = (packets.first(), packets.last()) {
            log::debug!(
                "{} retransmitting {} packet(s) seq={}..{}",
                self.role.log_prefix(),
                packets.len(),
                first.header.seq,
                last.end_seq()
            );
        }
        for packet in packets {
            Stats::bump(&self.stats.retransmissions);
            self.transmit(packet, dest).await?;
        }
        Ok(())
    }

    /// Receive one datagram, waiting at most `wait` (`None` = forever).
    ///
    /// Corrupt datagrams are counted and returned so callers can re-ACK.
    pub async fn recv(&self, wait: Option<Duration>) -> Result<Inbound, AgentError> {
        let inbound = self.socket.recv_from(wait).await?;
        match &inbound {
            Inbound::Packet(packet, _) => {
                self.log_packet("←", &packet.header, packet.payload.len());
            }
            Inbound::Corrupt(e, from) => {
                Stats::bump(&self.stats.corrupt_received);
                log::debug!(
                    "{} discarding corrupt datagram from {from}: {e}",
                    self.role.log_prefix()
                );
            }
            Inbound::TimedOut => {}
        }
        Ok(inbound)
    }

    /// Receive with an absolute deadline.
    pub async fn recv_until(&self, deadline: Instant) -> Result<Inbound, AgentError> {
        let wait = deadline.saturating_duration_since(Instant::now());
        if wait.is_zero() {
            return Ok(Inbound::TimedOut);
        }
        self.recv(Some(wait)).await
    }

    /// Close the socket.  Also flips the kill switch, so any worker still
    /// blocked on this link wakes up.
    pub fn close(&self) {
        self.socket.close();
    }

    pub fn report(&self, final_state: ConnectionState) -> TransferReport {
        TransferReport {
            role: self.role,
            final_state,
            stats: self.stats.snapshot(),
        }
    }

    fn log_packet(&self, dir: &str, header: &Header, len: usize) {
        let level = if self.packet_logging {
            Level::Info
        } else {
            Level::Trace
        };
        log::log!(
            level,
            "{} {dir} {} seq={} ack={} win={} len={}",
            self.role.log_prefix(),
            kind(header, len),
            header.seq,
            header.ack,
            header.window,
            len
        );
    }
}

fn kind(header: &Header, len: usize) -> &'static str {
    match header.control() {
        Ok(Control::Ack) if len > 0 => "DATA",
        Ok(Control::Ack) => "ACK",
        Ok(Control::Syn) => "SYN",
        Ok(Control::SynAck) => "SYN+ACK",
        Ok(Control::Fin) => "FIN",
        Ok(Control::FinAck) => "FIN+ACK",
        Err(_) => "???",
    }
}

/// Build a header-only packet.
pub fn control_packet(control: Control, seq: u32, ack: u32, window: u16) -> Packet {
    Packet::new(
        Header {
            seq,
            ack,
            flags: control.bits(),
            window,
            ..Header::default()
        },
        Vec::new(),
    )
}

/// Fatal error for a header whose control bits are not a legal combination.
pub fn illegal_flags(state: ConnectionState, header: &Header) -> AgentError {
    AgentError::ProtocolViolation {
        state,
        reason: format!("illegal control bits {:#06x}", header.control_bits()),
    }
}

// ---------------------------------------------------------------------------
// AgentHandle
// ---------------------------------------------------------------------------

/// A running agent.
#[derive(Debug)]
pub struct AgentHandle<T> {
    kill: KillSwitch,
    task: JoinHandle<Result<T, AgentError>>,
}

impl<T> AgentHandle<T> {
    pub fn new(kill: KillSwitch, task: JoinHandle<Result<T, AgentError>>) -> Self {
        Self { kill, task }
    }

    /// Ask the agent to stop.  Pending receives fail and the agent finishes
    /// with [`AgentError::Cancelled`].
    pub fn stop(&self) {
        self.kill.kill();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    /// Wait for the agent to finish.
    pub async fn join(self) -> Result<T, AgentError> {
        self.task.await?
    }
}
