//! Fault-injecting network channel.
//!
//! Real loopback never loses anything.  To exercise the reliability
//! mechanisms every outgoing packet passes through an [`UnreliableChannel`],
//! which asks a [`FaultModel`] what to do with it:
//!
//! | Fault     | Effect                                                   |
//! |-----------|----------------------------------------------------------|
//! | `Drop`    | The packet is never written to the socket.               |
//! | `Corrupt` | One random bit of the encoded datagram is flipped: a     |
//! |           | payload bit, or a header bit when there is no payload.   |
//! | `Deliver` | The packet is sent unmodified.                           |
//!
//! The default model, [`RandomFaults`], draws from a seedable RNG so a lossy
//! run can be replayed exactly.  Tests can plug in any closure
//! `FnMut(&Packet) -> Fault` to script individual faults.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::packet::{Packet, HEADER_LEN};
use crate::socket::{Socket, SocketError};
use crate::state::Role;
use crate::stats::Stats;

/// What happens to one outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Deliver,
    Drop,
    Corrupt,
}

/// Decides the fate of each outgoing packet.
pub trait FaultModel: Send {
    fn decide(&mut self, packet: &Packet) -> Fault;
}

impl<F> FaultModel for F
where
    F: FnMut(&Packet) -> Fault + Send,
{
    fn decide(&mut self, packet: &Packet) -> Fault {
        self(packet)
    }
}

/// Independent per-packet drop and corruption percentages.
///
/// Drop is decided first; only packets that survive are candidates for
/// corruption.
#[derive(Debug)]
pub struct RandomFaults {
    drop_pct: f64,
    corrupt_pct: f64,
    rng: StdRng,
}

impl RandomFaults {
    pub fn new(drop_pct: f64, corrupt_pct: f64, seed: Option<u64>) -> Self {
        Self {
            drop_pct,
            corrupt_pct,
            rng: seeded(seed),
        }
    }
}

impl FaultModel for RandomFaults {
    fn decide(&mut self, _packet: &Packet) -> Fault {
        if self.drop_pct > 0.0 && self.rng.random_range(0.0..100.0) < self.drop_pct {
            Fault::Drop
        } else if self.corrupt_pct > 0.0 && self.rng.random_range(0.0..100.0) < self.corrupt_pct {
            Fault::Corrupt
        } else {
            Fault::Deliver
        }
    }
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Flip one random bit of an encoded datagram.
///
/// Payload bits are preferred; a header-only datagram gets a header bit
/// flipped instead.
pub fn flip_random_bit<R: Rng + ?Sized>(datagram: &mut [u8], rng: &mut R) {
    let region = if datagram.len() > HEADER_LEN {
        HEADER_LEN..datagram.len()
    } else {
        0..datagram.len()
    };
    if region.is_empty() {
        return;
    }
    let byte = rng.random_range(region);
    let bit = rng.random_range(0..8u8);
    datagram[byte] ^= 1 << bit;
}

struct Faults {
    model: Box<dyn FaultModel>,
    /// Picks which bit to flip; independent of the model.
    rng: StdRng,
}

/// Outgoing half of an agent's network path.
pub struct UnreliableChannel {
    socket: Arc<Socket>,
    faults: Mutex<Faults>,
    stats: Arc<Stats>,
    role: Role,
}

impl std::fmt::Debug for UnreliableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnreliableChannel")
            .field("local_addr", &self.socket.local_addr)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl UnreliableChannel {
    pub fn new(
        socket: Arc<Socket>,
        model: Box<dyn FaultModel>,
        seed: Option<u64>,
        stats: Arc<Stats>,
        role: Role,
    ) -> Self {
        Self {
            socket,
            faults: Mutex::new(Faults {
                model,
                // Offset so the bit picker does not replay the model's stream.
                rng: seeded(seed.map(|s| s.wrapping_add(1))),
            }),
            stats,
            role,
        }
    }

    /// Swap the fault model, e.g. to script a scenario.
    pub async fn replace_model(&self, model: Box<dyn FaultModel>) {
        self.faults.lock().await.model = model;
    }

    /// Encode `packet`, apply the fault model and write the result to `dest`.
    ///
    /// Returns the fault that was applied.  Only the socket write can fail.
    pub async fn send(&self, packet: &Packet, dest: SocketAddr) -> Result<Fault, SocketError> {
        let mut bytes = packet.encode();
        let fault = {
            let mut faults = self.faults.lock().await;
            let fault = faults.model.decide(packet);
            if fault == Fault::Corrupt {
                flip_random_bit(&mut bytes, &mut faults.rng);
            }
            fault
        };

        let prefix = self.role.log_prefix();
        match fault {
            Fault::Drop => {
                Stats::bump(&self.stats.dropped_injected);
                log::debug!(
                    "{prefix} simulated drop seq={} ack={}",
                    packet.header.seq,
                    packet.header.ack
                );
                return Ok(fault);
            }
            Fault::Corrupt => {
                Stats::bump(&self.stats.corrupted_injected);
                log::debug!(
                    "{prefix} simulated corruption seq={} ack={}",
                    packet.header.seq,
                    packet.header.ack
                );
            }
            Fault::Deliver => {}
        }

        self.socket.send_bytes(&bytes, dest).await?;
        Ok(fault)
    }
}
