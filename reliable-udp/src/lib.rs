//! `reliable-udp`: TCP-like reliable file transfer over UDP.
//!
//! # Architecture
//!
//! ```text
//!  AsyncRead source                                   AsyncWrite sink
//!        │                                                  ▲
//!  ┌─────▼──────┐   DATA / SYN / FIN   ┌──────────────┐     │ drain task
//!  │   Sender   │─────────────────────▶│   Receiver   │─────┘
//!  │ SendWindow │◀─────────────────────│ReceiveBuffer │
//!  └─────┬──────┘   cumulative ACKs    └──────┬───────┘
//!        │                                    │
//!  ┌─────▼────────────────────────────────────▼───────┐
//!  │ Link: UnreliableChannel (drop / corrupt) + Socket │
//!  └───────────────────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]    : wire format and checksum
//! - [`socket`]    : async UDP socket abstraction
//! - [`simulator`] : fault-injecting channel in front of the socket
//! - [`rtt`]       : RTT estimation and timeout interval
//! - [`congestion`]: slow start, congestion avoidance, fast recovery
//! - [`flow`]      : receive buffer and peer window
//! - [`window`]    : go-back-N send window combining the three above
//! - [`state`]     : connection states and legal transitions
//! - [`connection`]: errors, shared link plumbing, agent handles
//! - [`sender`]    : the sending agent
//! - [`receiver`]  : the receiving agent
//! - [`config`]    : tunables
//! - [`stats`]     : traffic counters and transfer reports
//! - [`shutdown`]  : cancellation

pub mod config;
pub mod congestion;
pub mod connection;
pub mod flow;
pub mod packet;
pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod shutdown;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
pub mod window;

pub use config::AgentConfig;
pub use connection::{AgentError, AgentHandle};
pub use receiver::Receiver;
pub use sender::Sender;
pub use state::ConnectionState;
pub use stats::TransferReport;
