//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between the two agents is a [`Packet`].  This
//! module is responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], rejecting
//!   corrupted, truncated or malformed input.
//! - Classifying the control bits of a header into the legal combinations.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | HLen  |  Control bits         |            Window             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |            Urgent             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Length (header + payload bytes)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 24 bytes.  `HLen` is the header length
//! in 32-bit words and is always 6.

use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Finish: the sender has no more data to send.
    pub const FIN: u16 = 0x0001;
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u16 = 0x0002;
    /// Acknowledgement field is valid.
    pub const ACK: u16 = 0x0010;

    /// Mask of the header-length nibble (bits 12–15).
    pub const HEADER_LEN_MASK: u16 = 0xF000;
    /// Mask of every bit that is not the header-length nibble.
    pub const CONTROL_MASK: u16 = !HEADER_LEN_MASK;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 24;

/// Size of every full datagram on the wire.
pub const DATAGRAM_LEN: usize = 1024;

/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD: usize = DATAGRAM_LEN - HEADER_LEN;

/// Header length expressed in 32-bit words, as stored in the flags nibble.
const HEADER_WORDS: u16 = (HEADER_LEN / 4) as u16;

// Byte offsets of each field within the serialised header.
const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_WINDOW: usize = 14;
const OFF_CHECKSUM: usize = 16;
const OFF_URGENT: usize = 18;
const OFF_LENGTH: usize = 20;

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Packet::encode`] converts to big-endian
/// on the wire and [`Packet::decode`] converts back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub source_port: u16,
    pub dest_port: u16,
    /// Stream offset of the first payload byte (or of the SYN/FIN).
    pub seq: u32,
    /// Next byte expected from the peer (cumulative).
    pub ack: u32,
    /// Control bits from [`flags`].  The header-length nibble is managed by
    /// the codec; callers only set control bits.
    pub flags: u16,
    /// Advertised receive window in bytes.
    pub window: u16,
    /// One's-complement checksum over the whole packet.
    ///
    /// On encode this is computed and written last.
    /// On decode this holds the value found on the wire.
    pub checksum: u16,
    /// Carried for layout compatibility; never interpreted.
    pub urgent: u16,
    /// Header plus payload length in bytes.  Recomputed on encode.
    pub length: u32,
}

impl Header {
    /// Control bits with the header-length nibble stripped.
    pub fn control_bits(&self) -> u16 {
        self.flags & flags::CONTROL_MASK
    }

    /// Classify the control bits; see [`Control::from_flags`].
    pub fn control(&self) -> Result<Control, FlagError> {
        Control::from_flags(self.flags)
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet, filling in `length` from the payload.
    pub fn new(mut header: Header, payload: Vec<u8>) -> Self {
        header.length = (HEADER_LEN + payload.len()) as u32;
        Self { header, payload }
    }

    /// Sequence number one past the last payload byte.
    pub fn end_seq(&self) -> u32 {
        self.header.seq.wrapping_add(self.payload.len() as u32)
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// `length`, the header-length nibble and `checksum` are computed from the
    /// actual contents; any values already stored in those fields are ignored.
    pub fn encode(&self) -> Vec<u8> {
        let total = HEADER_LEN + self.payload.len();
        let flags = (HEADER_WORDS << 12) | self.header.control_bits();
        let mut buf = vec![0u8; total];

        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.header.source_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.header.dest_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.header.ack.to_be_bytes());
        buf[OFF_FLAGS..OFF_FLAGS + 2].copy_from_slice(&flags.to_be_bytes());
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.header.window.to_be_bytes());
        // Checksum field stays zero while the checksum is computed.
        buf[OFF_URGENT..OFF_URGENT + 2].copy_from_slice(&self.header.urgent.to_be_bytes());
        buf[OFF_LENGTH..OFF_LENGTH + 4].copy_from_slice(&(total as u32).to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = !ones_complement_sum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        buf
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// The checksum is verified before any header field is looked at.
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the checksum does not verify,
    /// - the `length` field disagrees with `buf.len()`, or
    /// - the header-length nibble is not 6.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }
        if !verify_checksum(buf) {
            return Err(PacketError::ChecksumFailed);
        }

        let header = Header {
            source_port: read_u16(buf, OFF_SRC_PORT),
            dest_port: read_u16(buf, OFF_DST_PORT),
            seq: read_u32(buf, OFF_SEQ),
            ack: read_u32(buf, OFF_ACK),
            flags: read_u16(buf, OFF_FLAGS),
            window: read_u16(buf, OFF_WINDOW),
            checksum: read_u16(buf, OFF_CHECKSUM),
            urgent: read_u16(buf, OFF_URGENT),
            length: read_u32(buf, OFF_LENGTH),
        };

        if header.length as usize != buf.len() {
            return Err(PacketError::LengthMismatch);
        }
        if header.flags >> 12 != HEADER_WORDS {
            return Err(PacketError::BadHeaderLength);
        }

        Ok(Packet {
            header,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when parsing a raw datagram.
///
/// Every variant is handled the same way by the agents: the datagram is
/// counted as corrupt and otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("length field does not match datagram size")]
    LengthMismatch,
    #[error("header-length nibble is not 6 words")]
    BadHeaderLength,
}

/// The legal control-bit combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Syn,
    SynAck,
    Ack,
    Fin,
    FinAck,
}

/// A header carried a control-bit combination outside [`Control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal control bits {0:#06x}")]
pub struct FlagError(pub u16);

impl Control {
    /// Classify the control bits of a `flags` field, ignoring the
    /// header-length nibble.
    pub fn from_flags(raw: u16) -> Result<Self, FlagError> {
        use flags::{ACK, FIN, SYN};

        match raw & flags::CONTROL_MASK {
            SYN => Ok(Control::Syn),
            x if x == SYN | ACK => Ok(Control::SynAck),
            ACK => Ok(Control::Ack),
            FIN => Ok(Control::Fin),
            x if x == FIN | ACK => Ok(Control::FinAck),
            other => Err(FlagError(other)),
        }
    }

    /// Raw control bits for this combination.
    pub fn bits(self) -> u16 {
        use flags::{ACK, FIN, SYN};

        match self {
            Control::Syn => SYN,
            Control::SynAck => SYN | ACK,
            Control::Ack => ACK,
            Control::Fin => FIN,
            Control::FinAck => FIN | ACK,
        }
    }

    /// `true` for FIN and FIN+ACK.
    pub fn is_fin(self) -> bool {
        matches!(self, Control::Fin | Control::FinAck)
    }
}

/// Returns `true` when `a` precedes `b` in wrap-around sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// Returns `true` when `a` precedes or equals `b` in wrap-around space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `true` when the one's-complement sum over `buf`, including the stored
/// checksum, comes out as all ones.
pub fn verify_checksum(buf: &[u8]) -> bool {
    ones_complement_sum(buf) == 0xFFFF
}

/// Sum consecutive 16-bit big-endian words with end-around carry.
///
/// An odd trailing byte is padded with a zero byte on the right.  The result
/// is *not* inverted; [`Packet::encode`] stores its complement.
pub fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        // Fold eagerly so the accumulator never overflows.
        if sum > 0xFFFF {
            sum -= 0xFFFF;
        }
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
        if sum > 0xFFFF {
            sum -= 0xFFFF;
        }
    }

    sum as u16
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
