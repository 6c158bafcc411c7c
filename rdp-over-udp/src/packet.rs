//! Wire-format definitions for RDP segments.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (control word, ports, sequence
//!   numbers, checksum, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed or truncated input.
//! - Computing and verifying the 16-bit one's-complement checksum.
//!
//! No I/O happens here; this is pure data transformation.  Decoding does
//! **not** reject a bad checksum; callers run [`Packet::verify`] themselves
//! and drop what fails.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Ver  |     Flags     |  Hlen |          Source Port          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Destination Port       |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+          Data Length          +
//! |                               |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+        Sequence Number        +
//! |                               |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+     Acknowledgement Number    +
//! |                               |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+           Checksum            +
//! |                               |        Payload ...            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 22 bytes, declared in the control word
//! as [`HEADER_WORDS`] 16-bit words.  Only the low 16 bits of the checksum
//! field carry the checksum; the upper half is written as zero.

use std::fmt;

use thiserror::Error;

/// Bit-flag constants for the flags byte of the control word.
pub mod flags {
    /// Reset the connection.
    pub const RST: u8 = 0b0000_0001;
    /// Extended (selective) acknowledgement.
    pub const EACK: u8 = 0b0000_0010;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0100;
    /// Synchronise sequence numbers (connection request).
    pub const SYN: u8 = 0b0000_1000;
    /// Null segment (keep-alive).
    pub const NUL: u8 = 0b0001_0000;
}

/// Protocol version carried in the top nibble of the control word.
pub const VERSION: u8 = 1;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 22;

/// Header length as declared in the control word, in 16-bit words.
pub const HEADER_WORDS: u8 = (HEADER_LEN / 2) as u8;

// Byte offsets of each field within the serialised header.
const OFF_CONTROL: usize = 0;
const OFF_SRC_PORT: usize = 2;
const OFF_DST_PORT: usize = 4;
const OFF_DATA_LEN: usize = 6;
const OFF_SEQ: usize = 10;
const OFF_ACK: usize = 14;
const OFF_CHECKSUM: usize = 18;

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Packet::encode`] converts to big-endian
/// on the wire and [`Packet::decode`] converts back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub source_port: u16,
    pub dest_port: u16,
    /// Sequence number of this segment.
    pub seq_num: u32,
    /// Acknowledgement number (highest sequence number received from the peer).
    pub ack_num: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// One's-complement checksum over the header fields and payload.
    ///
    /// On encode this is recomputed; on decode it holds the value found on
    /// the wire, which [`Packet::verify`] checks.
    pub checksum: u16,
}

impl Header {
    /// `true` when every bit of `mask` is set.
    pub fn has(&self, mask: u8) -> bool {
        self.flags & mask == mask
    }
}

/// A complete RDP datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub data: Vec<u8>,
}

impl Packet {
    /// Build a packet and stamp it with its checksum.
    pub fn new(
        source_port: u16,
        dest_port: u16,
        seq_num: u32,
        ack_num: u32,
        flags: u8,
        data: Vec<u8>,
    ) -> Self {
        let mut header = Header {
            source_port,
            dest_port,
            seq_num,
            ack_num,
            flags,
            checksum: 0,
        };
        header.checksum = compute_checksum(&header, &data);
        Self { header, data }
    }

    /// Length of the payload as carried in the `data_length` field.
    pub fn data_length(&self) -> u32 {
        self.data.len() as u32
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The `data_length` and checksum fields are computed from the actual
    /// header and payload; the stored `header.checksum` is ignored.
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut buf = vec![0u8; HEADER_LEN + self.data.len()];

        let control = (u16::from(VERSION) << 12)
            | (u16::from(h.flags) << 4)
            | u16::from(HEADER_WORDS);
        buf[OFF_CONTROL..OFF_CONTROL + 2].copy_from_slice(&control.to_be_bytes());
        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&h.source_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&h.dest_port.to_be_bytes());
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 4].copy_from_slice(&self.data_length().to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&h.seq_num.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&h.ack_num.to_be_bytes());

        let csum = u32::from(compute_checksum(h, &self.data));
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&csum.to_be_bytes());

        buf[HEADER_LEN..].copy_from_slice(&self.data);
        buf
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the version nibble is not [`VERSION`],
    /// - the declared header length is not [`HEADER_WORDS`], or
    /// - the `data_length` field disagrees with the trailing byte count.
    ///
    /// The checksum is carried through unverified.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }

        let control = u16::from_be_bytes([buf[OFF_CONTROL], buf[OFF_CONTROL + 1]]);
        let version = (control >> 12) as u8;
        let flags = (control >> 4) as u8;
        let declared_words = (control & 0x000f) as u8;

        if version != VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        if declared_words != HEADER_WORDS {
            return Err(PacketError::HeaderLengthMismatch {
                declared: usize::from(declared_words) * 2,
            });
        }

        let data_length = read_u32(buf, OFF_DATA_LEN);
        let actual = buf.len() - HEADER_LEN;
        if data_length as usize != actual {
            return Err(PacketError::LengthMismatch {
                declared: data_length,
                actual,
            });
        }

        Ok(Packet {
            header: Header {
                source_port: read_u16(buf, OFF_SRC_PORT),
                dest_port: read_u16(buf, OFF_DST_PORT),
                seq_num: read_u32(buf, OFF_SEQ),
                ack_num: read_u32(buf, OFF_ACK),
                flags,
                checksum: (read_u32(buf, OFF_CHECKSUM) & 0xffff) as u16,
            },
            data: buf[HEADER_LEN..].to_vec(),
        })
    }

    /// `true` when the carried checksum matches the header fields and payload.
    pub fn verify(&self) -> bool {
        compute_checksum(&self.header, &self.data) == self.header.checksum
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 5] = [
            (flags::SYN, "SYN"),
            (flags::ACK, "ACK"),
            (flags::EACK, "EACK"),
            (flags::RST, "RST"),
            (flags::NUL, "NUL"),
        ];
        let h = &self.header;
        let mut first = true;
        for (bit, name) in NAMES {
            if h.flags & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("DATA")?;
        }
        write!(
            f,
            " {}→{} seq={} ack={} len={}",
            h.source_port,
            h.dest_port,
            h.seq_num,
            h.ack_num,
            self.data.len()
        )
    }
}

/// Errors that can arise when parsing a raw datagram (a malformed packet).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("declared header length {declared} does not match the {HEADER_LEN}-byte header")]
    HeaderLengthMismatch { declared: usize },
    #[error("data_length field says {declared} bytes but {actual} follow the header")]
    LengthMismatch { declared: u32, actual: usize },
}

/// Compute the one's-complement checksum of a segment.
///
/// Covers `source_port`, `dest_port`, `data_length` (taken from `data`),
/// `seq_num`, `ack_num` and the payload, summed as big-endian 16-bit words.
/// Flags and the checksum field itself are not covered.
pub fn compute_checksum(header: &Header, data: &[u8]) -> u16 {
    let mut sum: u64 = 0;
    sum += u64::from(header.source_port);
    sum += u64::from(header.dest_port);
    for field in [data.len() as u32, header.seq_num, header.ack_num] {
        sum += u64::from(field >> 16);
        sum += u64::from(field & 0xffff);
    }

    let mut words = data.chunks_exact(2);
    for w in &mut words {
        sum += u64::from(u16::from_be_bytes([w[0], w[1]]));
    }
    // Odd trailing byte: pad with a zero byte on the right.
    if let [last] = words.remainder() {
        sum += u64::from(*last) << 8;
    }

    // Fold carries back into the low 16 bits.
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
