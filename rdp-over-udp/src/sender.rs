//! Send sequence space for one connection.
//!
//! [`Sender`] tracks `SND.ISS`, `SND.NXT`, `SND.UNA` and the negotiated
//! segment size `SND.MAX`.  It does **not** touch the transport;
//! [`crate::connection::Connection`] asks it for packets and reports what
//! was sent.
//!
//! # Window contract
//! - The SYN consumes one sequence number, so `SND.NXT = SND.ISS + 1` after
//!   open and `SND.UNA = SND.ISS`.
//! - Data consumes one sequence number per byte.
//! - New data may go out only while `SND.NXT - SND.UNA < SND.MAX`.
//! - Nothing advances `SND.UNA`: once the window fills it stays full until
//!   the connection is reset.

use crate::packet::{flags, Packet};

/// Send-side state for one connection.  All zero while CLOSED.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    /// Initial send sequence number, drawn at open.
    pub snd_iss: u32,
    /// Sequence number of the **next** byte to send.
    pub snd_nxt: u32,
    /// Oldest unacknowledged sequence number.
    pub snd_una: u32,
    /// Largest payload a single send may carry, and the window span.
    pub snd_max: u32,
}

impl Sender {
    /// Create a [`Sender`] for a freshly opened connection.
    pub fn new(iss: u32, snd_max: u32) -> Self {
        Self {
            snd_iss: iss,
            snd_nxt: iss.wrapping_add(1),
            snd_una: iss,
            snd_max,
        }
    }

    /// Sequence numbers sent but not yet acknowledged.
    pub fn outstanding(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// `true` when `SND.NXT >= SND.UNA + SND.MAX` (modulo 2³²).
    pub fn window_full(&self) -> bool {
        self.outstanding() >= self.snd_max
    }

    /// `true` when `len` bytes exceed the negotiated segment size.
    pub fn too_large(&self, len: usize) -> bool {
        len as u64 > u64::from(self.snd_max)
    }

    /// SYN carrying `SND.ISS`.
    pub fn syn_packet(&self, source_port: u16, dest_port: u16) -> Packet {
        Packet::new(source_port, dest_port, self.snd_iss, 0, flags::SYN, Vec::new())
    }

    /// SYN+ACK carrying `SND.ISS` and acknowledging `ack`.
    pub fn syn_ack_packet(&self, source_port: u16, dest_port: u16, ack: u32) -> Packet {
        Packet::new(
            source_port,
            dest_port,
            self.snd_iss,
            ack,
            flags::SYN | flags::ACK,
            Vec::new(),
        )
    }

    /// Pure ACK at `SND.NXT`.
    pub fn ack_packet(&self, source_port: u16, dest_port: u16, ack: u32) -> Packet {
        Packet::new(source_port, dest_port, self.snd_nxt, ack, flags::ACK, Vec::new())
    }

    /// RST at `SND.NXT`.
    pub fn rst_packet(&self, source_port: u16, dest_port: u16, ack: u32) -> Packet {
        Packet::new(source_port, dest_port, self.snd_nxt, ack, flags::RST, Vec::new())
    }

    /// Data packet at `SND.NXT`; data segments carry no control flags.
    ///
    /// The caller must follow a successful transmission with
    /// [`Sender::record_sent`].
    pub fn data_packet(&self, source_port: u16, dest_port: u16, ack: u32, data: Vec<u8>) -> Packet {
        Packet::new(source_port, dest_port, self.snd_nxt, ack, 0, data)
    }

    /// Advance `SND.NXT` past `len` freshly sent bytes.
    pub fn record_sent(&mut self, len: usize) {
        self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
    }
}
