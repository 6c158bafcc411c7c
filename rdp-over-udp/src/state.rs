//! Connection finite-state machine (FSM) types and transition table.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy (RFC 908 §3.2) and the pure transition function driven by inbound
//! packets.  [`step`] decides *what* happens; applying the side effects
//! (recording sequence numbers, emitting packets, buffering data) is the job
//! of [`crate::connection`].
//!
//! ```text
//!             open(passive)              SYN / →SYN+ACK
//!  CLOSED ───────────────────▶ LISTEN ───────────────────▶ SYN-RCVD
//!    │                                                        │
//!    │ open(active) / →SYN                                    │ ACK
//!    ▼                                                        ▼
//!  SYN-SENT ─────────────── SYN+ACK / →ACK ──────────────▶  OPEN ──close / →RST──▶ CLOSE-WAIT
//!                                                             │
//!                                                             │ RST
//!                                                             ▼
//!                                                           CLOSED
//! ```
//!
//! Any (state, segment) pair not listed in [`step`] is ignored.

use std::fmt;

use crate::packet::{flags, Packet};

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection exists; initial state.
    Closed,
    /// Passive open; waiting for a SYN from any peer.
    Listen,
    /// SYN has been sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received and SYN+ACK sent; waiting for ACK.
    SynRcvd,
    /// Handshake complete; data transfer in progress.
    Open,
    /// Local close sent RST from OPEN; only an explicit reset leaves this state.
    CloseWait,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Closed
    }
}

impl ConnectionState {
    /// State reached by a local `close()`, or `None` when closing is invalid.
    ///
    /// Every `Some` result also means an RST goes out.
    pub fn after_close(self) -> Option<Self> {
        match self {
            Self::Listen | Self::SynRcvd | Self::SynSent => Some(Self::Closed),
            Self::Open => Some(Self::CloseWait),
            Self::Closed | Self::CloseWait => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN-SENT",
            Self::SynRcvd => "SYN-RCVD",
            Self::Open => "OPEN",
            Self::CloseWait => "CLOSE-WAIT",
        })
    }
}

/// What an inbound packet means to the FSM, judged by its flags and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// RST set (takes precedence over everything else).
    Rst,
    /// SYN and ACK set: connection accept.
    SynAck,
    /// SYN without ACK: connection request.
    Syn,
    /// ACK without payload.
    Ack,
    /// Non-empty payload without SYN or RST.
    Data,
    /// Anything else (NUL, bare EACK, empty flagless packets).
    Other,
}

impl Segment {
    pub fn classify(packet: &Packet) -> Self {
        let h = &packet.header;
        if h.has(flags::RST) {
            Self::Rst
        } else if h.has(flags::SYN | flags::ACK) {
            Self::SynAck
        } else if h.has(flags::SYN) {
            Self::Syn
        } else if !packet.data.is_empty() {
            Self::Data
        } else if h.has(flags::ACK) {
            Self::Ack
        } else {
            Self::Other
        }
    }
}

/// A transition triggered by an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// LISTEN → SYN-RCVD: record `RCV_CUR = peer_seq`, reply SYN+ACK.
    AcceptSyn { peer_seq: u32 },
    /// SYN-SENT → OPEN: record `RCV_CUR = peer_seq`, reply ACK.
    CompleteActive { peer_seq: u32 },
    /// SYN-RCVD → OPEN: no side effect.
    CompletePassive,
    /// OPEN → OPEN: buffer the payload, reply ACK.
    Deliver,
    /// OPEN → CLOSED: zero every counter and drop buffered data.
    Reset,
}

impl Transition {
    pub fn next_state(self) -> ConnectionState {
        match self {
            Self::AcceptSyn { .. } => ConnectionState::SynRcvd,
            Self::CompleteActive { .. } | Self::CompletePassive | Self::Deliver => {
                ConnectionState::Open
            }
            Self::Reset => ConnectionState::Closed,
        }
    }
}

/// Decide the transition for `packet` arriving in `state`.
///
/// Returns `None` for every combination the protocol does not handle; the
/// caller must then leave state and counters untouched.
pub fn step(state: ConnectionState, packet: &Packet) -> Option<Transition> {
    use ConnectionState as S;

    let seq = packet.header.seq_num;
    match (state, Segment::classify(packet)) {
        (S::Listen, Segment::Syn) => Some(Transition::AcceptSyn { peer_seq: seq }),
        (S::Listen, _) => None,

        (S::SynSent, Segment::SynAck) => Some(Transition::CompleteActive { peer_seq: seq }),
        (S::SynSent, _) => None,

        (S::SynRcvd, Segment::Ack) => Some(Transition::CompletePassive),
        (S::SynRcvd, _) => None,

        (S::Open, Segment::Data) => Some(Transition::Deliver),
        (S::Open, Segment::Rst) => Some(Transition::Reset),
        (S::Open, _) => None,

        (S::Closed | S::CloseWait, _) => None,
    }
}
