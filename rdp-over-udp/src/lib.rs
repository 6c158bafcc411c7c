//! `rdp-over-udp` — the Reliable Data Protocol (RFC 908) connection state
//! machine and packet codec, carried over UDP datagrams.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐              ┌──────────┐
//!  │  Sender  │              │ Receiver │
//!  │ SND.*    │              │ RCV.*    │
//!  └────┬─────┘              └─────┬────┘
//!       │                          │
//!  ┌────▼──────────────────────────▼───┐      ┌──────────────────┐
//!  │           Connection              │─────▶│ RetransmitPolicy │
//!  │  (state::step + packet codec)     │      └──────────────────┘
//!  └────┬──────────────────────────────┘
//!       │ raw datagrams, polled
//!  ┌────▼──────┐
//!  │ Transport │  (UdpTransport, or SimSocket in tests)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      — wire format (serialise / deserialise / checksum)
//! - [`state`]       — FSM states and the inbound transition table
//! - [`connection`]  — per-connection lifecycle: open, listen, send, receive, close
//! - [`sender`]      — send sequence space and window check
//! - [`receiver`]    — receive sequence space and reassembly buffer
//! - [`timer`]       — pluggable retransmission policies
//! - [`socket`]      — non-blocking datagram transport abstraction
//! - [`simulator`]   — in-memory lossy network for testing
//!
//! # Example
//!
//! ```
//! use rdp_over_udp::connection::{Connection, OpenOptions};
//! use rdp_over_udp::simulator::SimNetwork;
//! use rdp_over_udp::state::ConnectionState;
//!
//! let net = SimNetwork::default();
//! let mut server = Connection::new(net.socket());
//! server.listen(9000).unwrap();
//!
//! let mut client = Connection::new(net.socket());
//! client.open(OpenOptions::active(SimNetwork::addr(9000))).unwrap();
//!
//! while client.state() != ConnectionState::Open || server.state() != ConnectionState::Open {
//!     server.poll().unwrap();
//!     client.poll().unwrap();
//! }
//!
//! client.send(b"hello").unwrap();
//! assert_eq!(server.receive().unwrap().as_deref(), Some(&b"hello"[..]));
//! ```

pub mod connection;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;
