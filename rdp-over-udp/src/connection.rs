//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one peer relationship.  Its
//! responsibilities are:
//! - Driving the finite-state machine (see [`crate::state`]).
//! - Coordinating [`crate::sender`] and [`crate::receiver`].
//! - Decoding, verifying and filtering inbound datagrams, then dispatching
//!   them through [`crate::state::step`].
//! - Reporting sent data and acknowledgements to a
//!   [`crate::timer::RetransmitPolicy`].
//!
//! Everything is synchronous and non-blocking.  The caller polls: after an
//! active open it keeps calling [`Connection::poll`] until the state is
//! [`ConnectionState::Open`], and nothing here ever waits for the network.
//!
//! # Known limitations
//!
//! With the default [`NoRetransmit`] policy a packet lost in transit is never
//! resent.  Acknowledgements never advance `SND.UNA`, so once `SND.MAX`
//! sequence numbers are outstanding every further [`Connection::send`] fails
//! with [`ConnError::WindowFull`] until the connection is reset.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;

use crate::packet::{flags, Packet};
use crate::receiver::{Accept, Receiver};
use crate::sender::Sender;
use crate::socket::Transport;
use crate::state::{step, ConnectionState, Transition};
use crate::timer::{NoRetransmit, RetransmitPolicy};

/// `SND.MAX` used when [`OpenOptions::snd_max`] is unset.
pub const DEFAULT_SND_MAX: u32 = 10;

/// `RMAX.BUF` used when [`OpenOptions::rmax_buf`] is unset.
pub const DEFAULT_RMAX_BUF: u32 = 1024;

/// Errors returned by connection operations.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection already open")]
    AlreadyOpen,
    #[error("connection not open")]
    NotOpen,
    #[error("connection not open or already closing")]
    NotOpenOrClosing,
    #[error("local port not specified")]
    MissingLocalPort,
    #[error("remote port not specified")]
    MissingRemotePort,
    #[error("{len} bytes exceed the maximum segment size of {max}")]
    SegmentTooLarge { len: usize, max: u32 },
    #[error("send window is full")]
    WindowFull,
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Parameters of [`Connection::open`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Wait for a peer (`true`) or initiate (`false`).
    pub passive: bool,
    /// Local port; required for a passive open.
    pub local_port: Option<u16>,
    /// Peer address; required for an active open, its port is the remote port.
    pub remote: Option<SocketAddr>,
    /// Maximum segment size, defaulting to [`DEFAULT_SND_MAX`].
    pub snd_max: Option<u32>,
    /// Receive buffer size, defaulting to [`DEFAULT_RMAX_BUF`].
    pub rmax_buf: Option<u32>,
}

impl OpenOptions {
    pub fn passive(local_port: u16) -> Self {
        Self {
            passive: true,
            local_port: Some(local_port),
            ..Self::default()
        }
    }

    pub fn active(remote: SocketAddr) -> Self {
        Self {
            passive: false,
            remote: Some(remote),
            ..Self::default()
        }
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_snd_max(mut self, snd_max: u32) -> Self {
        self.snd_max = Some(snd_max);
        self
    }

    pub fn with_rmax_buf(mut self, rmax_buf: u32) -> Self {
        self.rmax_buf = Some(rmax_buf);
        self
    }
}

/// A single RDP connection over a datagram [`Transport`].
#[derive(Debug)]
pub struct Connection<T> {
    state: ConnectionState,
    transport: T,
    /// Remote endpoint; `None` until known.  Any source is accepted in LISTEN.
    peer: Option<SocketAddr>,
    source_port: u16,
    dest_port: u16,
    sender: Sender,
    receiver: Receiver,
    retransmit: Box<dyn RetransmitPolicy>,
}

impl<T: Transport> Connection<T> {
    /// Create a connection in [`ConnectionState::Closed`] with every counter zeroed.
    pub fn new(transport: T) -> Self {
        Self {
            state: ConnectionState::Closed,
            source_port: transport.local_port().unwrap_or(0),
            transport,
            peer: None,
            dest_port: 0,
            sender: Sender::default(),
            receiver: Receiver::default(),
            retransmit: Box::new(NoRetransmit),
        }
    }

    /// Use `policy` for retransmissions instead of [`NoRetransmit`].
    pub fn with_retransmit(mut self, policy: impl RetransmitPolicy + 'static) -> Self {
        self.retransmit = Box::new(policy);
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn dest_port(&self) -> u16 {
        self.dest_port
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn retransmit(&self) -> &dyn RetransmitPolicy {
        self.retransmit.as_ref()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open the connection, passively (→ LISTEN) or actively (→ SYN-SENT,
    /// sending a SYN).
    ///
    /// Draws a fresh unpredictable `SND.ISS`; `SND.NXT = SND.ISS + 1` and
    /// `SND.UNA = SND.ISS`.  Binds the transport when it is still unbound,
    /// on `local_port` or, for an active open without one, on any free port.
    pub fn open(&mut self, opts: OpenOptions) -> Result<(), ConnError> {
        if self.state != ConnectionState::Closed {
            return Err(ConnError::AlreadyOpen);
        }

        let remote = if opts.passive {
            if opts.local_port.is_none() {
                return Err(ConnError::MissingLocalPort);
            }
            None
        } else {
            Some(opts.remote.ok_or(ConnError::MissingRemotePort)?)
        };

        let port = self.ensure_bound(opts.local_port)?;
        let iss: u32 = rand::random();
        self.source_port = port;
        self.sender = Sender::new(iss, opts.snd_max.unwrap_or(DEFAULT_SND_MAX));
        self.receiver = Receiver::new(opts.rmax_buf.unwrap_or(DEFAULT_RMAX_BUF));
        self.retransmit.clear();

        match remote {
            None => {
                self.peer = None;
                self.dest_port = 0;
                self.set_state(ConnectionState::Listen);
            }
            Some(remote) => {
                self.peer = Some(remote);
                self.dest_port = remote.port();
                let syn = self.sender.syn_packet(self.source_port, self.dest_port);
                if let Err(e) = self.transmit(&syn) {
                    self.clear();
                    return Err(e);
                }
                self.set_state(ConnectionState::SynSent);
            }
        }
        Ok(())
    }

    /// Bind the transport to `local_port` and wait passively for a peer.
    pub fn listen(&mut self, local_port: u16) -> Result<(), ConnError> {
        if self.state != ConnectionState::Closed {
            return Err(ConnError::AlreadyOpen);
        }
        if self.transport.local_port() != Some(local_port) {
            self.transport
                .bind(local_port)
                .map_err(|source| ConnError::Bind {
                    port: local_port,
                    source,
                })?;
        }
        self.open(OpenOptions::passive(local_port))
    }

    /// Send one data segment.
    ///
    /// The packet carries `seq = SND.NXT`, `ack = RCV.CUR` and no control
    /// flags; `SND.NXT` then advances by `data.len()`.
    pub fn send(&mut self, data: &[u8]) -> Result<(), ConnError> {
        if self.state != ConnectionState::Open {
            return Err(ConnError::NotOpen);
        }
        if self.sender.too_large(data.len()) {
            return Err(ConnError::SegmentTooLarge {
                len: data.len(),
                max: self.sender.snd_max,
            });
        }
        if self.sender.window_full() {
            return Err(ConnError::WindowFull);
        }

        let packet = self.sender.data_packet(
            self.source_port,
            self.dest_port,
            self.receiver.rcv_cur,
            data.to_vec(),
        );
        self.transmit(&packet)?;
        self.retransmit.on_transmit(&packet, Instant::now());
        self.sender.record_sent(data.len());
        Ok(())
    }

    /// Process at most one inbound datagram and hand over received bytes.
    ///
    /// Returns `Ok(None)` when no data is waiting.  Bytes deposited by
    /// earlier [`Connection::poll`] calls are returned too.
    pub fn receive(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        if self.state != ConnectionState::Open {
            return Err(ConnError::NotOpen);
        }
        self.poll()?;
        Ok(self.receiver.drain())
    }

    /// Close the connection, sending RST to the peer if one is known.
    ///
    /// From LISTEN, SYN-SENT or SYN-RCVD the connection returns to CLOSED
    /// with every counter zeroed; from OPEN it moves to CLOSE-WAIT.  No peer
    /// is known in LISTEN, so closing from there sends nothing.
    pub fn close(&mut self) -> Result<(), ConnError> {
        let next = self
            .state
            .after_close()
            .ok_or(ConnError::NotOpenOrClosing)?;

        let rst = self
            .sender
            .rst_packet(self.source_port, self.dest_port, self.receiver.rcv_cur);
        self.transmit(&rst)?;

        if next == ConnectionState::Closed {
            self.clear();
        }
        self.set_state(next);
        Ok(())
    }

    /// Return to CLOSED from any state, zeroing every counter and dropping
    /// buffered data.  Nothing is sent.
    pub fn reset(&mut self) {
        self.clear();
        self.set_state(ConnectionState::Closed);
    }

    // -----------------------------------------------------------------------
    // Inbound path
    // -----------------------------------------------------------------------

    /// Read one datagram from the transport, if any, and feed it through the
    /// state machine.
    ///
    /// Returns `true` when a datagram was read, whether or not it was
    /// accepted.  Malformed, corrupt or foreign datagrams are dropped here
    /// and never surface as errors.
    pub fn poll(&mut self) -> Result<bool, ConnError> {
        match self.transport.try_recv_from()? {
            Some((bytes, from)) => {
                self.handle_datagram(&bytes, from)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Decode, verify and filter one raw datagram, then dispatch it.
    pub fn handle_datagram(
        &mut self,
        bytes: &[u8],
        from: SocketAddr,
    ) -> Result<Option<Transition>, ConnError> {
        if self.state != ConnectionState::Listen {
            if let Some(peer) = self.peer {
                if from != peer {
                    log::trace!("[rdp:{}] ignoring datagram from {from}", self.source_port);
                    return Ok(None);
                }
            }
        }

        let packet = match Packet::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[rdp:{}] dropping malformed datagram: {e}", self.source_port);
                return Ok(None);
            }
        };
        if !packet.verify() {
            log::warn!(
                "[rdp:{}] dropping packet with bad checksum: {packet}",
                self.source_port
            );
            return Ok(None);
        }

        self.process(packet, from)
    }

    /// Dispatch one verified packet through the state machine.
    ///
    /// Returns the transition taken, or `None` when the packet is not
    /// meaningful in the current state and was ignored.
    pub fn process(
        &mut self,
        packet: Packet,
        from: SocketAddr,
    ) -> Result<Option<Transition>, ConnError> {
        log::debug!("[rdp:{}] ← {packet}", self.source_port);

        if self.state == ConnectionState::Open && packet.header.has(flags::ACK) {
            self.retransmit
                .on_acknowledged(packet.header.ack_num, Instant::now());
        }

        let Some(transition) = step(self.state, &packet) else {
            log::trace!(
                "[rdp:{}] {} ignores {packet}",
                self.source_port,
                self.state
            );
            return Ok(None);
        };

        match transition {
            Transition::AcceptSyn { peer_seq } => {
                self.peer = Some(from);
                self.dest_port = packet.header.source_port;
                self.receiver.on_syn(peer_seq);
                let reply = self.sender.syn_ack_packet(
                    self.source_port,
                    self.dest_port,
                    self.receiver.rcv_cur,
                );
                self.transmit(&reply)?;
            }
            Transition::CompleteActive { peer_seq } => {
                self.receiver.on_syn(peer_seq);
                self.send_ack()?;
            }
            Transition::CompletePassive => {}
            Transition::Deliver => {
                match self
                    .receiver
                    .on_segment(packet.header.seq_num, &packet.data)
                {
                    Accept::Appended(n) => {
                        log::debug!(
                            "[rdp:{}] buffered {n} bytes, rcv_cur={}",
                            self.source_port,
                            self.receiver.rcv_cur
                        );
                        self.send_ack()?;
                    }
                    Accept::Held => {
                        log::debug!(
                            "[rdp:{}] holding seq={} past a gap, rcv_cur={}",
                            self.source_port,
                            packet.header.seq_num,
                            self.receiver.rcv_cur
                        );
                        self.send_ack()?;
                    }
                    Accept::Duplicate => self.send_ack()?,
                    Accept::Overflow => {
                        log::warn!(
                            "[rdp:{}] receive buffer full ({} bytes); dropping seq={}",
                            self.source_port,
                            self.receiver.rmax_buf,
                            packet.header.seq_num
                        );
                    }
                }
            }
            Transition::Reset => self.clear(),
        }

        self.set_state(transition.next_state());
        Ok(Some(transition))
    }

    /// Resend whatever the retransmission policy reports due at `now`.
    ///
    /// Returns the number of packets resent.  Only an OPEN connection
    /// retransmits.
    pub fn poll_timers(&mut self, now: Instant) -> Result<usize, ConnError> {
        if self.state != ConnectionState::Open {
            return Ok(0);
        }
        let due = self.retransmit.due(now);
        for packet in &due {
            self.transmit(packet)?;
        }
        Ok(due.len())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_bound(&mut self, preferred: Option<u16>) -> Result<u16, ConnError> {
        if let Some(bound) = self.transport.local_port() {
            if preferred.is_some_and(|p| p != bound) {
                log::debug!("[rdp] transport already bound to {bound}; keeping it");
            }
            return Ok(bound);
        }
        let port = preferred.unwrap_or(0);
        self.transport
            .bind(port)
            .map_err(|source| ConnError::Bind { port, source })
    }

    fn send_ack(&mut self) -> Result<(), ConnError> {
        let ack = self
            .sender
            .ack_packet(self.source_port, self.dest_port, self.receiver.rcv_cur);
        self.transmit(&ack)
    }

    fn transmit(&mut self, packet: &Packet) -> Result<(), ConnError> {
        let Some(peer) = self.peer else {
            log::debug!("[rdp:{}] no peer yet; not sending {packet}", self.source_port);
            return Ok(());
        };
        self.transport.send_to(&packet.encode(), peer)?;
        log::debug!("[rdp:{}] → {packet}", self.source_port);
        Ok(())
    }

    /// Zero every counter, drop buffered data and forget the peer.
    fn clear(&mut self) {
        self.sender = Sender::default();
        self.receiver = Receiver::default();
        self.peer = None;
        self.dest_port = 0;
        self.retransmit.clear();
    }

    fn set_state(&mut self, next: ConnectionState) {
        if next != self.state {
            log::debug!("[rdp:{}] {} → {}", self.source_port, self.state, next);
            self.state = next;
        }
    }
}
