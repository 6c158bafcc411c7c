//! In-memory network simulator for deterministic testing.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To
//! exercise the state machine against those faults without depending on
//! actual network conditions, [`SimNetwork`] hands out [`SimSocket`]s that
//! implement [`Transport`] over shared in-process queues, applying a
//! configurable fault model on every send:
//!
//! | Fault            | Description                                        |
//! |------------------|----------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.      |
//! | Duplication      | Deliver a datagram twice.                          |
//! | Corruption       | Flip one random bit anywhere in the datagram.      |
//! | Reordering       | Queue a datagram ahead of the previous one.        |
//!
//! All randomness comes from a [`StdRng`] seeded from
//! [`SimulatorConfig::seed`], so a failing run can be replayed exactly.
//! Every endpoint lives at `127.0.0.1:<port>`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::socket::Transport;

/// First port handed out for `bind(0)`.
const EPHEMERAL_START: u16 = 49_152;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Probability that a datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that one bit of a datagram is flipped.
    pub corrupt_rate: f64,
    /// Probability that a datagram overtakes the one queued before it.
    pub reorder_rate: f64,
    /// Seed for the fault RNG.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0,
        }
    }
}

/// Counters of what the simulated network did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub reordered: u64,
}

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Debug)]
struct Inner {
    config: SimulatorConfig,
    rng: StdRng,
    queues: HashMap<u16, VecDeque<Datagram>>,
    next_ephemeral: u16,
    stats: SimStats,
}

impl Inner {
    fn roll(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.random_bool(p.min(1.0))
    }

    fn allocate_port(&mut self) -> io::Result<u16> {
        for _ in 0..=u16::MAX - EPHEMERAL_START {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX {
                EPHEMERAL_START
            } else {
                port + 1
            };
            if !self.queues.contains_key(&port) {
                return Ok(port);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no ephemeral ports left",
        ))
    }

    fn deliver(&mut self, mut bytes: Vec<u8>, from: SocketAddr, to: u16) {
        self.stats.sent += 1;

        if self.roll(self.config.loss_rate) {
            self.stats.dropped += 1;
            log::trace!("[sim] drop {} bytes {from} → :{to}", bytes.len());
            return;
        }
        if !bytes.is_empty() && self.roll(self.config.corrupt_rate) {
            let bit = self.rng.random_range(0..bytes.len() * 8);
            bytes[bit / 8] ^= 1 << (bit % 8);
            self.stats.corrupted += 1;
        }
        let copies = if self.roll(self.config.duplicate_rate) {
            self.stats.duplicated += 1;
            2
        } else {
            1
        };
        let reorder = self.roll(self.config.reorder_rate);

        let Some(queue) = self.queues.get_mut(&to) else {
            // Nobody bound there: UDP drops it on the floor.
            self.stats.dropped += 1;
            return;
        };
        for _ in 0..copies {
            if reorder && !queue.is_empty() {
                let at = queue.len() - 1;
                queue.insert(at, (bytes.clone(), from));
            } else {
                queue.push_back((bytes.clone(), from));
            }
        }
        if reorder {
            self.stats.reordered += 1;
        }
        self.stats.delivered += copies;
    }
}

/// A shared in-memory network.  Cloning yields another handle to the same
/// network.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimNetwork {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                rng,
                queues: HashMap::new(),
                next_ephemeral: EPHEMERAL_START,
                stats: SimStats::default(),
            })),
        }
    }

    /// The address of `port` on this network.
    pub fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// A new, unbound endpoint.
    pub fn socket(&self) -> SimSocket {
        SimSocket {
            net: self.clone(),
            port: None,
        }
    }

    /// A new endpoint already bound to `port` (0 = ephemeral).
    pub fn bound_socket(&self, port: u16) -> io::Result<SimSocket> {
        let mut socket = self.socket();
        socket.bind(port)?;
        Ok(socket)
    }

    /// Replace the fault model; the RNG keeps its current position.
    pub fn set_config(&self, config: SimulatorConfig) {
        self.lock().config = config;
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }

    /// Datagrams waiting at `port`.
    pub fn queued(&self, port: u16) -> usize {
        self.lock().queues.get(&port).map_or(0, VecDeque::len)
    }

    /// Copies of the datagrams waiting at `port`, oldest first.
    pub fn peek(&self, port: u16) -> Vec<Datagram> {
        self.lock()
            .queues
            .get(&port)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Discard everything waiting at `port`; returns how many were dropped.
    pub fn flush(&self, port: u16) -> usize {
        self.lock()
            .queues
            .get_mut(&port)
            .map_or(0, |q| q.drain(..).count())
    }

    /// Place raw bytes in `port`'s queue as if sent from `from`, bypassing
    /// the fault model.
    pub fn inject(&self, port: u16, bytes: Vec<u8>, from: SocketAddr) {
        if let Some(queue) = self.lock().queues.get_mut(&port) {
            queue.push_back((bytes, from));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One endpoint on a [`SimNetwork`].  Dropping it frees the port.
#[derive(Debug)]
pub struct SimSocket {
    net: SimNetwork,
    port: Option<u16>,
}

impl SimSocket {
    /// Full local address once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.port.map(SimNetwork::addr)
    }
}

impl Transport for SimSocket {
    fn bind(&mut self, port: u16) -> io::Result<u16> {
        if self.port.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "transport is already bound",
            ));
        }
        let mut inner = self.net.lock();
        let port = if port == 0 {
            inner.allocate_port()?
        } else if inner.queues.contains_key(&port) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("port {port} is already bound"),
            ));
        } else {
            port
        };
        inner.queues.insert(port, VecDeque::new());
        self.port = Some(port);
        Ok(port)
    }

    fn local_port(&self) -> Option<u16> {
        self.port
    }

    fn send_to(&mut self, bytes: &[u8], dest: SocketAddr) -> io::Result<()> {
        let from = self
            .local_addr()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is not bound"))?;
        self.net.lock().deliver(bytes.to_vec(), from, dest.port());
        Ok(())
    }

    fn try_recv_from(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let Some(port) = self.port else {
            return Ok(None);
        };
        Ok(self
            .net
            .lock()
            .queues
            .get_mut(&port)
            .and_then(VecDeque::pop_front))
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            self.net.lock().queues.remove(&port);
        }
    }
}
