//! Datagram transport abstraction.
//!
//! A [`Transport`] moves raw bytes; it knows nothing about packets or
//! connection state.  A connection borrows exactly one transport for its
//! whole life and drives it by polling: receiving never blocks, and "nothing
//! there" is an ordinary `Ok(None)`.
//!
//! [`UdpTransport`] is the production implementation over a non-blocking
//! `std::net::UdpSocket`; [`crate::simulator::SimSocket`] is an in-memory
//! one for tests.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

/// A bindable, non-blocking datagram endpoint.
pub trait Transport {
    /// Bind to `port` (0 lets the transport choose an unused one) and return
    /// the port actually bound.
    fn bind(&mut self, port: u16) -> io::Result<u16>;

    /// The bound port, or `None` before [`Transport::bind`].
    fn local_port(&self) -> Option<u16>;

    /// Send one datagram to `dest`.
    fn send_to(&mut self, bytes: &[u8], dest: SocketAddr) -> io::Result<()>;

    /// Take the next waiting datagram and its source, if any.
    fn try_recv_from(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>>;
}

/// Non-blocking UDP endpoint on a single local interface.
#[derive(Debug)]
pub struct UdpTransport {
    host: IpAddr,
    inner: Option<UdpSocket>,
}

impl UdpTransport {
    /// An unbound transport that will bind on `host`.
    pub fn new(host: IpAddr) -> Self {
        Self { host, inner: None }
    }

    /// Bind immediately to `local_addr`.
    pub fn bind_addr(local_addr: SocketAddr) -> io::Result<Self> {
        let mut transport = Self::new(local_addr.ip());
        transport.bind(local_addr.port())?;
        Ok(transport)
    }

    /// Full local address once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl Transport for UdpTransport {
    fn bind(&mut self, port: u16) -> io::Result<u16> {
        if self.inner.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "transport is already bound",
            ));
        }
        let socket = UdpSocket::bind((self.host, port))?;
        socket.set_nonblocking(true)?;
        let bound = socket.local_addr()?.port();
        self.inner = Some(socket);
        Ok(bound)
    }

    fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    fn send_to(&mut self, bytes: &[u8], dest: SocketAddr) -> io::Result<()> {
        let socket = self
            .inner
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is not bound"))?;
        socket.send_to(bytes, dest)?;
        Ok(())
    }

    fn try_recv_from(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let Some(socket) = self.inner.as_ref() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => {
                buf.truncate(n);
                Ok(Some((buf, addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}
