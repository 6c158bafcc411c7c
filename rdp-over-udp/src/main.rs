//! Entry point for `rdp-over-udp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing) and the polling
//! loop that drives a [`Connection`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rdp_over_udp::connection::{ConnError, Connection, OpenOptions, DEFAULT_RMAX_BUF};
use rdp_over_udp::socket::UdpTransport;
use rdp_over_udp::state::ConnectionState;
use rdp_over_udp::timer::BackoffRetransmit;

/// RDP (RFC 908) connections over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    tuning: Tuning,
}

#[derive(Subcommand)]
enum Mode {
    /// Listen for a client and echo back whatever it sends.
    Server {
        /// Local port to listen on.
        #[arg(short, long, default_value_t = 12345)]
        port: u16,
        /// Local address to bind.
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        host: IpAddr,
    },
    /// Connect to a server, send one message and print the reply.
    Client {
        /// Remote server address.
        #[arg(short, long, default_value = "127.0.0.1:12345")]
        server: SocketAddr,
        /// Message to send once the connection is open.
        #[arg(short, long, default_value = "Hello, server!")]
        message: String,
        /// Polls to wait for the handshake and again for the reply.
        #[arg(long, default_value_t = 50)]
        max_polls: u32,
    },
}

#[derive(Args)]
struct Tuning {
    /// Maximum segment size and send window, in bytes.
    #[arg(long, global = true, default_value_t = 512)]
    snd_max: u32,
    /// Receive buffer size, in bytes.
    #[arg(long, global = true, default_value_t = DEFAULT_RMAX_BUF)]
    rmax_buf: u32,
    /// Milliseconds between socket polls.
    #[arg(long, global = true, default_value_t = 100)]
    poll_ms: u64,
    /// Retransmit unacknowledged data with exponential back-off.
    #[arg(long, global = true)]
    retransmit: bool,
}

impl Tuning {
    fn connection(&self, transport: UdpTransport) -> Connection<UdpTransport> {
        let conn = Connection::new(transport);
        if self.retransmit {
            conn.with_retransmit(BackoffRetransmit::default())
        } else {
            conn
        }
    }

    fn apply(&self, opts: OpenOptions) -> OpenOptions {
        opts.with_snd_max(self.snd_max).with_rmax_buf(self.rmax_buf)
    }

    fn interval(&self) -> tokio::time::Interval {
        tokio::time::interval(Duration::from_millis(self.poll_ms.max(1)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server { port, host } => run_server(host, port, &cli.tuning).await,
        Mode::Client {
            server,
            message,
            max_polls,
        } => run_client(server, message.as_bytes(), max_polls, &cli.tuning).await,
    }
}

/// Drain every datagram currently waiting on the socket.
fn drain(conn: &mut Connection<UdpTransport>) -> Result<(), ConnError> {
    while conn.poll()? {}
    conn.poll_timers(Instant::now())?;
    Ok(())
}

async fn run_server(host: IpAddr, port: u16, tuning: &Tuning) -> Result<()> {
    let mut conn = tuning.connection(UdpTransport::new(host));
    conn.open(tuning.apply(OpenOptions::passive(port)))
        .with_context(|| format!("listening on {host}:{port}"))?;
    log::info!("Server listening on {host}:{port}");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tuning.interval();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }

        drain(&mut conn)?;

        match conn.state() {
            ConnectionState::Open => {
                if let Some(data) = conn.receive()? {
                    println!("Received: {}", String::from_utf8_lossy(&data));
                    for chunk in data.chunks(tuning.snd_max.max(1) as usize) {
                        match conn.send(chunk) {
                            Ok(()) => {}
                            Err(ConnError::WindowFull) => {
                                log::warn!("send window full; dropping rest of echo");
                                break;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
            ConnectionState::Closed => {
                // Peer reset the connection; wait for the next one.
                log::info!("Connection closed by peer; listening again");
                conn.open(tuning.apply(OpenOptions::passive(port)))?;
            }
            _ => {}
        }
    }

    if conn.state().after_close().is_some() {
        conn.close()?;
    }
    Ok(())
}

async fn run_client(
    server: SocketAddr,
    message: &[u8],
    max_polls: u32,
    tuning: &Tuning,
) -> Result<()> {
    let host = match server.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let mut conn = tuning.connection(UdpTransport::new(host));
    conn.open(tuning.apply(OpenOptions::active(server)))?;
    log::info!("Connecting to {server} from port {}", conn.source_port());

    let mut ticker = tuning.interval();
    let mut polls = 0;
    while conn.state() != ConnectionState::Open {
        if polls == max_polls {
            conn.reset();
            bail!("no answer from {server} after {max_polls} polls");
        }
        ticker.tick().await;
        drain(&mut conn)?;
        polls += 1;
    }
    log::info!("Connection open after {polls} polls");

    for chunk in message.chunks(tuning.snd_max.max(1) as usize) {
        conn.send(chunk)
            .with_context(|| format!("sending {} bytes", chunk.len()))?;
    }
    println!("Sent: {}", String::from_utf8_lossy(message));

    let mut reply = Vec::new();
    for _ in 0..max_polls {
        ticker.tick().await;
        drain(&mut conn)?;
        if conn.state() != ConnectionState::Open {
            log::warn!("Connection left OPEN while waiting for a reply");
            break;
        }
        if let Some(data) = conn.receive()? {
            reply.extend_from_slice(&data);
        }
        if reply.len() >= message.len() {
            break;
        }
    }
    if reply.is_empty() {
        log::warn!("No reply received");
    } else {
        println!("Received: {}", String::from_utf8_lossy(&reply));
    }

    if conn.state().after_close().is_some() {
        conn.close()?;
    }
    Ok(())
}
