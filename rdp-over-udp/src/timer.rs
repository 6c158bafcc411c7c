//! Retransmission policies.
//!
//! The connection state machine has no clock of its own.  Instead it reports
//! every data packet it transmits and every acknowledgement it sees to a
//! [`RetransmitPolicy`], and asks the policy which packets are due for
//! another transmission when the caller drives
//! [`crate::connection::Connection::poll_timers`] with the current time.
//!
//! Two policies ship here:
//! - [`NoRetransmit`] — the default.  Nothing is ever resent, so a packet
//!   lost in transit stays lost.
//! - [`BackoffRetransmit`] — RTO estimated with Jacobson's algorithm
//!   (RFC 6298), `RTO = SRTT + 4 × RTTVAR`, doubling on each timeout up to a
//!   maximum, giving up on a segment after a bounded number of resends.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::packet::Packet;

/// Pluggable retransmission capability consulted by a connection.
pub trait RetransmitPolicy: fmt::Debug {
    /// A data packet was handed to the transport at `now`.
    fn on_transmit(&mut self, packet: &Packet, now: Instant);

    /// The peer acknowledged every sequence number up to and including `ack_num`.
    fn on_acknowledged(&mut self, ack_num: u32, now: Instant);

    /// Packets whose timer has expired at `now`, to be resent unchanged.
    fn due(&mut self, now: Instant) -> Vec<Packet>;

    /// Forget everything outstanding.
    fn clear(&mut self);

    /// Number of packets currently tracked.
    fn pending(&self) -> usize;
}

/// Never retransmits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetransmit;

impl RetransmitPolicy for NoRetransmit {
    fn on_transmit(&mut self, _packet: &Packet, _now: Instant) {}

    fn on_acknowledged(&mut self, _ack_num: u32, _now: Instant) {}

    fn due(&mut self, _now: Instant) -> Vec<Packet> {
        Vec::new()
    }

    fn clear(&mut self) {}

    fn pending(&self) -> usize {
        0
    }
}

/// Adjustable timeout parameters for [`BackoffRetransmit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Ceiling for the RTO after repeated back-off.
    pub max_rto: Duration,
    /// Resends allowed per packet before it is abandoned.
    pub max_retries: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(1000),
            max_rto: Duration::from_secs(60),
            max_retries: 6,
        }
    }
}

#[derive(Debug, Clone)]
struct Outstanding {
    packet: Packet,
    /// Sequence number of the last byte carried.
    last_seq: u32,
    /// Transmissions so far (1 = first send).
    tx_count: u32,
    sent_at: Instant,
    deadline: Instant,
}

/// Resend unacknowledged data with exponential back-off.
#[derive(Debug)]
pub struct BackoffRetransmit {
    config: TimerConfig,
    rto: Duration,
    srtt: Option<Duration>,
    rttvar: Duration,
    queue: VecDeque<Outstanding>,
}

impl Default for BackoffRetransmit {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}

impl BackoffRetransmit {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            rto: config.initial_rto,
            config,
            srtt: None,
            rttvar: Duration::ZERO,
            queue: VecDeque::new(),
        }
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT, once at least one sample exists.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Feed one RTT measurement (RFC 6298 §2).
    ///
    /// First sample: SRTT = R, RTTVAR = R/2.  Later samples:
    /// RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|, SRTT = 7/8·SRTT + 1/8·R.
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                self.rttvar = self.rttvar * 3 / 4 + sample.abs_diff(srtt) / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        self.rto = match self.srtt {
            Some(srtt) => (srtt + self.rttvar * 4).min(self.config.max_rto),
            None => self.config.initial_rto,
        };
    }

    fn back_off(&mut self) {
        self.rto = (self.rto * 2).min(self.config.max_rto);
    }
}

impl RetransmitPolicy for BackoffRetransmit {
    fn on_transmit(&mut self, packet: &Packet, now: Instant) {
        if packet.data.is_empty() {
            return;
        }
        let h = &packet.header;
        self.queue.push_back(Outstanding {
            packet: packet.clone(),
            last_seq: h.seq_num.wrapping_add(packet.data_length()).wrapping_sub(1),
            tx_count: 1,
            sent_at: now,
            deadline: now + self.rto,
        });
    }

    fn on_acknowledged(&mut self, ack_num: u32, now: Instant) {
        let mut sample = None;
        self.queue.retain(|entry| {
            let covered = (ack_num.wrapping_sub(entry.last_seq) as i32) >= 0;
            // Karn: only never-resent segments yield RTT samples.
            if covered && entry.tx_count == 1 {
                sample = Some(now.saturating_duration_since(entry.sent_at));
            }
            !covered
        });
        if let Some(rtt) = sample {
            self.record_rtt_sample(rtt);
        }
    }

    fn due(&mut self, now: Instant) -> Vec<Packet> {
        let before = self.queue.len();
        let max_retries = self.config.max_retries;
        self.queue.retain(|entry| {
            let expired = entry.deadline <= now;
            if expired && entry.tx_count > max_retries {
                log::warn!(
                    "[rdp] giving up on seq={} after {} transmissions",
                    entry.packet.header.seq_num,
                    entry.tx_count
                );
            }
            !(expired && entry.tx_count > max_retries)
        });

        let expired_any = self.queue.iter().any(|e| e.deadline <= now);
        if !expired_any {
            return Vec::new();
        }

        self.back_off();
        let rto = self.rto;
        let mut resend = Vec::new();
        for entry in self.queue.iter_mut().filter(|e| e.deadline <= now) {
            entry.tx_count += 1;
            entry.sent_at = now;
            entry.deadline = now + rto;
            resend.push(entry.packet.clone());
        }
        log::debug!(
            "[rdp] timeout — retransmitting {} packet(s), {} abandoned, rto={:?}",
            resend.len(),
            before - self.queue.len(),
            rto
        );
        resend
    }

    fn clear(&mut self) {
        self.queue.clear();
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}
