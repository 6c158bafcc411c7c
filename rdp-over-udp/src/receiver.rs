//! Receive sequence space and reassembly buffer.
//!
//! The [`Receiver`] handles everything that happens *after* an inbound data
//! packet has been accepted by the state machine and *before* the
//! application drains the bytes:
//! - Tracking `RCV.CUR`, the sequence number of the last byte received in
//!   order.
//! - Trimming or discarding bytes already received (retransmitted copies).
//! - Holding segments that arrive ahead of a gap until the gap fills.
//! - Bounding buffered and held bytes by `RMAX.BUF` and advertising `RCV.MAX`.
//!
//! The [`Receiver`] does **not** send ACKs itself; it reports what happened
//! and [`crate::connection::Connection`] builds the reply.

use std::mem;

/// Outcome of offering a data segment to the [`Receiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// `n` new bytes were appended to the buffer, including any held
    /// segments the new bytes made contiguous.
    Appended(usize),
    /// The segment starts past `RCV.CUR + 1`; it is held until the gap fills.
    Held,
    /// Every byte was already received or is already held; nothing changed.
    Duplicate,
    /// The buffer cannot hold the new bytes; the segment was discarded.
    Overflow,
}

/// Receive-side state for one connection.  All zero while CLOSED.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receiver {
    /// Sequence number of the last byte (or SYN) received in order.
    pub rcv_cur: u32,
    /// Highest sequence number the buffer can currently accept.
    pub rcv_max: u32,
    /// Capacity of the reassembly buffer in bytes.
    pub rmax_buf: u32,
    buffer: Vec<u8>,
    /// Segments received ahead of a gap, as `(seq, payload)`.
    out_of_order: Vec<(u32, Vec<u8>)>,
}

impl Receiver {
    pub fn new(rmax_buf: u32) -> Self {
        Self {
            rmax_buf,
            ..Self::default()
        }
    }

    /// Record the peer's initial sequence number from its SYN.
    pub fn on_syn(&mut self, peer_seq: u32) {
        self.rcv_cur = peer_seq;
        self.update_rcv_max();
    }

    /// Offer a data segment starting at `seq`.
    ///
    /// Bytes at or before `RCV.CUR` are treated as already received and
    /// trimmed.  A segment that continues the in-order stream is appended and
    /// `RCV.CUR` moves to its last byte; held segments it makes contiguous
    /// follow it into the buffer.  A segment starting beyond `RCV.CUR + 1`
    /// leaves `RCV.CUR` alone and is held.
    pub fn on_segment(&mut self, seq: u32, data: &[u8]) -> Accept {
        let last = seq.wrapping_add(data.len() as u32).wrapping_sub(1);
        if data.is_empty() || !seq_gt(last, self.rcv_cur) {
            return Accept::Duplicate;
        }
        if seq_gt(seq, self.rcv_cur.wrapping_add(1)) {
            return self.hold(seq, data);
        }

        let fresh = &data[self.overlap(seq)..];
        if self.used() + fresh.len() > self.rmax_buf as usize {
            return Accept::Overflow;
        }

        self.buffer.extend_from_slice(fresh);
        self.rcv_cur = last;
        let appended = fresh.len() + self.reassemble();
        self.update_rcv_max();
        Accept::Appended(appended)
    }

    /// Bytes waiting for the application, in order.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of segments held ahead of a gap.
    pub fn held(&self) -> usize {
        self.out_of_order.len()
    }

    /// Take every in-order buffered byte, or `None` when there is none.
    pub fn drain(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        let data = mem::take(&mut self.buffer);
        self.update_rcv_max();
        Some(data)
    }

    fn hold(&mut self, seq: u32, data: &[u8]) -> Accept {
        let known = self
            .out_of_order
            .iter()
            .any(|(s, d)| *s == seq && d.len() >= data.len());
        if known {
            return Accept::Duplicate;
        }
        if self.used() + data.len() > self.rmax_buf as usize {
            return Accept::Overflow;
        }
        self.out_of_order.push((seq, data.to_vec()));
        self.update_rcv_max();
        Accept::Held
    }

    /// Move held segments that now touch `RCV.CUR` into the buffer.
    fn reassemble(&mut self) -> usize {
        let mut appended = 0;
        loop {
            let next = self.rcv_cur.wrapping_add(1);
            let Some(i) = self
                .out_of_order
                .iter()
                .position(|(seq, _)| !seq_gt(*seq, next))
            else {
                break;
            };
            let (seq, data) = self.out_of_order.swap_remove(i);
            let last = seq.wrapping_add(data.len() as u32).wrapping_sub(1);
            if seq_gt(last, self.rcv_cur) {
                let fresh = &data[self.overlap(seq)..];
                self.buffer.extend_from_slice(fresh);
                self.rcv_cur = last;
                appended += fresh.len();
            }
        }
        appended
    }

    /// Leading bytes of a segment starting at `seq` (at most `RCV.CUR + 1`)
    /// that were already received.
    fn overlap(&self, seq: u32) -> usize {
        self.rcv_cur.wrapping_sub(seq).wrapping_add(1) as usize
    }

    /// Bytes buffered plus bytes held.
    fn used(&self) -> usize {
        self.buffer.len() + self.out_of_order.iter().map(|(_, d)| d.len()).sum::<usize>()
    }

    fn free(&self) -> u32 {
        (self.rmax_buf as usize).saturating_sub(self.used()) as u32
    }

    fn update_rcv_max(&mut self) {
        self.rcv_max = self.rcv_cur.wrapping_add(self.free());
    }
}

/// `a > b` in 32-bit serial-number arithmetic (RFC 1982).
fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
