//! TCP flow reassembly.
//!
//! A [`TcpFlow`] demultiplexes the packets of one connection into two
//! [`HalfStream`]s, one per [`Side`], and orders their payloads by sequence
//! number. Consumers read contiguous bytes from a half and [`HalfStream::consume`]
//! what they have parsed.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::Serialize;

use crate::protocol::{StreamKey, TcpSegment};

/// Out-of-order bytes buffered per half before the oldest gap is given up on.
const MAX_PENDING_BYTES: usize = 4 * 1_048_576;

/// One of the two directions of a TCP connection.
///
/// `Forward` is the side that opened the connection (the SYN sender), or the
/// sender of the first packet seen when the SYN was not captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Forward,
    Reverse,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Forward => Side::Reverse,
            Side::Reverse => Side::Forward,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Forward => f.write_str("forward"),
            Side::Reverse => f.write_str("reverse"),
        }
    }
}

/// A range of sequence space that was never filled before the stream was flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceGap {
    pub start_seq: u32,
    pub end_seq: u32,
}

/// Byte stream for one side of a TCP connection.
#[derive(Debug, Default)]
pub struct HalfStream {
    /// Next expected sequence number.
    expected_seq: u32,
    /// Sequence number of the first payload byte, once known.
    initial_seq: Option<u32>,
    /// `initial_seq` came from a SYN rather than the first segment seen.
    base_from_syn: bool,
    /// Out-of-order segments keyed by offset from `initial_seq`, so the
    /// map stays ordered across sequence number wrap.
    pending: BTreeMap<u32, Vec<u8>>,
    pending_bytes: usize,
    /// Contiguous bytes not yet consumed.
    reassembled: Vec<u8>,
    /// Total contiguous bytes ever produced.
    delivered: u64,
    /// Bytes the consumer has taken out of `reassembled`.
    consumed: u64,
    gaps: Vec<SequenceGap>,
    segment_count: u32,
    retransmit_count: u32,
    out_of_order_count: u32,
    fin_received: bool,
}

impl HalfStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the SYN for this side; the SYN consumes one sequence number.
    fn set_initial_seq(&mut self, syn_seq: u32) {
        if self.initial_seq.is_none() {
            self.initial_seq = Some(syn_seq.wrapping_add(1));
            self.expected_seq = syn_seq.wrapping_add(1);
            self.base_from_syn = true;
        }
    }

    /// Add a payload-carrying segment.
    pub fn add_segment(&mut self, seq: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.segment_count += 1;

        // Mid-stream pickup: the first segment defines the start.
        if self.initial_seq.is_none() {
            self.initial_seq = Some(seq);
            self.expected_seq = seq;
        } else if self.precedes_guessed_start(seq) {
            self.move_start_back(seq);
        }

        let seg_end = seq_add(seq, data.len());
        if seq_lt(seq, self.expected_seq) {
            if seq_le(seg_end, self.expected_seq) {
                self.retransmit_count += 1;
                return;
            }
            // Partial overlap: keep only the new tail.
            let overlap = self.expected_seq.wrapping_sub(seq) as usize;
            self.append_in_order(&data[overlap..]);
            return;
        }

        if seq == self.expected_seq {
            self.append_in_order(data);
            return;
        }

        self.out_of_order_count += 1;
        let offset = self.offset(seq);
        let existing = self.pending.get(&offset).map_or(0, Vec::len);
        if data.len() > existing {
            self.pending_bytes = self.pending_bytes - existing + data.len();
            self.pending.insert(offset, data.to_vec());
        }
        if self.pending_bytes > MAX_PENDING_BYTES {
            self.skip_gap();
        }
    }

    /// Without a SYN the first segment seen is only a guess at the start.
    /// An earlier one may still move it, until bytes are consumed or a gap
    /// has been bridged.
    fn precedes_guessed_start(&self, seq: u32) -> bool {
        let Some(base) = self.initial_seq else {
            return false;
        };
        !self.base_from_syn
            && self.consumed == 0
            && self.gaps.is_empty()
            && seq_lt(seq, base)
            && base.wrapping_sub(seq) as usize <= MAX_PENDING_BYTES
    }

    /// Restart the stream at `seq`, parking everything reassembled so far
    /// as pending until the bytes in between arrive.
    fn move_start_back(&mut self, seq: u32) {
        let Some(old_base) = self.initial_seq else {
            return;
        };
        let shift = old_base.wrapping_sub(seq);
        tracing::debug!(from = old_base, to = seq, "segment precedes stream start, moving start back");

        let mut pending: BTreeMap<u32, Vec<u8>> = std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(offset, data)| (offset.wrapping_add(shift), data))
            .collect();
        let buffered = std::mem::take(&mut self.reassembled);
        if !buffered.is_empty() {
            self.delivered -= buffered.len() as u64;
            self.pending_bytes += buffered.len();
            pending.insert(shift, buffered);
        }
        self.pending = pending;
        self.initial_seq = Some(seq);
        self.expected_seq = seq;
        self.out_of_order_count += 1;
    }

    fn offset(&self, seq: u32) -> u32 {
        seq.wrapping_sub(self.initial_seq.unwrap_or(0))
    }

    fn seq_at(&self, offset: u32) -> u32 {
        self.initial_seq.unwrap_or(0).wrapping_add(offset)
    }

    fn append_in_order(&mut self, data: &[u8]) {
        self.reassembled.extend_from_slice(data);
        self.delivered += data.len() as u64;
        self.expected_seq = seq_add(self.expected_seq, data.len());
        self.flush_pending();
    }

    /// Move pending segments that have become contiguous into the buffer.
    fn flush_pending(&mut self) {
        while let Some((&offset, _)) = self.pending.first_key_value() {
            let seq = self.seq_at(offset);
            if seq_lt(self.expected_seq, seq) {
                break;
            }
            let Some(data) = self.pending.remove(&offset) else {
                break;
            };
            self.pending_bytes -= data.len();
            let end = seq_add(seq, data.len());
            if seq_lt(self.expected_seq, end) {
                let skip = self.expected_seq.wrapping_sub(seq) as usize;
                self.reassembled.extend_from_slice(&data[skip..]);
                self.delivered += (data.len() - skip) as u64;
                self.expected_seq = end;
            }
        }
    }

    /// Give up on the lowest gap: jump to the next pending segment.
    fn skip_gap(&mut self) -> bool {
        let Some((&offset, _)) = self.pending.first_key_value() else {
            return false;
        };
        let next = self.seq_at(offset);
        tracing::debug!(
            start = self.expected_seq,
            end = next,
            "bridging unfilled sequence gap"
        );
        self.gaps.push(SequenceGap {
            start_seq: self.expected_seq,
            end_seq: next,
        });
        self.expected_seq = next;
        self.flush_pending();
        true
    }

    /// Flush everything still pending, bridging any gaps.
    pub fn finish(&mut self) {
        while self.skip_gap() {}
    }

    /// Contiguous bytes not yet consumed.
    pub fn bytes(&self) -> &[u8] {
        &self.reassembled
    }

    /// Drop `n` parsed bytes from the front of the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.reassembled.len());
        self.reassembled.drain(..n);
        self.consumed += n as u64;
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn gaps(&self) -> &[SequenceGap] {
        &self.gaps
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    pub fn retransmit_count(&self) -> u32 {
        self.retransmit_count
    }

    pub fn out_of_order_count(&self) -> u32 {
        self.out_of_order_count
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }
}

/// Observed TCP three-way handshake of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpHandshake {
    /// Side that sent the SYN and its sequence number.
    pub syn: Option<(Side, u32)>,
    /// Side that sent the SYN-ACK and its sequence number.
    pub syn_ack: Option<(Side, u32)>,
    /// A bare ACK from the SYN sender followed the SYN-ACK.
    pub ack: bool,
}

impl TcpHandshake {
    pub fn is_complete(&self) -> bool {
        self.syn.is_some() && self.syn_ack.is_some() && self.ack
    }

    /// The connecting side, derived from whichever handshake segment was seen.
    pub fn client_side(&self) -> Option<Side> {
        match (self.syn, self.syn_ack) {
            (Some((side, _)), _) => Some(side),
            (None, Some((side, _))) => Some(side.opposite()),
            _ => None,
        }
    }
}

/// Both sides of one TCP connection.
#[derive(Debug)]
pub struct TcpFlow {
    key: Option<StreamKey>,
    /// Sending endpoint of the `Forward` side.
    forward: Option<SocketAddr>,
    fwd: HalfStream,
    rev: HalfStream,
    handshake: TcpHandshake,
    packets: u64,
    finished: bool,
}

impl Default for TcpFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpFlow {
    pub fn new() -> Self {
        TcpFlow {
            key: None,
            forward: None,
            fwd: HalfStream::new(),
            rev: HalfStream::new(),
            handshake: TcpHandshake::default(),
            packets: 0,
            finished: false,
        }
    }

    /// Add one segment. Returns the side it was filed under, or `None` if
    /// it belongs to a different connection.
    pub fn add(&mut self, segment: &TcpSegment) -> Option<Side> {
        let key = segment.stream_key();
        match &self.key {
            Some(existing) if *existing != key => return None,
            Some(_) => {}
            None => self.key = Some(key),
        }

        let flags = segment.flags;
        let forward = *self.forward.get_or_insert_with(|| {
            // A lone SYN-ACK means the receiver opened the connection.
            if flags.syn && flags.ack {
                segment.dst
            } else {
                segment.src
            }
        });
        let side = if segment.src == forward {
            Side::Forward
        } else {
            Side::Reverse
        };
        self.packets += 1;

        let seq = segment.seq;
        if flags.syn {
            if flags.ack {
                self.handshake.syn_ack.get_or_insert((side, seq));
            } else {
                self.handshake.syn.get_or_insert((side, seq));
            }
            self.half_mut(side).set_initial_seq(seq);
        } else if flags.ack
            && !self.handshake.ack
            && self.handshake.syn_ack.is_some()
            && self.handshake.client_side() == Some(side)
        {
            self.handshake.ack = true;
        }

        let half = self.half_mut(side);
        half.add_segment(seq, &segment.payload);
        if flags.fin {
            half.fin_received = true;
        }
        Some(side)
    }

    /// End of capture: flush out-of-order data on both sides.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.fwd.finish();
        self.rev.finish();
        self.finished = true;
    }

    pub fn key(&self) -> Option<&StreamKey> {
        self.key.as_ref()
    }

    pub fn handshake(&self) -> &TcpHandshake {
        &self.handshake
    }

    pub fn half(&self, side: Side) -> &HalfStream {
        match side {
            Side::Forward => &self.fwd,
            Side::Reverse => &self.rev,
        }
    }

    pub fn half_mut(&mut self, side: Side) -> &mut HalfStream {
        match side {
            Side::Forward => &mut self.fwd,
            Side::Reverse => &mut self.rev,
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

fn seq_add(seq: u32, len: usize) -> u32 {
    seq.wrapping_add(len as u32)
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}
