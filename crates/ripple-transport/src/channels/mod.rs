//! # Channels
//!
//! Per-connection delivery state machines. Each connection owns one channel
//! per configured slot; the slot index is the channel id on the wire.
//!
//! | Type                          | Acks | Resend | Order                      |
//! |-------------------------------|------|--------|----------------------------|
//! | `Unreliable`                  | no   | no     | none, duplicates dropped   |
//! | `UnreliableRaw`               | no   | no     | none, no framing           |
//! | `UnreliableOrdered`           | no   | no     | newer-than-last only       |
//! | `Reliable`                    | sack | yes    | none, every message once   |
//! | `ReliableOrdered`             | yes  | yes    | latest value only          |
//! | `ReliableSequenced`           | yes  | yes    | strict, batched delivery   |
//! | `ReliableSequencedFragmented` | yes  | yes    | strict, per-fragment acks  |
//!
//! Channels are pure logic: outgoing datagrams go to a [`ChannelSink`],
//! delivered payloads come back as pooled [`PointerSet`]s whose ownership
//! passes to the caller.

mod fragmented;
mod reliable;
mod reliable_ordered;
mod reliable_sequenced;
mod send_window;
mod unreliable;

pub use fragmented::{FragmentedChannel, FRAGMENT_HEADER_LEN};
pub use reliable::ReliableChannel;
pub use reliable_ordered::ReliableOrderedChannel;
pub use reliable_sequenced::ReliableSequencedChannel;
pub use unreliable::{UnreliableChannel, UnreliableOrderedChannel, UnreliableRawChannel};

use bytes::BufMut;
use quanta::Instant;
use std::time::Duration;

use crate::error::Result;
use crate::memory::{HeapMemory, MemoryManager, PointerSet};
use crate::wire::{ChannelType, MessageType};

// ─── Sink ───────────────────────────────────────────────────────────────────

/// Destination for datagrams a channel wants on the wire.
pub trait ChannelSink {
    /// Queue `datagram` for the remote peer. `no_merge` asks the transport to
    /// bypass the packet merger.
    fn send(&mut self, datagram: &[u8], no_merge: bool);
}

/// Collects datagrams in memory.
impl ChannelSink for Vec<Vec<u8>> {
    fn send(&mut self, datagram: &[u8], _no_merge: bool) {
        self.push(datagram.to_vec());
    }
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Channel tuning shared by every channel of a socket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    /// Send window (in-flight messages) of the reliable channels.
    pub reliability_window_size: usize,
    /// Receive window of the sequenced channels.
    pub sequenced_window_size: usize,
    /// Send/receive window (messages) of the fragmented channel.
    pub fragment_window_size: usize,
    /// Maximum fragments per message (at most 32768).
    pub max_fragments: usize,
    /// Sliding window of remembered sequences for unreliable dedup.
    pub duplicate_window_size: usize,
    /// Sends without an ack before the channel reports a timeout.
    pub max_resend_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            reliability_window_size: 512,
            sequenced_window_size: 512,
            fragment_window_size: 64,
            max_fragments: 512,
            duplicate_window_size: 512,
            max_resend_attempts: 30,
        }
    }
}

// ─── Shared types ───────────────────────────────────────────────────────────

/// A message the peer has acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acked {
    /// Caller-supplied key from `create_outgoing`, if any.
    pub notification_key: Option<u64>,
    /// Round-trip sample, only for messages acknowledged after a single send.
    pub rtt_sample: Option<Duration>,
}

/// An unacknowledged datagram held for resending.
#[derive(Debug)]
pub struct PendingOutgoing {
    pub datagram: HeapMemory,
    pub attempts: u32,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub no_merge: bool,
}

impl PendingOutgoing {
    pub fn new(datagram: HeapMemory, no_merge: bool, now: Instant) -> Self {
        PendingOutgoing {
            datagram,
            attempts: 1,
            first_sent: now,
            last_sent: now,
            no_merge,
        }
    }

    /// Whether the resend delay has passed since the last send.
    pub fn is_due(&self, now: Instant, resend_delay: Duration) -> bool {
        now.saturating_duration_since(self.last_sent) > resend_delay
    }

    /// Round trip since first send; `None` once resent (ambiguous sample).
    pub fn rtt_sample(&self, now: Instant) -> Option<Duration> {
        (self.attempts == 1).then(|| now.saturating_duration_since(self.first_sent))
    }

    /// Resend through `sink` if due. Returns `true` when the attempt budget
    /// is exhausted instead.
    pub fn resend_if_due(
        &mut self,
        now: Instant,
        resend_delay: Duration,
        max_attempts: u32,
        sink: &mut dyn ChannelSink,
    ) -> bool {
        if !self.is_due(now, resend_delay) {
            return false;
        }
        if self.attempts >= max_attempts {
            return true;
        }
        sink.send(&self.datagram, self.no_merge);
        self.attempts += 1;
        self.last_sent = now;
        false
    }
}

/// `[Data][channel][sequence]` header length.
pub(crate) const SEQUENCED_HEADER_LEN: usize = 4;

/// Build `[Data][channel][sequence][payload]` in an arena block.
pub(crate) fn encode_sequenced(
    memory: &MemoryManager,
    channel_id: u8,
    sequence: u16,
    payload: &[u8],
) -> HeapMemory {
    let mut block = memory.alloc(SEQUENCED_HEADER_LEN + payload.len());
    {
        let mut w = &mut block[..];
        w.put_u8(MessageType::Data as u8);
        w.put_u8(channel_id);
        w.put_u16(sequence);
        w.put_slice(payload);
    }
    block
}

/// Send `[Ack][channel][sequence]`.
pub(crate) fn send_plain_ack(sink: &mut dyn ChannelSink, channel_id: u8, sequence: u16) {
    let seq = sequence.to_be_bytes();
    let ack = [MessageType::Ack as u8, channel_id, seq[0], seq[1]];
    sink.send(&ack, false);
}

/// Read a leading big-endian `u16`.
#[inline]
pub(crate) fn read_u16(payload: &[u8]) -> Option<(u16, &[u8])> {
    match payload {
        [hi, lo, rest @ ..] => Some((u16::from_be_bytes([*hi, *lo]), rest)),
        _ => None,
    }
}

/// Wrap one block in a fresh pointer set.
pub(crate) fn single(memory: &MemoryManager, block: HeapMemory) -> PointerSet {
    let mut set = memory.alloc_pointer_set(1);
    set.push(block);
    set
}

// ─── Channel ────────────────────────────────────────────────────────────────

/// One channel slot of a connection.
#[derive(Debug)]
pub enum Channel {
    Unreliable(UnreliableChannel),
    UnreliableRaw(UnreliableRawChannel),
    UnreliableOrdered(UnreliableOrderedChannel),
    Reliable(ReliableChannel),
    ReliableOrdered(ReliableOrderedChannel),
    ReliableSequenced(ReliableSequencedChannel),
    ReliableSequencedFragmented(FragmentedChannel),
}

impl Channel {
    pub fn new(
        kind: ChannelType,
        channel_id: u8,
        config: ChannelConfig,
        memory: MemoryManager,
    ) -> Self {
        match kind {
            ChannelType::Unreliable => {
                Channel::Unreliable(UnreliableChannel::new(channel_id, config, memory))
            }
            ChannelType::UnreliableRaw => {
                Channel::UnreliableRaw(UnreliableRawChannel::new(channel_id, memory))
            }
            ChannelType::UnreliableOrdered => {
                Channel::UnreliableOrdered(UnreliableOrderedChannel::new(channel_id, memory))
            }
            ChannelType::Reliable => {
                Channel::Reliable(ReliableChannel::new(channel_id, config, memory))
            }
            ChannelType::ReliableOrdered => {
                Channel::ReliableOrdered(ReliableOrderedChannel::new(channel_id, config, memory))
            }
            ChannelType::ReliableSequenced => Channel::ReliableSequenced(
                ReliableSequencedChannel::new(channel_id, config, memory),
            ),
            ChannelType::ReliableSequencedFragmented => {
                Channel::ReliableSequencedFragmented(FragmentedChannel::new(
                    channel_id, config, memory,
                ))
            }
        }
    }

    pub fn channel_type(&self) -> ChannelType {
        match self {
            Channel::Unreliable(_) => ChannelType::Unreliable,
            Channel::UnreliableRaw(_) => ChannelType::UnreliableRaw,
            Channel::UnreliableOrdered(_) => ChannelType::UnreliableOrdered,
            Channel::Reliable(_) => ChannelType::Reliable,
            Channel::ReliableOrdered(_) => ChannelType::ReliableOrdered,
            Channel::ReliableSequenced(_) => ChannelType::ReliableSequenced,
            Channel::ReliableSequencedFragmented(_) => ChannelType::ReliableSequencedFragmented,
        }
    }

    /// Largest payload a single `create_outgoing` accepts at the given MTU.
    pub fn max_payload(&self, mtu: usize) -> usize {
        match self {
            Channel::UnreliableRaw(_) => mtu.saturating_sub(UnreliableRawChannel::HEADER_LEN),
            Channel::ReliableSequencedFragmented(c) => c.max_payload(mtu),
            _ => mtu.saturating_sub(SEQUENCED_HEADER_LEN),
        }
    }

    /// Frame `payload` and send it (or queue it when a send window is full).
    pub fn create_outgoing(
        &mut self,
        payload: &[u8],
        mtu: usize,
        no_merge: bool,
        notification_key: Option<u64>,
        now: Instant,
        sink: &mut dyn ChannelSink,
    ) -> Result<()> {
        match self {
            Channel::Unreliable(c) => c.create_outgoing(payload, mtu, no_merge, sink),
            Channel::UnreliableRaw(c) => c.create_outgoing(payload, mtu, no_merge, sink),
            Channel::UnreliableOrdered(c) => c.create_outgoing(payload, mtu, no_merge, sink),
            Channel::Reliable(c) => {
                c.create_outgoing(payload, mtu, no_merge, notification_key, now, sink)
            }
            Channel::ReliableOrdered(c) => {
                c.create_outgoing(payload, mtu, no_merge, notification_key, now, sink)
            }
            Channel::ReliableSequenced(c) => {
                c.create_outgoing(payload, mtu, no_merge, notification_key, now, sink)
            }
            Channel::ReliableSequencedFragmented(c) => {
                c.create_outgoing(payload, mtu, no_merge, notification_key, now, sink)
            }
        }
    }

    /// Process a `Data` body (everything after the channel id byte).
    pub fn handle_incoming(
        &mut self,
        payload: &[u8],
        sink: &mut dyn ChannelSink,
    ) -> Option<PointerSet> {
        match self {
            Channel::Unreliable(c) => c.handle_incoming(payload),
            Channel::UnreliableRaw(c) => c.handle_incoming(payload),
            Channel::UnreliableOrdered(c) => c.handle_incoming(payload),
            Channel::Reliable(c) => c.handle_incoming(payload, sink),
            Channel::ReliableOrdered(c) => c.handle_incoming(payload, sink),
            Channel::ReliableSequenced(c) => c.handle_incoming(payload, sink),
            Channel::ReliableSequencedFragmented(c) => c.handle_incoming(payload, sink),
        }
    }

    /// Process an `Ack` body (everything after the channel id byte).
    /// Newly acknowledged messages are appended to `acked`.
    pub fn handle_ack(
        &mut self,
        payload: &[u8],
        now: Instant,
        sink: &mut dyn ChannelSink,
        acked: &mut Vec<Acked>,
    ) {
        match self {
            Channel::Reliable(c) => c.handle_ack(payload, now, sink, acked),
            Channel::ReliableOrdered(c) => c.handle_ack(payload, now, acked),
            Channel::ReliableSequenced(c) => c.handle_ack(payload, now, sink, acked),
            Channel::ReliableSequencedFragmented(c) => c.handle_ack(payload, now, sink, acked),
            Channel::Unreliable(_) | Channel::UnreliableRaw(_) | Channel::UnreliableOrdered(_) => {
                tracing::debug!(
                    channel_type = %self.channel_type(),
                    "ack on unreliable channel dropped"
                );
            }
        }
    }

    /// Resend overdue messages. Returns `true` if a message ran out of
    /// attempts; the connection must then be dropped.
    pub fn tick(&mut self, now: Instant, resend_delay: Duration, sink: &mut dyn ChannelSink) -> bool {
        match self {
            Channel::Reliable(c) => c.tick(now, resend_delay, sink),
            Channel::ReliableOrdered(c) => c.tick(now, resend_delay, sink),
            Channel::ReliableSequenced(c) => c.tick(now, resend_delay, sink),
            Channel::ReliableSequencedFragmented(c) => c.tick(now, resend_delay, sink),
            Channel::Unreliable(_) | Channel::UnreliableRaw(_) | Channel::UnreliableOrdered(_) => {
                false
            }
        }
    }

    /// Drop all buffered state and return the channel to its initial state.
    pub fn release(&mut self) {
        match self {
            Channel::Unreliable(c) => c.reset(),
            Channel::UnreliableRaw(_) => {}
            Channel::UnreliableOrdered(c) => c.reset(),
            Channel::Reliable(c) => c.reset(),
            Channel::ReliableOrdered(c) => c.reset(),
            Channel::ReliableSequenced(c) => c.reset(),
            Channel::ReliableSequencedFragmented(c) => c.reset(),
        }
    }

    /// Messages awaiting acknowledgement (or a free window slot).
    pub fn pending_outgoing(&self) -> usize {
        match self {
            Channel::Reliable(c) => c.pending_outgoing(),
            Channel::ReliableOrdered(c) => c.pending_outgoing(),
            Channel::ReliableSequenced(c) => c.pending_outgoing(),
            Channel::ReliableSequencedFragmented(c) => c.pending_outgoing(),
            Channel::Unreliable(_) | Channel::UnreliableRaw(_) | Channel::UnreliableOrdered(_) => 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub fn memory() -> MemoryManager {
        MemoryManager::default()
    }

    /// Blocks of a delivered set, as byte vectors.
    pub fn contents(set: PointerSet) -> Vec<Vec<u8>> {
        let mut blocks = Vec::new();
        set.flatten_into(&mut blocks);
        blocks.iter().map(|b| b.to_vec()).collect()
    }

    /// Split captured datagrams into (data, acks), stripping type + channel.
    pub fn split(datagrams: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let mut data = Vec::new();
        let mut acks = Vec::new();
        for d in datagrams {
            match MessageType::from_byte(d[0]) {
                Some(MessageType::Data) => data.push(d[2..].to_vec()),
                Some(MessageType::Ack) => acks.push(d[2..].to_vec()),
                other => panic!("unexpected datagram type {other:?}"),
            }
        }
        (data, acks)
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn channel_reports_its_type() {
        for b in 0u8..=6 {
            let kind = ChannelType::from_byte(b).unwrap();
            let channel = Channel::new(kind, 3, ChannelConfig::default(), memory());
            assert_eq!(channel.channel_type(), kind);
        }
    }

    #[test]
    fn pending_resend_budget() {
        let memory = memory();
        let t0 = Instant::now();
        let mut pending = PendingOutgoing::new(memory.alloc_copy(b"x"), false, t0);
        let mut sink: Vec<Vec<u8>> = Vec::new();
        let delay = Duration::from_millis(10);

        assert!(!pending.resend_if_due(t0 + Duration::from_millis(5), delay, 3, &mut sink));
        assert!(sink.is_empty());
        assert!(!pending.resend_if_due(t0 + Duration::from_millis(11), delay, 3, &mut sink));
        assert!(!pending.resend_if_due(t0 + Duration::from_millis(22), delay, 3, &mut sink));
        assert_eq!(sink.len(), 2);
        assert_eq!(pending.attempts, 3);
        assert!(pending.resend_if_due(t0 + Duration::from_millis(33), delay, 3, &mut sink));
        assert!(pending.rtt_sample(t0).is_none());
    }

    #[test]
    fn oversize_payload_rejected_on_plain_channels() {
        let mut channel = Channel::new(
            ChannelType::Reliable,
            0,
            ChannelConfig::default(),
            memory(),
        );
        let mut sink: Vec<Vec<u8>> = Vec::new();
        let payload = vec![0u8; 600];
        let result = channel.create_outgoing(&payload, 512, false, None, Instant::now(), &mut sink);
        assert!(result.is_err());
        assert!(sink.is_empty());
        assert_eq!(channel.max_payload(512), 508);
    }
}
