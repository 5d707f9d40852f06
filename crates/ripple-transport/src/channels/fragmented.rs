//! Reliable, ordered delivery of payloads larger than one datagram.
//!
//! A message is cut into fragments sharing one sequence number:
//!
//! ```text
//!  | Data | channel | sequence (2) | fragment field (2) | chunk |
//!  | Ack  | channel | sequence (2) | fragment index (2) |
//! ```
//!
//! Every fragment is acknowledged and resent on its own, so losing one
//! fragment costs one retransmission. A message is delivered once all of its
//! fragments are present and every earlier message has been delivered;
//! completed runs leave the channel together, one contiguous block per
//! message.

use bytes::BufMut;
use quanta::Instant;
use std::collections::VecDeque;
use std::time::Duration;

use super::{read_u16, Acked, ChannelConfig, ChannelSink, PendingOutgoing};
use crate::error::{Result, TransportError};
use crate::memory::{HeapMemory, MemoryManager, PointerSet};
use crate::sequence::{distance16, SequenceWindow};
use crate::wire::{FragmentField, MessageType, MAX_FRAGMENT_INDEX};

/// `[Data][channel][sequence][fragment]`
pub const FRAGMENT_HEADER_LEN: usize = 6;

// ─── Sender state ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct OutgoingMessage {
    fragments: Vec<Option<PendingOutgoing>>,
    remaining: usize,
    notification_key: Option<u64>,
}

#[derive(Debug)]
struct Queued {
    payload: HeapMemory,
    chunk_size: usize,
    no_merge: bool,
    notification_key: Option<u64>,
}

// ─── Receiver state ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct IncomingMessage {
    fragments: Vec<Option<HeapMemory>>,
    received: usize,
    total: Option<usize>,
}

impl IncomingMessage {
    fn is_complete(&self) -> bool {
        self.total == Some(self.received)
    }
}

#[derive(Debug)]
pub struct FragmentedChannel {
    channel_id: u8,
    memory: MemoryManager,
    max_fragments: usize,
    max_attempts: u32,

    next_sequence: u16,
    lowest_unacked: u16,
    outgoing: SequenceWindow<OutgoingMessage>,
    backlog: VecDeque<Queued>,

    expected: u16,
    incoming: SequenceWindow<IncomingMessage>,
}

impl FragmentedChannel {
    pub fn new(channel_id: u8, config: ChannelConfig, memory: MemoryManager) -> Self {
        FragmentedChannel {
            channel_id,
            memory,
            max_fragments: config
                .max_fragments
                .clamp(1, usize::from(MAX_FRAGMENT_INDEX) + 1),
            max_attempts: config.max_resend_attempts,
            next_sequence: 0,
            lowest_unacked: 0,
            outgoing: SequenceWindow::new(config.fragment_window_size),
            backlog: VecDeque::new(),
            expected: 0,
            incoming: SequenceWindow::new(config.fragment_window_size),
        }
    }

    /// Largest message the channel accepts at the given MTU.
    pub fn max_payload(&self, mtu: usize) -> usize {
        mtu.saturating_sub(FRAGMENT_HEADER_LEN) * self.max_fragments
    }

    /// Number of fragments `len` bytes split into at the given chunk size.
    pub fn fragment_count(len: usize, chunk_size: usize) -> usize {
        len.div_ceil(chunk_size.max(1)).max(1)
    }

    pub fn create_outgoing(
        &mut self,
        payload: &[u8],
        mtu: usize,
        no_merge: bool,
        notification_key: Option<u64>,
        now: Instant,
        sink: &mut dyn ChannelSink,
    ) -> Result<()> {
        let chunk_size = mtu.saturating_sub(FRAGMENT_HEADER_LEN);
        let max = self.max_payload(mtu);
        if chunk_size == 0 || payload.len() > max {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        if self.backlog.is_empty() && self.has_room() {
            self.transmit(payload, chunk_size, no_merge, notification_key, now, sink);
        } else {
            tracing::trace!(
                channel_id = self.channel_id,
                backlog = self.backlog.len() + 1,
                "fragment window full, queueing"
            );
            self.backlog.push_back(Queued {
                payload: self.memory.alloc_copy(payload),
                chunk_size,
                no_merge,
                notification_key,
            });
        }
        Ok(())
    }

    fn has_room(&self) -> bool {
        (distance16(self.next_sequence, self.lowest_unacked) as usize) < self.outgoing.size()
    }

    fn transmit(
        &mut self,
        payload: &[u8],
        chunk_size: usize,
        no_merge: bool,
        notification_key: Option<u64>,
        now: Instant,
        sink: &mut dyn ChannelSink,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let count = Self::fragment_count(payload.len(), chunk_size);
        let mut fragments = Vec::with_capacity(count);
        for index in 0..count {
            let start = index * chunk_size;
            let chunk = &payload[start.min(payload.len())..(start + chunk_size).min(payload.len())];
            let field = FragmentField::new(index as u16, index + 1 == count);

            let mut datagram = self.memory.alloc(FRAGMENT_HEADER_LEN + chunk.len());
            {
                let mut w = &mut datagram[..];
                w.put_u8(MessageType::Data as u8);
                w.put_u8(self.channel_id);
                w.put_u16(sequence);
                w.put_u16(field.to_bits());
                w.put_slice(chunk);
            }
            sink.send(&datagram, no_merge);
            fragments.push(Some(PendingOutgoing::new(datagram, no_merge, now)));
        }

        self.outgoing.insert(
            sequence,
            OutgoingMessage {
                fragments,
                remaining: count,
                notification_key,
            },
        );
    }

    fn send_ack(&self, sequence: u16, index: u16, sink: &mut dyn ChannelSink) {
        let mut ack = [0u8; 6];
        {
            let mut w = &mut ack[..];
            w.put_u8(MessageType::Ack as u8);
            w.put_u8(self.channel_id);
            w.put_u16(sequence);
            w.put_u16(index);
        }
        sink.send(&ack, false);
    }

    pub fn handle_incoming(
        &mut self,
        payload: &[u8],
        sink: &mut dyn ChannelSink,
    ) -> Option<PointerSet> {
        let (sequence, rest) = read_u16(payload)?;
        let (bits, chunk) = read_u16(rest)?;
        let field = FragmentField::from_bits(bits);
        let index = usize::from(field.index);

        let offset = distance16(sequence, self.expected);
        if offset < 0 {
            self.send_ack(sequence, field.index, sink);
            return None;
        }
        if offset >= self.incoming.size() as i32 {
            tracing::warn!(
                channel_id = self.channel_id,
                sequence,
                expected = self.expected,
                "fragment window full, datagram dropped"
            );
            return None;
        }
        if index >= self.max_fragments {
            tracing::debug!(
                channel_id = self.channel_id,
                sequence,
                index,
                "fragment index out of range"
            );
            return None;
        }

        if !self.incoming.contains(sequence) {
            self.incoming.insert(sequence, IncomingMessage::default());
        }
        let message = self.incoming.get_mut(sequence)?;

        let total = if field.is_final { Some(index + 1) } else { message.total };
        let inconsistent = match (message.total, total) {
            (Some(known), Some(now)) => known != now,
            _ => false,
        } || total.is_some_and(|t| index >= t || message.fragments.len() > t);
        if inconsistent {
            tracing::debug!(
                channel_id = self.channel_id,
                sequence,
                index,
                "fragment inconsistent with final marker"
            );
            return None;
        }

        if message.fragments.len() <= index {
            message.fragments.resize_with(index + 1, || None);
        }
        let memory = &self.memory;
        let slot = &mut message.fragments[index];
        if slot.is_none() {
            *slot = Some(memory.alloc_copy(chunk));
            message.received += 1;
        }
        message.total = total;
        let complete = message.is_complete();
        self.send_ack(sequence, field.index, sink);

        if sequence == self.expected && complete {
            Some(self.release_run())
        } else {
            None
        }
    }

    /// Pop every complete message starting at `expected`.
    fn release_run(&mut self) -> PointerSet {
        let mut run = self.memory.alloc_pointer_set(1);
        while self
            .incoming
            .get(self.expected)
            .is_some_and(IncomingMessage::is_complete)
        {
            let Some(message) = self.incoming.remove(self.expected) else {
                break;
            };
            let size = message.fragments.iter().flatten().map(|b| b.len()).sum();
            let mut block = self.memory.alloc(size);
            let mut at = 0;
            for fragment in message.fragments.into_iter().flatten() {
                block[at..at + fragment.len()].copy_from_slice(&fragment);
                at += fragment.len();
            }
            run.push(block);
            self.expected = self.expected.wrapping_add(1);
        }
        run
    }

    pub fn handle_ack(
        &mut self,
        payload: &[u8],
        now: Instant,
        sink: &mut dyn ChannelSink,
        acked: &mut Vec<Acked>,
    ) {
        let Some((sequence, rest)) = read_u16(payload) else {
            tracing::debug!(channel_id = self.channel_id, "truncated ack dropped");
            return;
        };
        let Some((index, _)) = read_u16(rest) else {
            tracing::debug!(channel_id = self.channel_id, sequence, "ack without fragment index");
            return;
        };

        let Some(message) = self.outgoing.get_mut(sequence) else {
            return;
        };
        let Some(pending) = message
            .fragments
            .get_mut(usize::from(index))
            .and_then(Option::take)
        else {
            return;
        };
        message.remaining -= 1;
        if message.remaining > 0 {
            return;
        }

        let rtt_sample = pending.rtt_sample(now);
        if let Some(message) = self.outgoing.remove(sequence) {
            acked.push(Acked {
                notification_key: message.notification_key,
                rtt_sample,
            });
        }
        self.advance(now, sink);
    }

    fn advance(&mut self, now: Instant, sink: &mut dyn ChannelSink) {
        while distance16(self.next_sequence, self.lowest_unacked) > 0
            && !self.outgoing.contains(self.lowest_unacked)
        {
            self.lowest_unacked = self.lowest_unacked.wrapping_add(1);
        }
        while self.has_room() {
            let Some(queued) = self.backlog.pop_front() else {
                break;
            };
            self.transmit(
                &queued.payload,
                queued.chunk_size,
                queued.no_merge,
                queued.notification_key,
                now,
                sink,
            );
        }
    }

    pub fn tick(&mut self, now: Instant, resend_delay: Duration, sink: &mut dyn ChannelSink) -> bool {
        let max_attempts = self.max_attempts;
        for (sequence, message) in self.outgoing.iter_mut() {
            for pending in message.fragments.iter_mut().flatten() {
                if pending.resend_if_due(now, resend_delay, max_attempts, sink) {
                    tracing::debug!(
                        channel_id = self.channel_id,
                        sequence,
                        "fragment exhausted resend attempts"
                    );
                    return true;
                }
            }
        }
        false
    }

    /// Messages not yet fully acknowledged, queued ones included.
    pub fn pending_outgoing(&self) -> usize {
        self.outgoing.len() + self.backlog.len()
    }

    pub fn reset(&mut self) {
        self.next_sequence = 0;
        self.lowest_unacked = 0;
        self.outgoing.clear();
        self.backlog.clear();
        self.expected = 0;
        self.incoming.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;

    const MTU: usize = 16;
    const CHUNK: usize = MTU - FRAGMENT_HEADER_LEN;

    fn pair() -> (FragmentedChannel, FragmentedChannel) {
        let memory = memory();
        let config = ChannelConfig::default();
        (
            FragmentedChannel::new(5, config, memory.clone()),
            FragmentedChannel::new(5, config, memory),
        )
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn splits_into_expected_fragment_count() {
        let (mut tx, _) = pair();
        let mut wire: Vec<Vec<u8>> = Vec::new();
        tx.create_outgoing(&payload(3 * CHUNK + 4), MTU, false, None, Instant::now(), &mut wire)
            .unwrap();
        assert_eq!(wire.len(), 4);
        let last = FragmentField::from_bits(u16::from_be_bytes([wire[3][4], wire[3][5]]));
        assert_eq!(last, FragmentField::new(3, true));
        assert!(wire.iter().all(|d| d.len() <= MTU));
    }

    #[test]
    fn reassembles_in_reverse_order() {
        let (mut tx, mut rx) = pair();
        let original = payload(5 * CHUNK + 1);
        let mut wire: Vec<Vec<u8>> = Vec::new();
        tx.create_outgoing(&original, MTU, false, None, Instant::now(), &mut wire)
            .unwrap();
        let (data, _) = split(wire);

        let mut acks: Vec<Vec<u8>> = Vec::new();
        let mut delivered = None;
        for d in data.iter().rev() {
            if let Some(set) = rx.handle_incoming(d, &mut acks) {
                delivered = Some(contents(set));
            }
        }
        assert_eq!(delivered, Some(vec![original]));
        assert_eq!(acks.len(), 6);
    }

    #[test]
    fn lost_fragment_is_the_only_resend() {
        let (mut tx, mut rx) = pair();
        let t0 = Instant::now();
        let mut wire: Vec<Vec<u8>> = Vec::new();
        tx.create_outgoing(&payload(3 * CHUNK), MTU, false, Some(9), t0, &mut wire)
            .unwrap();
        let (data, _) = split(wire);

        let mut acks: Vec<Vec<u8>> = Vec::new();
        rx.handle_incoming(&data[0], &mut acks);
        rx.handle_incoming(&data[2], &mut acks);
        let (_, acks) = split(acks);

        let mut acked = Vec::new();
        let mut resent: Vec<Vec<u8>> = Vec::new();
        for ack in &acks {
            tx.handle_ack(ack, t0, &mut resent, &mut acked);
        }
        assert!(acked.is_empty());

        tx.tick(t0 + Duration::from_millis(200), Duration::from_millis(100), &mut resent);
        assert_eq!(resent.len(), 1);
        let (again, _) = split(resent);
        assert_eq!(again[0], data[1]);

        let mut acks: Vec<Vec<u8>> = Vec::new();
        let set = rx.handle_incoming(&again[0], &mut acks).unwrap();
        assert_eq!(contents(set), vec![payload(3 * CHUNK)]);

        let (_, acks) = split(acks);
        let mut sink: Vec<Vec<u8>> = Vec::new();
        tx.handle_ack(&acks[0], t0, &mut sink, &mut acked);
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].notification_key, Some(9));
        assert_eq!(tx.pending_outgoing(), 0);
    }

    #[test]
    fn later_message_waits_for_earlier() {
        let (mut tx, mut rx) = pair();
        let now = Instant::now();
        let mut wire: Vec<Vec<u8>> = Vec::new();
        tx.create_outgoing(b"first", MTU, false, None, now, &mut wire).unwrap();
        tx.create_outgoing(b"second", MTU, false, None, now, &mut wire).unwrap();
        let (data, _) = split(wire);

        let mut acks: Vec<Vec<u8>> = Vec::new();
        assert!(rx.handle_incoming(&data[1], &mut acks).is_none());
        let run = rx.handle_incoming(&data[0], &mut acks).unwrap();
        assert_eq!(contents(run), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn empty_payload_is_one_fragment() {
        let (mut tx, mut rx) = pair();
        let mut wire: Vec<Vec<u8>> = Vec::new();
        tx.create_outgoing(&[], MTU, false, None, Instant::now(), &mut wire).unwrap();
        assert_eq!(wire.len(), 1);
        let (data, _) = split(wire);
        let mut acks: Vec<Vec<u8>> = Vec::new();
        let set = rx.handle_incoming(&data[0], &mut acks).unwrap();
        assert_eq!(contents(set), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn oversize_message_rejected() {
        let config = ChannelConfig {
            max_fragments: 2,
            ..ChannelConfig::default()
        };
        let mut tx = FragmentedChannel::new(0, config, memory());
        let mut wire: Vec<Vec<u8>> = Vec::new();
        let result = tx.create_outgoing(&payload(2 * CHUNK + 1), MTU, false, None, Instant::now(), &mut wire);
        assert!(matches!(result, Err(TransportError::PayloadTooLarge { .. })));
        assert!(wire.is_empty());
    }
}
