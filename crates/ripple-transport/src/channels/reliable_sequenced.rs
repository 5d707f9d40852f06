//! Reliable, strictly ordered delivery.
//!
//! Out-of-order arrivals wait in a bounded receive window. When the next
//! expected sequence lands, it and every buffered successor that now forms
//! an unbroken run are handed over together in one pointer set.

use quanta::Instant;
use std::time::Duration;

use super::send_window::SendWindow;
use super::{read_u16, send_plain_ack, Acked, ChannelConfig, ChannelSink, SEQUENCED_HEADER_LEN};
use crate::error::{Result, TransportError};
use crate::memory::{HeapMemory, MemoryManager, PointerSet};
use crate::sequence::{distance16, SequenceWindow};

#[derive(Debug)]
pub struct ReliableSequencedChannel {
    channel_id: u8,
    memory: MemoryManager,
    sender: SendWindow,
    expected: u16,
    buffered: SequenceWindow<HeapMemory>,
}

impl ReliableSequencedChannel {
    pub fn new(channel_id: u8, config: ChannelConfig, memory: MemoryManager) -> Self {
        ReliableSequencedChannel {
            channel_id,
            sender: SendWindow::new(
                channel_id,
                config.reliability_window_size,
                config.max_resend_attempts,
                memory.clone(),
            ),
            memory,
            expected: 0,
            buffered: SequenceWindow::new(config.sequenced_window_size),
        }
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
        let max = mtu.saturating_sub(SEQUENCED_HEADER_LEN);
        if payload.len() > max {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        self.sender.send(payload, no_merge, notification_key, now, sink);
        Ok(())
    }

    pub fn handle_incoming(
        &mut self,
        payload: &[u8],
        sink: &mut dyn ChannelSink,
    ) -> Option<PointerSet> {
        let (sequence, body) = read_u16(payload)?;
        let offset = distance16(sequence, self.expected);

        if offset < 0 {
            send_plain_ack(sink, self.channel_id, sequence);
            return None;
        }
        if offset >= self.buffered.size() as i32 {
            tracing::warn!(
                channel_id = self.channel_id,
                sequence,
                expected = self.expected,
                "receive window full, datagram dropped"
            );
            return None;
        }
        send_plain_ack(sink, self.channel_id, sequence);

        if offset > 0 {
            if !self.buffered.contains(sequence) {
                self.buffered.insert(sequence, self.memory.alloc_copy(body));
            }
            return None;
        }

        let mut run = self.memory.alloc_pointer_set(1);
        run.push(self.memory.alloc_copy(body));
        self.expected = self.expected.wrapping_add(1);
        while let Some(block) = self.buffered.remove(self.expected) {
            run.push(block);
            self.expected = self.expected.wrapping_add(1);
        }
        Some(run)
    }

    pub fn handle_ack(
        &mut self,
        payload: &[u8],
        now: Instant,
        sink: &mut dyn ChannelSink,
        acked: &mut Vec<Acked>,
    ) {
        let Some((sequence, _)) = read_u16(payload) else {
            tracing::debug!(channel_id = self.channel_id, "truncated ack dropped");
            return;
        };
        if self.sender.ack(sequence, now, acked) {
            self.sender.advance(now, sink);
        }
    }

    pub fn tick(&mut self, now: Instant, resend_delay: Duration, sink: &mut dyn ChannelSink) -> bool {
        self.sender.tick(now, resend_delay, sink)
    }

    pub fn pending_outgoing(&self) -> usize {
        self.sender.pending()
    }

    pub fn reset(&mut self) {
        self.sender.reset();
        self.expected = 0;
        self.buffered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;

    fn send_all(tx: &mut ReliableSequencedChannel, messages: &[&[u8]]) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let mut wire: Vec<Vec<u8>> = Vec::new();
        for m in messages {
            tx.create_outgoing(m, 1200, false, None, now, &mut wire).unwrap();
        }
        split(wire).0
    }

    #[test]
    fn gap_closure_releases_run_in_one_set() {
        let memory = memory();
        let config = ChannelConfig::default();
        let mut tx = ReliableSequencedChannel::new(3, config, memory.clone());
        let mut rx = ReliableSequencedChannel::new(3, config, memory);
        let data = send_all(&mut tx, &[b"0", b"1", b"2", b"3"]);

        let mut acks: Vec<Vec<u8>> = Vec::new();
        assert!(rx.handle_incoming(&data[2], &mut acks).is_none());
        assert!(rx.handle_incoming(&data[3], &mut acks).is_none());
        assert!(rx.handle_incoming(&data[1], &mut acks).is_none());

        let run = rx.handle_incoming(&data[0], &mut acks).unwrap();
        assert_eq!(run.len(), 4);
        assert_eq!(
            contents(run),
            vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );
        assert_eq!(acks.len(), 4);
    }

    #[test]
    fn old_sequence_reacked_not_redelivered() {
        let mut rx = ReliableSequencedChannel::new(0, ChannelConfig::default(), memory());
        let mut acks: Vec<Vec<u8>> = Vec::new();
        assert!(rx.handle_incoming(&[0, 0, b'a'], &mut acks).is_some());
        assert!(rx.handle_incoming(&[0, 0, b'a'], &mut acks).is_none());
        assert_eq!(acks.len(), 2);
    }

    #[test]
    fn window_full_drops_with_no_ack() {
        let config = ChannelConfig {
            sequenced_window_size: 4,
            ..ChannelConfig::default()
        };
        let mut rx = ReliableSequencedChannel::new(0, config, memory());
        let mut acks: Vec<Vec<u8>> = Vec::new();
        assert!(rx.handle_incoming(&[0, 4, b'x'], &mut acks).is_none());
        assert!(acks.is_empty());
        assert!(rx.handle_incoming(&[0, 3, b'y'], &mut acks).is_none());
        assert_eq!(acks.len(), 1);
    }

    #[test]
    fn ack_frees_window_for_backlog() {
        let config = ChannelConfig {
            reliability_window_size: 1,
            ..ChannelConfig::default()
        };
        let mut tx = ReliableSequencedChannel::new(0, config, memory());
        let now = Instant::now();
        let mut wire: Vec<Vec<u8>> = Vec::new();
        tx.create_outgoing(b"a", 1200, false, Some(1), now, &mut wire).unwrap();
        tx.create_outgoing(b"b", 1200, false, Some(2), now, &mut wire).unwrap();
        assert_eq!(wire.len(), 1);

        let mut acked = Vec::new();
        tx.handle_ack(&[0, 0], now, &mut wire, &mut acked);
        assert_eq!(wire.len(), 2);
        assert_eq!(acked[0].notification_key, Some(1));
        assert_eq!(tx.pending_outgoing(), 1);
    }
}
