//! Reliable delivery of the latest value only.
//!
//! A single outgoing slot: creating a message while the previous one is
//! still unacknowledged abandons the previous one. The receiver drops
//! anything not newer than what it already delivered, so a superseded
//! message can never surface after its successor.

use quanta::Instant;
use std::time::Duration;

use super::{
    encode_sequenced, read_u16, send_plain_ack, single, Acked, ChannelConfig, ChannelSink,
    PendingOutgoing, SEQUENCED_HEADER_LEN,
};
use crate::error::{Result, TransportError};
use crate::memory::{MemoryManager, PointerSet};
use crate::sequence::distance16;

#[derive(Debug)]
struct Latest {
    sequence: u16,
    pending: PendingOutgoing,
    notification_key: Option<u64>,
}

#[derive(Debug)]
pub struct ReliableOrderedChannel {
    channel_id: u8,
    memory: MemoryManager,
    max_attempts: u32,
    next_sequence: u16,
    outgoing: Option<Latest>,
    last_received: Option<u16>,
}

impl ReliableOrderedChannel {
    pub fn new(channel_id: u8, config: ChannelConfig, memory: MemoryManager) -> Self {
        ReliableOrderedChannel {
            channel_id,
            memory,
            max_attempts: config.max_resend_attempts,
            next_sequence: 0,
            outgoing: None,
            last_received: None,
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

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let datagram = encode_sequenced(&self.memory, self.channel_id, sequence, payload);
        sink.send(&datagram, no_merge);

        if let Some(superseded) = self.outgoing.replace(Latest {
            sequence,
            pending: PendingOutgoing::new(datagram, no_merge, now),
            notification_key,
        }) {
            tracing::trace!(
                channel_id = self.channel_id,
                sequence = superseded.sequence,
                "unacked message superseded"
            );
        }
        Ok(())
    }

    pub fn handle_incoming(
        &mut self,
        payload: &[u8],
        sink: &mut dyn ChannelSink,
    ) -> Option<PointerSet> {
        let (sequence, body) = read_u16(payload)?;
        send_plain_ack(sink, self.channel_id, sequence);

        if let Some(last) = self.last_received {
            if distance16(sequence, last) <= 0 {
                return None;
            }
        }
        self.last_received = Some(sequence);
        Some(single(&self.memory, self.memory.alloc_copy(body)))
    }

    pub fn handle_ack(&mut self, payload: &[u8], now: Instant, acked: &mut Vec<Acked>) {
        let Some((sequence, _)) = read_u16(payload) else {
            tracing::debug!(channel_id = self.channel_id, "truncated ack dropped");
            return;
        };
        if self.outgoing.as_ref().is_some_and(|l| l.sequence == sequence) {
            if let Some(latest) = self.outgoing.take() {
                acked.push(Acked {
                    notification_key: latest.notification_key,
                    rtt_sample: latest.pending.rtt_sample(now),
                });
            }
        }
    }

    pub fn tick(&mut self, now: Instant, resend_delay: Duration, sink: &mut dyn ChannelSink) -> bool {
        match &mut self.outgoing {
            Some(latest) => latest
                .pending
                .resend_if_due(now, resend_delay, self.max_attempts, sink),
            None => false,
        }
    }

    pub fn pending_outgoing(&self) -> usize {
        usize::from(self.outgoing.is_some())
    }

    pub fn reset(&mut self) {
        self.next_sequence = 0;
        self.outgoing = None;
        self.last_received = None;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;

    #[test]
    fn newer_message_supersedes_unacked() {
        let memory = memory();
        let config = ChannelConfig::default();
        let mut tx = ReliableOrderedChannel::new(6, config, memory.clone());
        let mut rx = ReliableOrderedChannel::new(6, config, memory);
        let t0 = Instant::now();
        let mut wire: Vec<Vec<u8>> = Vec::new();

        tx.create_outgoing(b"m1", 1200, false, Some(1), t0, &mut wire).unwrap();
        tx.create_outgoing(b"m2", 1200, false, Some(2), t0, &mut wire).unwrap();
        assert_eq!(tx.pending_outgoing(), 1);

        // Only m2 is resent.
        tx.tick(t0 + Duration::from_millis(100), Duration::from_millis(50), &mut wire);
        let (data, _) = split(wire);
        assert_eq!(data.len(), 3);
        assert_eq!(data[2], data[1]);

        let mut acks: Vec<Vec<u8>> = Vec::new();
        let first = rx.handle_incoming(&data[1], &mut acks).map(contents);
        assert_eq!(first, Some(vec![b"m2".to_vec()]));
        // m1 arriving late never surfaces.
        assert!(rx.handle_incoming(&data[0], &mut acks).is_none());

        let (_, acks) = split(acks);
        let mut acked = Vec::new();
        for ack in &acks {
            tx.handle_ack(ack, t0, &mut acked);
        }
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].notification_key, Some(2));
        assert_eq!(tx.pending_outgoing(), 0);
    }

    #[test]
    fn exhausts_attempts() {
        let config = ChannelConfig {
            max_resend_attempts: 1,
            ..ChannelConfig::default()
        };
        let mut tx = ReliableOrderedChannel::new(0, config, memory());
        let t0 = Instant::now();
        let mut wire: Vec<Vec<u8>> = Vec::new();
        tx.create_outgoing(b"v", 1200, false, None, t0, &mut wire).unwrap();
        assert!(tx.tick(t0 + Duration::from_millis(100), Duration::from_millis(50), &mut wire));
    }
}
