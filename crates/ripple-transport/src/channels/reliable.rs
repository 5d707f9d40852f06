//! Reliable, unordered delivery with selective acks.
//!
//! Every message is delivered exactly once, as soon as it arrives. Each
//! received datagram is answered with
//! `[Ack][channel][sequence][u64 mask]`, where bit `i` of the mask reports
//! sequence `sequence - 1 - i`, so a single surviving ack can cover up to 64
//! earlier losses of the ack path.

use bytes::BufMut;
use quanta::Instant;
use std::time::Duration;

use super::send_window::SendWindow;
use super::{read_u16, single, Acked, ChannelConfig, ChannelSink, SEQUENCED_HEADER_LEN};
use crate::error::{Result, TransportError};
use crate::memory::{MemoryManager, PointerSet};
use crate::sequence::{distance16, SequenceWindow};
use crate::wire::MessageType;

/// Number of preceding sequences covered by an ack.
pub const SACK_BITS: u16 = 64;

const ACK_LEN: usize = 4 + 8;

#[derive(Debug)]
pub struct ReliableChannel {
    channel_id: u8,
    memory: MemoryManager,
    sender: SendWindow,
    /// Everything before this sequence has been received.
    incoming_lowest: u16,
    /// Out-of-order arrivals at or above `incoming_lowest`.
    received: SequenceWindow<()>,
}

impl ReliableChannel {
    pub fn new(channel_id: u8, config: ChannelConfig, memory: MemoryManager) -> Self {
        ReliableChannel {
            channel_id,
            sender: SendWindow::new(
                channel_id,
                config.reliability_window_size,
                config.max_resend_attempts,
                memory.clone(),
            ),
            memory,
            incoming_lowest: 0,
            received: SequenceWindow::new(config.reliability_window_size),
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

    fn is_received(&self, sequence: u16) -> bool {
        distance16(sequence, self.incoming_lowest) < 0 || self.received.contains(sequence)
    }

    fn send_ack(&self, sequence: u16, sink: &mut dyn ChannelSink) {
        let mut mask = 0u64;
        for i in 0..SACK_BITS {
            if self.is_received(sequence.wrapping_sub(1 + i)) {
                mask |= 1 << i;
            }
        }

        let mut ack = [0u8; ACK_LEN];
        {
            let mut w = &mut ack[..];
            w.put_u8(MessageType::Ack as u8);
            w.put_u8(self.channel_id);
            w.put_u16(sequence);
            w.put_u64(mask);
        }
        sink.send(&ack, false);
    }

    pub fn handle_incoming(
        &mut self,
        payload: &[u8],
        sink: &mut dyn ChannelSink,
    ) -> Option<PointerSet> {
        let (sequence, body) = read_u16(payload)?;
        let offset = distance16(sequence, self.incoming_lowest);

        if offset >= self.received.size() as i32 {
            tracing::warn!(
                channel_id = self.channel_id,
                sequence,
                lowest = self.incoming_lowest,
                "sequence beyond receive window dropped"
            );
            return None;
        }
        if offset < 0 || self.received.contains(sequence) {
            // Our ack was lost; repeat it.
            self.send_ack(sequence, sink);
            return None;
        }

        self.received.insert(sequence, ());
        while self.received.remove(self.incoming_lowest).is_some() {
            self.incoming_lowest = self.incoming_lowest.wrapping_add(1);
        }
        self.send_ack(sequence, sink);

        Some(single(&self.memory, self.memory.alloc_copy(body)))
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
        self.sender.ack(sequence, now, acked);

        if let Some(mask) = rest.get(..8) {
            let mut bits = [0u8; 8];
            bits.copy_from_slice(mask);
            let mask = u64::from_be_bytes(bits);
            for i in 0..SACK_BITS {
                if mask & (1 << i) != 0 {
                    self.sender.ack(sequence.wrapping_sub(1 + i), now, acked);
                }
            }
        }

        self.sender.advance(now, sink);
    }

    pub fn tick(&mut self, now: Instant, resend_delay: Duration, sink: &mut dyn ChannelSink) -> bool {
        self.sender.tick(now, resend_delay, sink)
    }

    pub fn pending_outgoing(&self) -> usize {
        self.sender.pending()
    }

    pub fn reset(&mut self) {
        self.sender.reset();
        self.incoming_lowest = 0;
        self.received.clear();
    }
}
