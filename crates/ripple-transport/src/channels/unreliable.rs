//! Fire-and-forget channels: no acks, no resends.

use super::{encode_sequenced, read_u16, single, ChannelConfig, ChannelSink, SEQUENCED_HEADER_LEN};
use crate::error::{Result, TransportError};
use crate::memory::{MemoryManager, PointerSet};
use crate::sequence::{distance16, SequenceWindow};
use crate::wire::MessageType;

fn check_size(payload: &[u8], header: usize, mtu: usize) -> Result<()> {
    let max = mtu.saturating_sub(header);
    if payload.len() > max {
        return Err(TransportError::PayloadTooLarge {
            size: payload.len(),
            max,
        });
    }
    Ok(())
}

// ─── Unreliable ─────────────────────────────────────────────────────────────

/// Sequenced so the receiver can drop network-level duplicates.
#[derive(Debug)]
pub struct UnreliableChannel {
    channel_id: u8,
    memory: MemoryManager,
    next_sequence: u16,
    seen: SequenceWindow<()>,
    newest_seen: Option<u16>,
}

impl UnreliableChannel {
    pub fn new(channel_id: u8, config: ChannelConfig, memory: MemoryManager) -> Self {
        UnreliableChannel {
            channel_id,
            memory,
            next_sequence: 0,
            seen: SequenceWindow::new(config.duplicate_window_size),
            newest_seen: None,
        }
    }

    pub fn create_outgoing(
        &mut self,
        payload: &[u8],
        mtu: usize,
        no_merge: bool,
        sink: &mut dyn ChannelSink,
    ) -> Result<()> {
        check_size(payload, SEQUENCED_HEADER_LEN, mtu)?;
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let datagram = encode_sequenced(&self.memory, self.channel_id, sequence, payload);
        sink.send(&datagram, no_merge);
        Ok(())
    }

    pub fn handle_incoming(&mut self, payload: &[u8]) -> Option<PointerSet> {
        let (sequence, body) = read_u16(payload)?;

        if let Some(newest) = self.newest_seen {
            let offset = distance16(sequence, newest);
            // Older than anything the window still remembers.
            if offset <= -(self.seen.size() as i32) {
                tracing::trace!(channel_id = self.channel_id, sequence, "stale datagram dropped");
                return None;
            }
            if self.seen.contains(sequence) {
                tracing::trace!(channel_id = self.channel_id, sequence, "duplicate datagram dropped");
                return None;
            }
            if offset > 0 {
                self.newest_seen = Some(sequence);
            }
        } else {
            self.newest_seen = Some(sequence);
        }
        self.seen.insert(sequence, ());

        Some(single(&self.memory, self.memory.alloc_copy(body)))
    }

    pub fn reset(&mut self) {
        self.next_sequence = 0;
        self.seen.clear();
        self.newest_seen = None;
    }
}

// ─── UnreliableRaw ──────────────────────────────────────────────────────────

/// No sequencing at all; only the type and channel bytes precede the payload.
#[derive(Debug)]
pub struct UnreliableRawChannel {
    channel_id: u8,
    memory: MemoryManager,
}

impl UnreliableRawChannel {
    pub const HEADER_LEN: usize = 2;

    pub fn new(channel_id: u8, memory: MemoryManager) -> Self {
        UnreliableRawChannel { channel_id, memory }
    }

    pub fn create_outgoing(
        &mut self,
        payload: &[u8],
        mtu: usize,
        no_merge: bool,
        sink: &mut dyn ChannelSink,
    ) -> Result<()> {
        check_size(payload, Self::HEADER_LEN, mtu)?;
        let mut block = self.memory.alloc(Self::HEADER_LEN + payload.len());
        block[0] = MessageType::Data as u8;
        block[1] = self.channel_id;
        block[Self::HEADER_LEN..].copy_from_slice(payload);
        sink.send(&block, no_merge);
        Ok(())
    }

    pub fn handle_incoming(&mut self, payload: &[u8]) -> Option<PointerSet> {
        Some(single(&self.memory, self.memory.alloc_copy(payload)))
    }
}

// ─── UnreliableOrdered ──────────────────────────────────────────────────────

/// Accepts only sequences strictly newer than the last accepted one.
#[derive(Debug)]
pub struct UnreliableOrderedChannel {
    channel_id: u8,
    memory: MemoryManager,
    next_sequence: u16,
    last_received: Option<u16>,
}

impl UnreliableOrderedChannel {
    pub fn new(channel_id: u8, memory: MemoryManager) -> Self {
        UnreliableOrderedChannel {
            channel_id,
            memory,
            next_sequence: 0,
            last_received: None,
        }
    }

    pub fn create_outgoing(
        &mut self,
        payload: &[u8],
        mtu: usize,
        no_merge: bool,
        sink: &mut dyn ChannelSink,
    ) -> Result<()> {
        check_size(payload, SEQUENCED_HEADER_LEN, mtu)?;
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let datagram = encode_sequenced(&self.memory, self.channel_id, sequence, payload);
        sink.send(&datagram, no_merge);
        Ok(())
    }

    pub fn handle_incoming(&mut self, payload: &[u8]) -> Option<PointerSet> {
        let (sequence, body) = read_u16(payload)?;
        if let Some(last) = self.last_received {
            if distance16(sequence, last) <= 0 {
                tracing::trace!(
                    channel_id = self.channel_id,
                    sequence,
                    last,
                    "out-of-order datagram dropped"
                );
                return None;
            }
        }
        self.last_received = Some(sequence);
        Some(single(&self.memory, self.memory.alloc_copy(body)))
    }

    pub fn reset(&mut self) {
        self.next_sequence = 0;
        self.last_received = None;
    }
}
