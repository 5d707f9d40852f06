//! # Packet Merger
//!
//! Nagle-style batching of small outgoing datagrams for one connection.
//!
//! ```text
//!  | Merge | len (2) | datagram | len (2) | datagram | ...
//! ```
//!
//! Datagrams accumulate until the next one would overflow `max_size`, or
//! until the oldest has waited `max_delay`. A batch that holds a single
//! datagram is sent as that datagram, without the merge framing.

use bytes::{BufMut, BytesMut};
use quanta::Instant;
use std::time::Duration;

use crate::wire::MessageType;

/// Per-entry length prefix.
const ENTRY_OVERHEAD: usize = 2;

#[derive(Debug)]
pub struct PacketMerger {
    buffer: BytesMut,
    max_size: usize,
    max_delay: Duration,
    count: usize,
    oldest: Option<Instant>,
}

impl PacketMerger {
    pub fn new(max_size: usize, max_delay: Duration) -> Self {
        let mut buffer = BytesMut::with_capacity(max_size);
        buffer.put_u8(MessageType::Merge as u8);
        PacketMerger {
            buffer,
            max_size,
            max_delay,
            count: 0,
            oldest: None,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Grow (or shrink) the batch limit, e.g. after an MTU increase. A batch
    /// already over the new limit is flushed through `out`.
    pub fn set_max_size(&mut self, max_size: usize, out: &mut dyn FnMut(&[u8])) {
        if self.buffer.len() > max_size {
            self.flush(out);
        }
        self.max_size = max_size;
        self.buffer.reserve(max_size.saturating_sub(self.buffer.capacity()));
    }

    /// Datagrams waiting in the current batch.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Queue `datagram`, emitting through `out` whatever has to leave first.
    /// Datagrams too large to share a batch go out directly, after the
    /// current batch, so the send order is preserved.
    pub fn push(&mut self, datagram: &[u8], now: Instant, out: &mut dyn FnMut(&[u8])) {
        if datagram.is_empty() {
            return;
        }
        let entry = ENTRY_OVERHEAD + datagram.len();
        if 1 + entry > self.max_size || datagram.len() > u16::MAX as usize {
            self.flush(out);
            out(datagram);
            return;
        }
        if self.buffer.len() + entry > self.max_size {
            self.flush(out);
        }

        self.buffer.put_u16(datagram.len() as u16);
        self.buffer.put_slice(datagram);
        self.count += 1;
        self.oldest.get_or_insert(now);
    }

    /// Whether the oldest queued datagram has waited long enough.
    pub fn is_due(&self, now: Instant) -> bool {
        self.oldest
            .is_some_and(|oldest| now.saturating_duration_since(oldest) >= self.max_delay)
    }

    /// Emit the current batch, if any.
    pub fn flush(&mut self, out: &mut dyn FnMut(&[u8])) {
        match self.count {
            0 => {}
            1 => out(&self.buffer[1 + ENTRY_OVERHEAD..]),
            _ => out(&self.buffer),
        }
        self.buffer.truncate(1);
        self.count = 0;
        self.oldest = None;
    }

    /// Drop the current batch without sending it.
    pub fn clear(&mut self) {
        self.buffer.truncate(1);
        self.count = 0;
        self.oldest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MergedDatagrams;

    fn collect(merger: &mut PacketMerger, f: impl FnOnce(&mut PacketMerger, &mut dyn FnMut(&[u8]))) -> Vec<Vec<u8>> {
        let mut sent = Vec::new();
        f(merger, &mut |d: &[u8]| sent.push(d.to_vec()));
        sent
    }

    #[test]
    fn batches_until_full() {
        let now = Instant::now();
        let mut merger = PacketMerger::new(16, Duration::from_millis(10));
        let sent = collect(&mut merger, |m, out| {
            m.push(&[1, 1, 1], now, out);
            m.push(&[2, 2, 2], now, out);
            // 1 + 5 + 5 + 5 = 16 fits exactly.
            m.push(&[3, 3, 3], now, out);
            m.push(&[4, 4, 4], now, out);
        });
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], MessageType::Merge as u8);
        let parts: Vec<&[u8]> = MergedDatagrams::new(&sent[0][1..]).collect();
        assert_eq!(parts, vec![&[1u8, 1, 1][..], &[2u8, 2, 2][..], &[3u8, 3, 3][..]]);
        assert_eq!(merger.len(), 1);
    }

    #[test]
    fn single_datagram_sent_unwrapped() {
        let now = Instant::now();
        let mut merger = PacketMerger::new(64, Duration::from_millis(10));
        let sent = collect(&mut merger, |m, out| {
            m.push(&[6, 0, 0, 1, 42], now, out);
            m.flush(out);
        });
        assert_eq!(sent, vec![vec![6, 0, 0, 1, 42]]);
        assert!(merger.is_empty());
    }

    #[test]
    fn oversize_bypasses_after_flushing() {
        let now = Instant::now();
        let mut merger = PacketMerger::new(8, Duration::from_millis(10));
        let sent = collect(&mut merger, |m, out| {
            m.push(&[1], now, out);
            m.push(&[9; 8], now, out);
        });
        assert_eq!(sent, vec![vec![1], vec![9; 8]]);
    }

    #[test]
    fn due_after_max_delay() {
        let t0 = Instant::now();
        let mut merger = PacketMerger::new(64, Duration::from_millis(10));
        assert!(!merger.is_due(t0));
        merger.push(&[1], t0, &mut |_| {});
        assert!(!merger.is_due(t0 + Duration::from_millis(5)));
        assert!(merger.is_due(t0 + Duration::from_millis(10)));
    }

    #[test]
    fn shrinking_flushes_oversized_batch() {
        let now = Instant::now();
        let mut merger = PacketMerger::new(64, Duration::from_millis(10));
        let sent = collect(&mut merger, |m, out| {
            m.push(&[1; 10], now, out);
            m.push(&[2; 10], now, out);
            m.set_max_size(16, out);
        });
        assert_eq!(sent.len(), 1);
        assert_eq!(merger.max_size(), 16);
    }
}
