//! Sender half shared by the `Reliable` and `ReliableSequenced` channels:
//! a bounded window of in-flight messages keyed by sequence, plus an
//! unbounded backlog that drains as acks free window slots.

use quanta::Instant;
use std::collections::VecDeque;
use std::time::Duration;

use super::{encode_sequenced, Acked, ChannelSink, PendingOutgoing};
use crate::memory::{HeapMemory, MemoryManager};
use crate::sequence::{distance16, SequenceWindow};

#[derive(Debug)]
struct InFlight {
    pending: PendingOutgoing,
    notification_key: Option<u64>,
}

#[derive(Debug)]
struct Queued {
    payload: HeapMemory,
    no_merge: bool,
    notification_key: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct SendWindow {
    channel_id: u8,
    memory: MemoryManager,
    in_flight: SequenceWindow<InFlight>,
    backlog: VecDeque<Queued>,
    next_sequence: u16,
    lowest_unacked: u16,
    max_attempts: u32,
}

impl SendWindow {
    pub fn new(channel_id: u8, window_size: usize, max_attempts: u32, memory: MemoryManager) -> Self {
        SendWindow {
            channel_id,
            memory,
            in_flight: SequenceWindow::new(window_size),
            backlog: VecDeque::new(),
            next_sequence: 0,
            lowest_unacked: 0,
            max_attempts,
        }
    }

    fn has_room(&self) -> bool {
        (distance16(self.next_sequence, self.lowest_unacked) as usize) < self.in_flight.size()
    }

    /// Send now if the window has room, otherwise queue behind earlier sends.
    pub fn send(
        &mut self,
        payload: &[u8],
        no_merge: bool,
        notification_key: Option<u64>,
        now: Instant,
        sink: &mut dyn ChannelSink,
    ) {
        if self.backlog.is_empty() && self.has_room() {
            self.transmit(payload, no_merge, notification_key, now, sink);
        } else {
            tracing::trace!(
                channel_id = self.channel_id,
                backlog = self.backlog.len() + 1,
                "send window full, queueing"
            );
            self.backlog.push_back(Queued {
                payload: self.memory.alloc_copy(payload),
                no_merge,
                notification_key,
            });
        }
    }

    fn transmit(
        &mut self,
        payload: &[u8],
        no_merge: bool,
        notification_key: Option<u64>,
        now: Instant,
        sink: &mut dyn ChannelSink,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let datagram = encode_sequenced(&self.memory, self.channel_id, sequence, payload);
        sink.send(&datagram, no_merge);
        self.in_flight.insert(
            sequence,
            InFlight {
                pending: PendingOutgoing::new(datagram, no_merge, now),
                notification_key,
            },
        );
    }

    /// Mark `sequence` acknowledged. Returns `false` for unknown or repeated
    /// acks.
    pub fn ack(&mut self, sequence: u16, now: Instant, acked: &mut Vec<Acked>) -> bool {
        match self.in_flight.remove(sequence) {
            Some(entry) => {
                acked.push(Acked {
                    notification_key: entry.notification_key,
                    rtt_sample: entry.pending.rtt_sample(now),
                });
                true
            }
            None => false,
        }
    }

    /// Slide past acknowledged sequences and move backlog into freed slots.
    pub fn advance(&mut self, now: Instant, sink: &mut dyn ChannelSink) {
        while distance16(self.next_sequence, self.lowest_unacked) > 0
            && !self.in_flight.contains(self.lowest_unacked)
        {
            self.lowest_unacked = self.lowest_unacked.wrapping_add(1);
        }

        while self.has_room() {
            let Some(queued) = self.backlog.pop_front() else {
                break;
            };
            self.transmit(
                &queued.payload,
                queued.no_merge,
                queued.notification_key,
                now,
                sink,
            );
        }
    }

    /// Resend overdue messages; `true` once one exhausts its attempts.
    pub fn tick(&mut self, now: Instant, resend_delay: Duration, sink: &mut dyn ChannelSink) -> bool {
        let max_attempts = self.max_attempts;
        for (sequence, entry) in self.in_flight.iter_mut() {
            if entry
                .pending
                .resend_if_due(now, resend_delay, max_attempts, sink)
            {
                tracing::debug!(
                    channel_id = self.channel_id,
                    sequence,
                    attempts = entry.pending.attempts,
                    "message exhausted resend attempts"
                );
                return true;
            }
        }
        false
    }

    pub fn pending(&self) -> usize {
        self.in_flight.len() + self.backlog.len()
    }

    pub fn reset(&mut self) {
        self.in_flight.clear();
        self.backlog.clear();
        self.next_sequence = 0;
        self.lowest_unacked = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::test_util::memory;

    #[test]
    fn backlog_drains_as_acks_arrive() {
        let mut window = SendWindow::new(0, 4, 10, memory());
        let mut sink: Vec<Vec<u8>> = Vec::new();
        let now = Instant::now();

        for i in 0..6u8 {
            window.send(&[i], false, Some(i as u64), now, &mut sink);
        }
        assert_eq!(sink.len(), 4, "window holds four in flight");
        assert_eq!(window.pending(), 6);

        let mut acked = Vec::new();
        assert!(window.ack(0, now, &mut acked));
        assert!(window.ack(1, now, &mut acked));
        window.advance(now, &mut sink);
        assert_eq!(sink.len(), 6, "two backlog entries released");
        assert_eq!(acked.len(), 2);
        assert_eq!(acked[0].notification_key, Some(0));
        assert_eq!(window.pending(), 4);
    }

    #[test]
    fn out_of_order_ack_holds_window_base() {
        let mut window = SendWindow::new(0, 2, 10, memory());
        let mut sink: Vec<Vec<u8>> = Vec::new();
        let now = Instant::now();
        for i in 0..3u8 {
            window.send(&[i], false, None, now, &mut sink);
        }
        let mut acked = Vec::new();
        window.ack(1, now, &mut acked);
        window.advance(now, &mut sink);
        assert_eq!(sink.len(), 2, "sequence 0 still blocks the window");

        window.ack(0, now, &mut acked);
        window.advance(now, &mut sink);
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn repeated_ack_ignored() {
        let mut window = SendWindow::new(0, 8, 10, memory());
        let mut sink: Vec<Vec<u8>> = Vec::new();
        let now = Instant::now();
        window.send(b"a", false, None, now, &mut sink);
        let mut acked = Vec::new();
        assert!(window.ack(0, now, &mut acked));
        assert!(!window.ack(0, now, &mut acked));
        assert_eq!(acked.len(), 1);
    }
}
