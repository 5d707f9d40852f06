//! # Proof-of-work
//!
//! Hashcash-style puzzles used during connection establishment.
//!
//! A puzzle is an `initial` value and a `difficulty`; a solution is a
//! `counter` such that the lowest `difficulty` bits of
//! `fnv1a64(initial + counter)` are all zero. Verifying costs one hash,
//! solving costs `2^difficulty` hashes on average.
//!
//! Two puzzles are in play:
//!
//! - the optional **pre-solve** a client attaches to its `ConnectionRequest`
//!   (`initial = unix_timestamp + iv`), which lets the server reject floods
//!   before it allocates anything;
//! - the server-issued **challenge** answered by `ChallengeResponse`.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the big-endian bytes of `value`.
#[inline]
pub fn fnv1a64(value: u64) -> u64 {
    value
        .to_be_bytes()
        .iter()
        .fold(FNV_OFFSET, |hash, &byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
}

/// Whether `counter` solves the puzzle `(initial, difficulty)`.
#[inline]
pub fn validate(initial: u64, counter: u64, difficulty: u8) -> bool {
    let hash = fnv1a64(initial.wrapping_add(counter));
    match difficulty {
        0 => true,
        d if d >= 64 => hash == 0,
        d => hash & ((1u64 << d) - 1) == 0,
    }
}

/// Search counters `0..max_iterations` for a solution.
pub fn solve(initial: u64, difficulty: u8, max_iterations: u64) -> Option<u64> {
    (0..max_iterations).find(|&counter| validate(initial, counter, difficulty))
}

/// Seconds since the unix epoch according to the local clock.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ─── Pre-solve ──────────────────────────────────────────────────────────────

/// Time-windowed proof-of-work carried by a `ConnectionRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreSolve {
    /// Unix timestamp (seconds) the work was started at.
    pub timestamp: u64,
    /// Solution counter.
    pub counter: u64,
    /// Random initialisation vector, unique per attempt.
    pub iv: u64,
}

impl PreSolve {
    /// Compute a pre-solve for `timestamp` and `iv`, or `None` if no counter
    /// below `max_iterations` works.
    pub fn compute(timestamp: u64, iv: u64, difficulty: u8, max_iterations: u64) -> Option<Self> {
        let counter = solve(timestamp.wrapping_add(iv), difficulty, max_iterations)?;
        Some(PreSolve {
            timestamp,
            counter,
            iv,
        })
    }

    /// Whether the work itself is valid (ignores the time window).
    pub fn is_solved(&self, difficulty: u8) -> bool {
        validate(self.timestamp.wrapping_add(self.iv), self.counter, difficulty)
    }

    /// Whether `timestamp` lies within `window` of `now` (both directions,
    /// tolerating some clock skew).
    pub fn is_fresh(&self, now: u64, window: Duration) -> bool {
        now.abs_diff(self.timestamp) <= window.as_secs()
    }
}

// ─── Replay protection ──────────────────────────────────────────────────────

/// Bounded set of recently seen IVs. When full, the oldest entry is evicted.
#[derive(Debug)]
pub struct ReplaySet {
    seen: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl ReplaySet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ReplaySet {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `iv`. Returns `false` if it was already present.
    pub fn insert(&mut self, iv: u64) -> bool {
        if !self.seen.insert(iv) {
            return false;
        }
        self.order.push_back(iv);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, iv: u64) -> bool {
        self.seen.contains(&iv)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_known_vector() {
        // FNV-1a of eight zero bytes.
        assert_eq!(fnv1a64(0), 0xa8c7_f832_281a_39c5);
    }

    #[test]
    fn zero_difficulty_always_validates() {
        assert!(validate(12345, 0, 0));
        assert_eq!(solve(12345, 0, 1), Some(0));
    }

    #[test]
    fn solve_then_validate() {
        let answer = solve(0x1234, 10, 1 << 24).expect("difficulty 10 is solvable");
        assert!(validate(0x1234, answer, 10));
        let hash = fnv1a64(0x1234u64.wrapping_add(answer));
        assert_eq!(hash & 0x3FF, 0);
    }

    #[test]
    fn wrong_answer_rejected() {
        let answer = solve(0x1234, 10, 1 << 24).unwrap();
        // The first solution is the smallest, so nothing below it validates.
        for wrong in 0..answer {
            assert!(!validate(0x1234, wrong, 10));
        }
    }

    #[test]
    fn presolve_roundtrip() {
        let ts = 1_700_000_000;
        let pre = PreSolve::compute(ts, 0xDEAD_BEEF, 8, 1 << 20).unwrap();
        assert!(pre.is_solved(8));
        assert!(pre.is_fresh(ts + 30, Duration::from_secs(60)));
        assert!(pre.is_fresh(ts - 30, Duration::from_secs(60)));
        assert!(!pre.is_fresh(ts + 61, Duration::from_secs(60)));
    }

    #[test]
    fn challenge_answer_for_known_puzzle() {
        assert_eq!(solve(0x1234, 10, 1 << 20), Some(631));
    }

    #[test]
    fn replay_set_detects_duplicates() {
        let mut set = ReplaySet::new(3);
        assert!(set.insert(1));
        assert!(!set.insert(1));
        assert!(set.insert(2));
        assert!(set.insert(3));
        assert!(set.insert(4));
        assert_eq!(set.len(), 3);
        assert!(!set.contains(1), "oldest evicted");
        assert!(set.insert(1));
    }
}
