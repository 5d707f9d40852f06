//! Property-based tests for wrapping sequence arithmetic and the
//! sequence-keyed window.

use proptest::prelude::*;
use std::collections::HashMap;

use ripple_transport::sequence::{distance, distance16, SequenceWindow};

// ─── Distance ────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn distance16_is_antisymmetric(a in any::<u16>(), d in -32767i32..=32767) {
        let b = a.wrapping_add(d as u16);
        prop_assert_eq!(distance16(b, a), d);
        prop_assert_eq!(distance16(a, b), -d);
        prop_assert_eq!(distance16(a, a), 0);
    }

    #[test]
    fn distance_matches_distance16(a in any::<u16>(), b in any::<u16>()) {
        prop_assert_eq!(distance(a as u64, b as u64, 16), distance16(a, b) as i64);
    }

    #[test]
    fn distance_within_half_space(bits in 2u8..=63, a in any::<u64>(), d in any::<i64>()) {
        let half = 1i64 << (bits - 1);
        let d = d.rem_euclid(2 * half - 1) - (half - 1);
        let mask = (1u64 << bits) - 1;
        let a = a & mask;
        let b = a.wrapping_add(d as u64) & mask;
        prop_assert_eq!(distance(b, a, bits), d);
        prop_assert_eq!(distance(a, b, bits), -d);
    }
}

// ─── SequenceWindow ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Insert(u16),
    Remove(u16),
}

fn op(size: u16) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..size).prop_map(Op::Insert),
        (0..size).prop_map(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn window_matches_map_model(
        base in any::<u16>(),
        ops in prop::collection::vec(op(64), 1..200),
    ) {
        let mut window = SequenceWindow::new(64);
        let mut model: HashMap<u16, u16> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(offset) => {
                    let sequence = base.wrapping_add(offset);
                    window.insert(sequence, offset);
                    model.insert(sequence, offset);
                }
                Op::Remove(offset) => {
                    let sequence = base.wrapping_add(offset);
                    prop_assert_eq!(window.remove(sequence), model.remove(&sequence));
                }
            }
            prop_assert_eq!(window.len(), model.len());
        }

        for (sequence, offset) in &model {
            prop_assert_eq!(window.get(*sequence), Some(offset));
        }
        // Same slot, different lap: never visible.
        for sequence in model.keys() {
            prop_assert!(!window.contains(sequence.wrapping_add(64)));
        }
    }
}
