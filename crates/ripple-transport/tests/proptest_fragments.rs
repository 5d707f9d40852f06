//! Property-based tests for the fragmented channel: split counts and
//! reassembly under arbitrary arrival order.

use proptest::prelude::*;
use quanta::Instant;
use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};

use ripple_transport::channels::{ChannelConfig, FragmentedChannel, FRAGMENT_HEADER_LEN};
use ripple_transport::MemoryManager;

const MTU: usize = 256;
const CHUNK: usize = MTU - FRAGMENT_HEADER_LEN;

fn shuffle(items: &mut [Vec<u8>], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}

proptest! {
    #[test]
    fn splits_into_k_plus_one_fragments_and_reassembles(
        k in 0usize..12,
        r in 1usize..CHUNK,
        fill in any::<u8>(),
        seed in any::<u64>(),
    ) {
        let memory = MemoryManager::default();
        let config = ChannelConfig::default();
        let mut tx = FragmentedChannel::new(2, config, memory.clone());
        let mut rx = FragmentedChannel::new(2, config, memory.clone());

        let payload: Vec<u8> = (0..k * CHUNK + r).map(|i| (i as u8).wrapping_add(fill)).collect();
        prop_assert_eq!(FragmentedChannel::fragment_count(payload.len(), CHUNK), k + 1);

        let mut wire: Vec<Vec<u8>> = Vec::new();
        tx.create_outgoing(&payload, MTU, false, None, Instant::now(), &mut wire).unwrap();
        prop_assert_eq!(wire.len(), k + 1);
        prop_assert!(wire.iter().all(|d| d.len() <= MTU));

        shuffle(&mut wire, seed);
        let mut acks: Vec<Vec<u8>> = Vec::new();
        let mut delivered = Vec::new();
        for datagram in &wire {
            if let Some(set) = rx.handle_incoming(&datagram[2..], &mut acks) {
                set.flatten_into(&mut delivered);
            }
        }
        prop_assert_eq!(acks.len(), k + 1);
        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(&delivered[0][..], &payload[..]);
    }

    #[test]
    fn duplicated_fragments_deliver_once(
        k in 1usize..6,
        seed in any::<u64>(),
    ) {
        let memory = MemoryManager::default();
        let config = ChannelConfig::default();
        let mut tx = FragmentedChannel::new(0, config, memory.clone());
        let mut rx = FragmentedChannel::new(0, config, memory.clone());

        let payload = vec![0xA5u8; k * CHUNK + 1];
        let mut wire: Vec<Vec<u8>> = Vec::new();
        tx.create_outgoing(&payload, MTU, false, None, Instant::now(), &mut wire).unwrap();
        let mut doubled: Vec<Vec<u8>> = wire.iter().chain(wire.iter()).cloned().collect();
        shuffle(&mut doubled, seed);

        let mut acks: Vec<Vec<u8>> = Vec::new();
        let mut delivered = Vec::new();
        for datagram in &doubled {
            if let Some(set) = rx.handle_incoming(&datagram[2..], &mut acks) {
                set.flatten_into(&mut delivered);
            }
        }
        prop_assert_eq!(delivered.len(), 1);
        prop_assert_eq!(delivered[0].len(), payload.len());
    }
}
