//! Hot-path benchmarks for ripple-transport.
//!
//! Measures:
//! - Arena alloc/free across size classes
//! - Reliable channel send + receive + ack round trip
//! - Fragmented channel split and reassembly
//! - Packet merger batching
//!
//! Run with: cargo bench --package ripple-transport

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quanta::Instant;
use std::time::Duration;

use ripple_transport::channels::{Channel, ChannelConfig};
use ripple_transport::merger::PacketMerger;
use ripple_transport::{ChannelType, MemoryManager};

// ─── Arena ───────────────────────────────────────────────────────────────

fn bench_arena(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena");
    let memory = MemoryManager::default();

    for size in [64usize, 512, 1450, 16 * 1024] {
        group.bench_with_input(BenchmarkId::new("alloc_free", size), &size, |b, &size| {
            b.iter(|| {
                let block = memory.alloc(black_box(size));
                black_box(&block);
                drop(block);
            });
        });
    }

    group.bench_function("pointer_set_8", |b| {
        b.iter(|| {
            let mut set = memory.alloc_pointer_set(8);
            for _ in 0..8 {
                set.push(memory.alloc(256));
            }
            black_box(&set);
        });
    });

    group.finish();
}

// ─── Channels ────────────────────────────────────────────────────────────

/// Send one message, deliver it, and feed the ack back.
fn round_trip(sender: &mut Channel, receiver: &mut Channel, payload: &[u8], now: Instant) {
    let mut wire: Vec<Vec<u8>> = Vec::new();
    let mut acks: Vec<Vec<u8>> = Vec::new();
    let mut acked = Vec::new();
    sender
        .create_outgoing(payload, 1450, false, None, now, &mut wire)
        .unwrap();
    for datagram in &wire {
        if let Some(set) = receiver.handle_incoming(&datagram[2..], &mut acks) {
            black_box(&set);
        }
    }
    for ack in &acks {
        sender.handle_ack(&ack[2..], now, &mut wire, &mut acked);
    }
    black_box(acked);
}

fn bench_channels(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_round_trip");
    let memory = MemoryManager::default();
    let config = ChannelConfig::default();

    for (kind, size) in [
        (ChannelType::Reliable, 256usize),
        (ChannelType::Reliable, 1400),
        (ChannelType::ReliableSequenced, 1400),
        (ChannelType::Unreliable, 1400),
        (ChannelType::ReliableSequencedFragmented, 16 * 1024),
    ] {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{kind}/{size}"), |b| {
            let mut sender = Channel::new(kind, 0, config, memory.clone());
            let mut receiver = Channel::new(kind, 0, config, memory.clone());
            let now = Instant::now();
            b.iter(|| round_trip(&mut sender, &mut receiver, &payload, now));
        });
    }

    group.finish();
}

// ─── Merger ──────────────────────────────────────────────────────────────

fn bench_merger(c: &mut Criterion) {
    let mut group = c.benchmark_group("merger");
    let datagram = [0x42u8; 48];

    group.bench_function("push_48B_x32", |b| {
        let mut merger = PacketMerger::new(1450, Duration::from_millis(15));
        let now = Instant::now();
        let mut sent = 0usize;
        b.iter(|| {
            for _ in 0..32 {
                merger.push(black_box(&datagram), now, &mut |out: &[u8]| sent += out.len());
            }
            merger.flush(&mut |out: &[u8]| sent += out.len());
        });
        black_box(sent);
    });

    group.finish();
}

criterion_group!(benches, bench_arena, bench_channels, bench_merger);
criterion_main!(benches);
