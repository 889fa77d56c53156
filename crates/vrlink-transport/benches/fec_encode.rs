//! FEC framing benchmarks for vrlink-transport.
//!
//! Measures the per-frame cost on the send path and the receive-side
//! rebuild:
//! - FecEncoder::send_frame at typical VR frame sizes
//! - FrameReassembler::push with and without a lost shard
//!
//! Run with: cargo bench --package vrlink-transport

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use vrlink_transport::fec::{EncodedFrame, FecEncoder, FrameReassembler, ShardLayout};

const FRAME_SIZES: [usize; 3] = [20_000, 100_000, 400_000];

fn frame(len: usize, index: u64) -> EncodedFrame {
    EncodedFrame {
        tracking_frame_index: index,
        video_frame_index: index,
        payload: (0..len).map(|i| (i * 7) as u8).collect::<Vec<u8>>().into(),
    }
}

// ─── Encode ──────────────────────────────────────────────────────────────

fn bench_send_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_send_frame");
    for size in FRAME_SIZES {
        let f = frame(size, 0);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            let mut enc = FecEncoder::new();
            b.iter(|| {
                let mut n = 0usize;
                enc.send_frame(black_box(&f), 10, 0, |p| n += p.len()).unwrap();
                black_box(n);
            });
        });
    }
    group.finish();
}

// ─── Reassemble ──────────────────────────────────────────────────────────

fn packets(size: usize, index: u64) -> Vec<Bytes> {
    let mut out = Vec::new();
    FecEncoder::new()
        .send_frame(&frame(size, index), 10, 0, |p| out.push(p))
        .unwrap();
    out
}

fn bench_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_reassemble");
    for size in FRAME_SIZES {
        let clean = packets(size, 1);
        let layout = ShardLayout::for_frame(size, 10);
        let lossy: Vec<Bytes> = clean
            .iter()
            .enumerate()
            .filter(|(i, _)| i / layout.shard_packets != 0)
            .map(|(_, p)| p.clone())
            .collect();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B/clean"), |b| {
            b.iter(|| {
                let mut rx = FrameReassembler::new(4);
                for p in &clean {
                    black_box(rx.push(p.clone()).unwrap());
                }
            });
        });
        group.bench_function(format!("{size}B/lost_shard"), |b| {
            b.iter(|| {
                let mut rx = FrameReassembler::new(4);
                for p in &lossy {
                    black_box(rx.push(p.clone()).unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_send_frame, bench_reassemble);
criterion_main!(benches);
