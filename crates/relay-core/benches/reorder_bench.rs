//! Criterion benchmarks for the receive-side reorder buffer and frame codec.
//!
//! Run with:
//! ```bash
//! cargo bench --package relay-core --bench reorder_bench
//! ```

use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relay_core::{decode_frame, encode_frame, Frame, ReorderBuffer};

fn bench_in_order(c: &mut Criterion) {
    c.bench_function("reorder_in_order_1000", |b| {
        b.iter(|| {
            let mut buf = ReorderBuffer::new(64, Duration::from_secs(5));
            let now = Instant::now();
            for seq in 1..=1000u64 {
                black_box(buf.push(seq, String::new(), now));
            }
        })
    });
}

fn bench_pairwise_swapped(c: &mut Criterion) {
    // 2,1,4,3,6,5,… – every other frame is held back once.
    let mut group = c.benchmark_group("reorder_pairwise_swapped");
    for count in [100u64, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut buf = ReorderBuffer::new(64, Duration::from_secs(5));
                let now = Instant::now();
                for pair in (1..=count).step_by(2) {
                    black_box(buf.push(pair + 1, String::new(), now));
                    black_box(buf.push(pair, String::new(), now));
                }
            })
        });
    }
    group.finish();
}

fn bench_prompt_codec(c: &mut Criterion) {
    let frame = Frame::prompt(42, "refactor the parser to return spans");
    let encoded = encode_frame(&frame).expect("encode");

    c.bench_function("encode_prompt", |b| {
        b.iter(|| encode_frame(black_box(&frame)))
    });
    c.bench_function("decode_prompt", |b| {
        b.iter(|| decode_frame(black_box(&encoded)))
    });
}

criterion_group!(
    benches,
    bench_in_order,
    bench_pairwise_swapped,
    bench_prompt_codec
);
criterion_main!(benches);
