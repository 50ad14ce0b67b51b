//! Throughput Benchmark for Berth
//!
//! Measures the hot paths every connection goes through: framing inbound
//! bytes, encoding replies and borrowing buffers.

use berth::codec::{Decoder, Encoder};
use berth::config::Limits;
use berth::pool::BufferPool;
use berth::DataMode;
use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

/// Benchmark LINE decoding
fn bench_line_decode(c: &mut Criterion) {
    let limits = Limits::default();
    let mut group = c.benchmark_group("line_decode");

    let single = b"ECHO hello world\r\n".to_vec();
    group.throughput(Throughput::Bytes(single.len() as u64));
    group.bench_function("single_line", |b| {
        let mut decoder = Decoder::new(DataMode::Line, &limits);
        b.iter(|| {
            decoder.feed(black_box(&single));
            black_box(decoder.next_frame().unwrap());
        });
    });

    // 100 pipelined lines in one read
    let pipelined: Vec<u8> = (0..100)
        .flat_map(|i| format!("command number {i}\r\n").into_bytes())
        .collect();
    group.throughput(Throughput::Bytes(pipelined.len() as u64));
    group.bench_function("pipelined_100", |b| {
        let mut decoder = Decoder::new(DataMode::Line, &limits);
        b.iter(|| {
            decoder.feed(black_box(&pipelined));
            while let Some(frame) = decoder.next_frame().unwrap() {
                black_box(frame);
            }
        });
    });

    // One line split across many small reads
    let long = format!("{}\r\n", "x".repeat(16 * 1024)).into_bytes();
    group.throughput(Throughput::Bytes(long.len() as u64));
    group.bench_function("fragmented_16kb", |b| {
        let mut decoder = Decoder::new(DataMode::Line, &limits);
        b.iter(|| {
            for chunk in long.chunks(512) {
                decoder.feed(chunk);
            }
            black_box(decoder.next_frame().unwrap());
        });
    });

    group.finish();
}

/// Benchmark OBJECT encode and decode
fn bench_object(c: &mut Criterion) {
    let limits = Limits::default();
    let encoder = Encoder::new(DataMode::Object);
    let value = serde_json::json!({
        "user": "ariz",
        "action": "update",
        "fields": { "score": 42, "tags": ["a", "b", "c"] },
    });

    let mut group = c.benchmark_group("object");
    group.throughput(Throughput::Elements(1));

    group.bench_function("encode", |b| {
        let mut dst = BytesMut::with_capacity(4096);
        b.iter(|| {
            dst.clear();
            encoder.encode_object(black_box(&value), &mut dst).unwrap();
        });
    });

    let mut frame = BytesMut::new();
    encoder.encode_object(&value, &mut frame).unwrap();
    group.bench_function("decode", |b| {
        let mut decoder = Decoder::new(DataMode::Object, &limits);
        if let Some(header) = encoder.preamble() {
            decoder.feed(header);
        }
        b.iter(|| {
            decoder.feed(black_box(&frame));
            black_box(decoder.next_frame().unwrap());
        });
    });

    group.finish();
}

/// Benchmark reply encoding
fn bench_line_encode(c: &mut Criterion) {
    let encoder = Encoder::new(DataMode::Line);
    let mut group = c.benchmark_group("line_encode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("reply", |b| {
        let mut dst = BytesMut::with_capacity(4096);
        b.iter(|| {
            dst.clear();
            encoder
                .encode_line(black_box("ECHO: hello world"), &mut dst)
                .unwrap();
        });
    });

    group.bench_function("notice", |b| {
        let mut dst = BytesMut::with_capacity(4096);
        b.iter(|| {
            dst.clear();
            encoder
                .encode_notice(black_box("-ERR Timeout"), &mut dst)
                .unwrap();
        });
    });

    group.finish();
}

/// Benchmark buffer pool borrow / return
fn bench_buffer_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool");
    group.throughput(Throughput::Elements(1));

    group.bench_function("borrow_return", |b| {
        let pool = BufferPool::new(8 * 1024, 64);
        b.iter(|| {
            let buf = pool.borrow();
            black_box(&buf);
        });
    });

    group.bench_function("borrow_4_held", |b| {
        let pool = BufferPool::new(8 * 1024, 64);
        b.iter(|| {
            let held: Vec<_> = (0..4).map(|_| pool.borrow()).collect();
            black_box(held);
        });
    });

    group.finish();
}

/// Benchmark contended buffer borrowing
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_borrow", |b| {
        let pool = Arc::new(BufferPool::new(8 * 1024, 16));
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    thread::spawn(move || {
                        for _ in 0..1000 {
                            let buf = pool.borrow();
                            black_box(&buf);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_line_decode,
    bench_object,
    bench_line_encode,
    bench_buffer_pool,
    bench_concurrent,
);

criterion_main!(benches);
