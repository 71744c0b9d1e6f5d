//! Benchmarks for the delivery path and frame encoding.
//!
//! Run with: `cargo bench -p telagg -- ingest`

#![allow(missing_docs, clippy::cast_precision_loss)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use telagg::config::RecorderConfig;
use telagg::engine::Aggregator;
use telagg::feed::{FeedAddress, FeedMeta, Sample};
use telagg::frame::Frame;
use telagg::segment::{FrameSink, SegmentWriter};
use telagg::source::LocalHub;
use tempfile::tempdir;

fn batch(size: usize) -> Vec<Sample> {
    (0..size)
        .map(|i| Sample::new(format!("ch{}", i % 8), i as f64, (i as f64).sin()))
        .collect()
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest/publish");

    for (name, buffered) in [("windowed", false), ("self_buffered", true)] {
        let temp_dir = tempdir().unwrap();
        let hub = LocalHub::new();
        let address = FeedAddress::new("bench", name).unwrap();
        hub.declare_feed(FeedMeta {
            address: address.clone(),
            buffered,
            buffer_time: None,
        });

        let aggregator = Aggregator::new(Arc::new(hub.clone()));
        aggregator.subscribe("bench", name, None).unwrap();
        aggregator
            .start(RecorderConfig {
                time_per_frame: Duration::from_millis(100),
                ..RecorderConfig::new(temp_dir.path())
            })
            .unwrap();

        let samples = batch(16);
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| hub.publish(black_box(&address), samples.clone()).unwrap());
        });

        aggregator.stop().unwrap();
    }

    group.finish();
}

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest/frame");
    let address = FeedAddress::new("bench", "therm").unwrap();

    for size in [16, 256, 4096] {
        let samples = batch(size);
        group.bench_with_input(BenchmarkId::new("build", size), &samples, |b, samples| {
            b.iter(|| Frame::housekeeping(&address, black_box(samples)).unwrap());
        });

        let temp_dir = tempdir().unwrap();
        let mut writer = SegmentWriter::create(temp_dir.path().join("bench.seg")).unwrap();
        let frame = Frame::housekeeping(&address, &samples).unwrap();
        group.bench_with_input(BenchmarkId::new("write", size), &frame, |b, frame| {
            b.iter(|| writer.write_frame(black_box(frame)).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_publish, bench_frame);
criterion_main!(benches);
