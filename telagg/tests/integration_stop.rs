//! Integration tests for stopping a run while drivers keep publishing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use telagg::config::RecorderConfig;
use telagg::engine::{Aggregator, EngineState};
use telagg::feed::{FeedAddress, FeedMeta, Sample};
use telagg::frame::Frame;
use telagg::segment::SegmentReader;
use telagg::source::LocalHub;
use tempfile::tempdir;

/// What one publisher thread observed around the stop.
struct Published {
    /// Highest index whose publish returned before the stop began.
    confirmed: Option<u64>,
    /// Lowest index whose publish started after the stop returned.
    late: Option<u64>,
}

/// Publishes `index` as timestamp and value until well after `stopped`.
fn publish_through_stop(
    hub: &LocalHub,
    address: &FeedAddress,
    stopping: &AtomicBool,
    stopped: &AtomicBool,
) -> Published {
    let mut published = Published {
        confirmed: None,
        late: None,
    };
    let mut late_count = 0;

    for index in 0u64.. {
        let after_stop = stopped.load(Ordering::SeqCst);
        #[allow(clippy::cast_precision_loss)]
        let sample = Sample::new("ch1", index as f64, index as f64);
        hub.publish(address, vec![sample]).unwrap();

        if after_stop {
            published.late.get_or_insert(index);
            late_count += 1;
            if late_count >= 20 {
                break;
            }
        } else if !stopping.load(Ordering::SeqCst) {
            published.confirmed = Some(index);
        }
        thread::sleep(Duration::from_millis(1));
    }
    published
}

#[test]
fn test_stop_under_concurrent_publishers() {
    let temp_dir = tempdir().unwrap();
    let hub = LocalHub::new();
    let windowed = FeedAddress::new("dev1", "therm").unwrap();
    let immediate = FeedAddress::new("dev2", "fast").unwrap();
    for (address, buffered) in [(&windowed, false), (&immediate, true)] {
        hub.declare_feed(FeedMeta {
            address: address.clone(),
            buffered,
            buffer_time: None,
        });
    }

    let aggregator = Aggregator::new(Arc::new(hub.clone()));
    aggregator.subscribe("dev1", "therm", None).unwrap();
    aggregator.subscribe("dev2", "fast", None).unwrap();
    aggregator
        .start(RecorderConfig {
            time_per_file: Duration::from_millis(100),
            time_per_frame: Duration::from_millis(50),
            tick: Duration::from_millis(10),
            ..RecorderConfig::new(temp_dir.path())
        })
        .unwrap();

    let stopping = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let publishers: Vec<_> = [windowed.clone(), immediate.clone()]
        .into_iter()
        .map(|address| {
            let hub = hub.clone();
            let stopping = Arc::clone(&stopping);
            let stopped = Arc::clone(&stopped);
            thread::spawn(move || {
                let published = publish_through_stop(&hub, &address, &stopping, &stopped);
                (address, published)
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(300));
    stopping.store(true, Ordering::SeqCst);
    let summary = aggregator.stop().unwrap().unwrap();
    stopped.store(true, Ordering::SeqCst);
    assert_eq!(aggregator.state(), EngineState::Idle);

    let published: Vec<_> = publishers.into_iter().map(|p| p.join().unwrap()).collect();
    assert!(summary.segments.len() > 1, "expected rotations during the run");

    let mut written: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for path in &summary.segments {
        let frames = SegmentReader::open(path).unwrap().read_all().unwrap();
        assert_eq!(frames.last(), Some(&Frame::EndProcessing), "{}", path.display());
        for hk in frames.iter().filter_map(Frame::as_housekeeping) {
            written
                .entry(format!("{}.feeds.{}", hk.agent_address, hk.feed))
                .or_default()
                .extend(hk.samples().map(|sample| sample.timestamp));
        }
    }
    let total: usize = written.values().map(Vec::len).sum();
    assert_eq!(total as u64, summary.samples);

    for (address, published) in published {
        let timestamps = written.remove(&address.to_string()).unwrap_or_default();

        // Accepted samples are a gap-free prefix of what was published,
        // each written exactly once.
        #[allow(clippy::cast_precision_loss)]
        let expected: Vec<f64> = (0..timestamps.len() as u64).map(|i| i as f64).collect();
        assert_eq!(timestamps, expected, "feed {address}");

        let confirmed = published.confirmed.expect("publisher ran before stop");
        assert!(
            timestamps.len() as u64 > confirmed,
            "feed {address}: sample {confirmed} was published before stop but not written"
        );
        let late = published.late.expect("publisher ran after stop");
        assert!(
            (timestamps.len() as u64) <= late,
            "feed {address}: sample {late} was published after stop but written"
        );

        assert_eq!(aggregator.buffered(&address), Some(Vec::new()));
    }
}
