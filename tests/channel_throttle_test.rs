//! Timing tests for the rate-limited channel.
//!
//! These measure wall-clock gaps, so they run serially to keep scheduler noise
//! from other tests out of the measurements.

use current_scan::acquisition::{Acquisition, AcquisitionEvent, AcquisitionSettings};
use current_scan::instrument::mock::{JournalEntry, SimulatedBench, METER_RESOURCE, SOURCE_RESOURCE};
use current_scan::instrument::{ConnectionOptions, RateLimitedChannel};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn assert_gaps(journal: &[JournalEntry], resource: &str, interval: Duration) {
    let entries: Vec<&JournalEntry> = journal.iter().filter(|e| e.resource == resource).collect();
    assert!(entries.len() > 1, "not enough operations on {}", resource);
    for pair in entries.windows(2) {
        let gap = pair[1].started.duration_since(pair[0].finished);
        assert!(
            gap >= interval,
            "{}: '{}' started {:?} after '{}' finished, interval {:?}",
            resource,
            pair[1].command,
            gap,
            pair[0].command,
            interval
        );
    }
}

#[test]
#[serial]
fn mixed_writes_and_queries_respect_interval() {
    let interval = Duration::from_millis(10);
    let bench = Arc::new(SimulatedBench::default().with_latency(Duration::from_millis(2)));
    let mut source = RateLimitedChannel::new(
        bench.clone(),
        SOURCE_RESOURCE,
        interval,
        ConnectionOptions::default(),
    );
    source.open().unwrap();

    for i in 0..5 {
        source.write(&format!("VOLT {}", i)).unwrap();
        source.query("VOLT?").unwrap();
    }
    source.close().unwrap();

    assert_gaps(&bench.journal(), SOURCE_RESOURCE, interval);
}

#[test]
#[serial]
fn zero_interval_adds_no_delay() {
    let bench = Arc::new(SimulatedBench::default());
    let mut meter = RateLimitedChannel::new(
        bench.clone(),
        METER_RESOURCE,
        Duration::ZERO,
        ConnectionOptions::default(),
    );
    meter.open().unwrap();

    let started = Instant::now();
    for _ in 0..200 {
        meter.query("READ?").unwrap();
    }
    // With a 1 ms interval the same loop could not finish in under 200 ms.
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
#[serial]
fn interval_holds_when_threads_share_a_channel() {
    let interval = Duration::from_millis(5);
    let bench = Arc::new(SimulatedBench::default());
    let mut channel = RateLimitedChannel::new(
        bench.clone(),
        SOURCE_RESOURCE,
        interval,
        ConnectionOptions::default(),
    );
    channel.open().unwrap();
    let shared = Arc::new(Mutex::new(channel));

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                for _ in 0..5 {
                    shared.lock().write(&format!("VOLT {}", worker)).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let journal = bench.journal();
    assert_eq!(journal.len(), 20);
    assert_gaps(&journal, SOURCE_RESOURCE, interval);
}

#[test]
#[serial]
fn acquisition_loop_throttles_each_channel() {
    let interval = Duration::from_millis(3);
    let bench = Arc::new(SimulatedBench::default());
    let settings = AcquisitionSettings::for_resources(SOURCE_RESOURCE, METER_RESOURCE)
        .with_interval(interval)
        .with_cycle_sleep(Duration::ZERO);
    let (acquisition, mut events) = Acquisition::new(bench.clone(), settings);
    acquisition.enqueue_voltage(0.5);
    acquisition.enqueue_voltage(1.0);

    acquisition.start().unwrap();
    let mut readings = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while readings < 5 && Instant::now() < deadline {
        match events.try_recv() {
            Ok(AcquisitionEvent::Reading(_)) => readings += 1,
            Ok(AcquisitionEvent::Failed(message)) => panic!("loop failed: {}", message),
            _ => thread::sleep(Duration::from_millis(1)),
        }
    }
    acquisition.stop().unwrap();
    assert_eq!(readings, 5);

    let journal = bench.journal();
    assert_gaps(&journal, SOURCE_RESOURCE, interval);
    assert_gaps(&journal, METER_RESOURCE, interval);
}
