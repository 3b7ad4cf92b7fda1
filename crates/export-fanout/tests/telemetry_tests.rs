//! Heartbeat and lease overrun telemetry
//!
//! Runs on a paused clock so elapsed times are exact, and captures the
//! emitted tracing events with [`CapturedEvents`].

mod helpers;

use export_common::SizeTier;
use export_fanout::collaborators::TrackerKind;
use export_fanout::processor::fanout::{FanOut, HEARTBEAT_ROW_INTERVAL};
use export_fanout::processor::lease::LeaseRenewer;
use helpers::*;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::Level;

const OVERRUN_EVENT: &str = "FileWriterLeaseRenewWaitedTooLong";

fn rows(range: std::ops::Range<u64>, command: &str) -> String {
    range
        .map(|i| format!("{}\tp\tr{:02}\n", command, i))
        .collect()
}

async fn close_wait(lease_minutes: u64, renew_minutes: u64, work_minutes: u64) -> CapturedEvents {
    let events = CapturedEvents::default();
    let _guard = events.install();

    let renewer = LeaseRenewer::new(
        Vec::new(),
        Duration::from_secs(lease_minutes * 60),
        Duration::from_secs(renew_minutes * 60),
        "late.tsv",
    );
    let out = renewer
        .wait_and_renew(&pending("late.tsv"), async {
            sleep(Duration::from_secs(work_minutes * 60)).await;
            "closed"
        })
        .await;
    assert_eq!(out, "closed");

    events
}

#[tokio::test(start_paused = true)]
async fn test_close_wait_within_half_the_lease_is_quiet() {
    let events = close_wait(30, 5, 12).await;
    assert!(events.with_field("event", OVERRUN_EVENT).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_wait_past_half_the_lease_warns() {
    let events = close_wait(10, 6, 7).await;

    let overruns = events.with_field("event", OVERRUN_EVENT);
    assert_eq!(overruns.len(), 1);
    assert_eq!(overruns[0].level, Level::WARN);
    assert_eq!(overruns[0].field("file"), Some("agent1/late.tsv"));
    assert_eq!(overruns[0].field("minutes_lease"), Some("10.0"));
}

#[tokio::test(start_paused = true)]
async fn test_close_wait_past_the_lease_is_an_error() {
    let events = close_wait(5, 6, 7).await;

    let overruns = events.with_field("event", OVERRUN_EVENT);
    assert_eq!(overruns.len(), 1);
    assert_eq!(overruns[0].level, Level::ERROR);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_updates_instance_slot_every_25_rows() {
    let h = Harness::new(config());
    let events = CapturedEvents::default();
    let _guard = events.install();

    let file = pending("stream.tsv");
    let tracker = RecordingTracker::default();
    let renewer = LeaseRenewer::new(
        Vec::new(),
        h.processor.config().lease_duration(),
        h.processor.config().renew_frequency(),
        "stream.tsv",
    );
    let cancel = CancellationToken::new();
    let counters = h.processor.counters();
    counters.slot(0).unwrap().set_in_progress(SizeTier::Small);

    let (mut tx, rx) = tokio::io::duplex(64 * 1024);
    let mut fanout = FanOut::new(
        &h.processor,
        0,
        &file,
        SizeTier::Small,
        &tracker,
        &renewer,
        &cancel,
        false,
    );

    let writers = &h.writers;
    let heartbeats = &events;
    let feed = async move {
        let rows_seen = || {
            writers
                .commands()
                .iter()
                .map(|c| writers.record(c).map_or(0, |r| r.rows.len()))
                .sum::<usize>()
        };

        let first = format!("{}{}", rows(0..12, "c1"), rows(12..24, "c2"));
        tx.write_all(first.as_bytes()).await.unwrap();
        while rows_seen() < 24 {
            tokio::task::yield_now().await;
        }
        // nothing is published before the 25th row
        assert_eq!(counters.snapshot().writers.total(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        tx.write_all(rows(24..25, "c1").as_bytes()).await.unwrap();
        while counters.snapshot().writers.real < 2 {
            tokio::task::yield_now().await;
        }

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.tiers[&SizeTier::Small].rows_per_sec, Some(5));
        assert_eq!(snapshot.tiers[&SizeTier::Small].bytes_per_sec, Some(15));

        let beats = heartbeats.with_field("event", "FileProcessorHeartbeat");
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].field("rows"), Some("25"));
        assert_eq!(beats[0].field("real"), Some("2"));

        // the clock has not moved, so the 50th row's heartbeat is skipped
        tx.write_all(rows(25..50, "c3").as_bytes()).await.unwrap();
        drop(tx);
    };

    let (read, ()) = tokio::join!(fanout.run(Box::new(BufReader::new(rx))), feed);
    read.unwrap();

    assert_eq!(
        events.with_field("event", "FileProcessorHeartbeat").len(),
        1,
        "one heartbeat per {} rows at most once per progress interval",
        HEARTBEAT_ROW_INTERVAL
    );

    // the final update publishes the writer opened after the heartbeat
    assert_eq!(counters.snapshot().writers.real, 3);
    assert_eq!(
        tracker
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == TrackerKind::DataFileComplete)
            .count(),
        1
    );
}
