//! Integration test: write-behind persistence on a real SQLite file.
//!
//! Covers history queries, registry pre-fetch at startup and the path from
//! a published event through the sink worker onto disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use seawatch::feed::{FeedStatus, ObservationSink};
use seawatch::model::{IdentityObservation, Observation, PositionObservation, Source};
use seawatch::pipeline::{Pipeline, PipelineSettings};
use seawatch::publisher::{PipelineEvent, Publisher, VesselUpdate};
use seawatch::registry::{StaticRegistry, VesselRegistry};
use seawatch::storage::{spawn_sink_worker, PositionRow, SqliteStore};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn db_path(dir: &TempDir) -> String {
    dir.path().join("seawatch.db").to_string_lossy().into_owned()
}

fn row(mmsi: u64, minutes: i64, source: &str) -> PositionRow {
    PositionRow {
        mmsi,
        ts: t0() + chrono::Duration::minutes(minutes),
        latitude: 48.3,
        longitude: -124.0 + minutes as f64 * 0.001,
        speed: Some(10.0),
        course: None,
        source: source.to_string(),
        confidence: None,
    }
}

// ----------------------------------------------------------------------------
// History
// ----------------------------------------------------------------------------

#[test]
fn test_history_is_ordered_and_bounded() {
    let dir = TempDir::new().unwrap();
    let mut store = SqliteStore::open(&db_path(&dir)).unwrap();
    // written out of order, plus another vessel
    for m in [20, 0, 10, 30] {
        store.record_position(&row(1, m, "PRIMARY")).unwrap();
    }
    store.record_position(&row(2, 10, "PRIMARY")).unwrap();

    let all = store
        .history(1, t0(), t0() + chrono::Duration::hours(1))
        .unwrap();
    let minutes: Vec<i64> = all.iter().map(|r| (r.ts - t0()).num_minutes()).collect();
    assert_eq!(minutes, vec![0, 10, 20, 30]);

    // both ends inclusive
    let window = store
        .history(1, t0() + chrono::Duration::minutes(10), t0() + chrono::Duration::minutes(20))
        .unwrap();
    assert_eq!(window.len(), 2);
    assert_eq!(window[0], row(1, 10, "PRIMARY"));

    assert!(store.history(3, t0(), t0() + chrono::Duration::hours(1)).unwrap().is_empty());
}

#[test]
fn test_reopen_keeps_data() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    {
        let mut store = SqliteStore::open(&path).unwrap();
        store.record_position(&row(7, 0, "SECONDARY")).unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    let rows = store.history(7, t0(), t0()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source, "SECONDARY");
}

// ----------------------------------------------------------------------------
// Registry pre-fetch
// ----------------------------------------------------------------------------

#[test]
fn test_registry_prefetch_from_store() {
    let dir = TempDir::new().unwrap();
    let mut store = SqliteStore::open(&db_path(&dir)).unwrap();
    store
        .upsert_identity(&IdentityObservation {
            name: Some("ARROW".into()),
            ship_type: Some("High Speed Craft".into()),
            ..IdentityObservation::new(257_000_001)
        })
        .unwrap();
    store
        .upsert_identity(&IdentityObservation {
            imo: Some(9_321_483),
            ..IdentityObservation::new(257_000_001)
        })
        .unwrap();
    store
        .upsert_identity(&IdentityObservation {
            name: Some("BULKER".into()),
            ..IdentityObservation::new(257_000_002)
        })
        .unwrap();

    let registry: StaticRegistry = store.load_identities().unwrap().into_iter().collect();
    assert_eq!(registry.len(), 2);
    let arrow = registry.lookup(257_000_001).unwrap();
    assert_eq!(arrow.name.as_deref(), Some("ARROW"));
    assert_eq!(arrow.imo, Some(9_321_483));
    assert_eq!(registry.ship_type(257_000_001).as_deref(), Some("High Speed Craft"));
    assert_eq!(registry.ship_type(257_000_002), None);
}

// ----------------------------------------------------------------------------
// Pipeline -> publisher -> sink worker -> disk
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_published_events_reach_disk() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    let store = SqliteStore::open(&path).unwrap();
    let (sink, worker) = spawn_sink_worker(store, 256);
    let publisher = Arc::new(Publisher::new(64, Some(sink)));
    let live = publisher.subscribe("live");

    // the registry knows this one is a fast ferry
    let mut registry = StaticRegistry::new();
    registry.insert(IdentityObservation {
        ship_type: Some("High Speed Craft".into()),
        ..IdentityObservation::new(257_000_001)
    });

    let pipeline = Pipeline::spawn(
        PipelineSettings {
            shards: 2,
            heartbeat: Duration::from_secs(3600),
            housekeeping: Duration::from_secs(3600),
            ..PipelineSettings::default()
        },
        Arc::new(registry),
        Arc::clone(&publisher),
        Arc::new(FeedStatus::new()),
    );
    let handle = pipeline.handle();

    let mismatched = 219_000_001;
    let ferry = 257_000_001;
    let input = vec![
        Observation::Identity(IdentityObservation {
            name: Some("NORDIC STAR".into()),
            ..IdentityObservation::new(mismatched)
        }),
        Observation::Position(PositionObservation::new(mismatched, 48.0, -125.0, Source::Primary, t0()).unwrap()),
        Observation::Position(
            PositionObservation::new(mismatched, 48.0, -124.985, Source::Secondary, t0() + chrono::Duration::seconds(5))
                .unwrap(),
        ),
        Observation::Position(
            PositionObservation::new(ferry, 10.0, 10.0, Source::Primary, t0())
                .unwrap()
                .with_speed(Some(65.0)),
        ),
    ];
    for obs in input {
        assert!(handle.submit(obs).await);
    }
    pipeline.shutdown().await;

    let mut updates = 0;
    let mut alerts = 0;
    while let Some(event) = live.recv().await {
        match &*event {
            PipelineEvent::VesselUpdated(VesselUpdate::Raw { .. } | VesselUpdate::Fused(_)) => updates += 1,
            PipelineEvent::AlertRaised(_) => alerts += 1,
            _ => {}
        }
    }
    assert_eq!(updates, 3);
    // mismatch only; the ferry's speed is normal for its type
    assert_eq!(alerts, 1);

    // last publisher reference closes the sink queue
    assert_eq!(publisher.sink_dropped(), 0);
    drop(publisher);
    worker.await.unwrap();

    let store = SqliteStore::open(&path).unwrap();
    let history = store
        .history(mismatched, t0(), t0() + chrono::Duration::minutes(1))
        .unwrap();
    let sources: Vec<&str> = history.iter().map(|r| r.source.as_str()).collect();
    assert_eq!(sources, vec!["PRIMARY", "FUSED"]);
    assert!(history[1].confidence.unwrap() < 0.01);
    assert_eq!(store.finding_count(mismatched).unwrap(), 1);
    assert_eq!(store.finding_count(ferry).unwrap(), 0);
    assert_eq!(
        store.identity(mismatched).unwrap().unwrap().name.as_deref(),
        Some("NORDIC STAR")
    );
}
