//! Write-behind persistence: identities, position history, findings.
//!
//! The pipeline never touches the database directly. It offers records to a
//! bounded queue drained by a blocking worker; a full queue drops the record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::logging;
use crate::model::{Alert, Deviation, IdentityObservation, VesselId};
use crate::publisher::VesselUpdate;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionRow {
    pub mmsi: VesselId,
    pub ts: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    /// `PRIMARY`, `SECONDARY` or `FUSED`.
    pub source: String,
    pub confidence: Option<f64>,
}

impl From<&VesselUpdate> for PositionRow {
    fn from(update: &VesselUpdate) -> Self {
        match update {
            VesselUpdate::Fused(f) => PositionRow {
                mmsi: f.vessel_id,
                ts: f.computed_at,
                latitude: f.latitude,
                longitude: f.longitude,
                speed: None,
                course: None,
                source: "FUSED".to_string(),
                confidence: Some(f.confidence),
            },
            VesselUpdate::Raw { observation, .. } => PositionRow {
                mmsi: observation.vessel_id(),
                ts: observation.observed_at(),
                latitude: observation.latitude(),
                longitude: observation.longitude(),
                speed: observation.speed_over_ground(),
                course: observation.course_or_heading(),
                source: observation.source().as_str().to_string(),
                confidence: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindingRow {
    pub mmsi: VesselId,
    pub category: &'static str,
    pub kind: String,
    pub severity: String,
    pub details: String,
    pub data: Value,
    pub ts: DateTime<Utc>,
}

fn enum_name<T: serde::Serialize>(v: &T) -> String {
    match serde_json::to_value(v) {
        Ok(Value::String(s)) => s,
        _ => String::new(),
    }
}

impl From<&Alert> for FindingRow {
    fn from(a: &Alert) -> Self {
        FindingRow {
            mmsi: a.vessel_id,
            category: "alert",
            kind: enum_name(&a.kind),
            severity: a.severity.as_str().to_string(),
            details: a.details.clone(),
            data: a.data.clone(),
            ts: a.detected_at,
        }
    }
}

impl From<&Deviation> for FindingRow {
    fn from(d: &Deviation) -> Self {
        FindingRow {
            mmsi: d.vessel_id,
            category: "deviation",
            kind: enum_name(&d.kind),
            severity: d.severity.as_str().to_string(),
            details: d.details.clone(),
            data: d.data.clone(),
            ts: d.detected_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkRecord {
    Identity(IdentityObservation),
    Position(PositionRow),
    Finding(FindingRow),
}

impl SinkRecord {
    fn op(&self) -> &'static str {
        match self {
            SinkRecord::Identity(_) => "upsert_identity",
            SinkRecord::Position(_) => "record_position",
            SinkRecord::Finding(_) => "record_finding",
        }
    }
}

/// Synchronous persistence backend, driven from a blocking worker.
pub trait PositionSink: Send + 'static {
    fn write(&mut self, record: &SinkRecord) -> Result<()>;
}

/// Non-blocking producer side of the sink queue.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkRecord>,
    dropped: Arc<AtomicU64>,
}

impl SinkHandle {
    /// Enqueues without waiting. Returns false if the record was dropped.
    pub fn offer(&self, record: SinkRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Runs `sink` on the blocking pool. The worker exits once every
/// `SinkHandle` clone is dropped and the queue is drained.
pub fn spawn_sink_worker<S: PositionSink>(mut sink: S, capacity: usize) -> (SinkHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<SinkRecord>(capacity.max(1));
    let handle = SinkHandle {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let worker = tokio::task::spawn_blocking(move || {
        while let Some(record) = rx.blocking_recv() {
            if let Err(err) = sink.write(&record) {
                logging::log_sink_failure(record.op(), &format!("{:#}", err));
            }
        }
    });
    (handle, worker)
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening sqlite db {}", path))?;
        let mut store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS vessels (
                mmsi INTEGER PRIMARY KEY,
                name TEXT,
                call_sign TEXT,
                imo INTEGER,
                ship_type TEXT,
                length_m REAL,
                width_m REAL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                mmsi INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                speed REAL,
                course REAL,
                source TEXT NOT NULL,
                confidence REAL
            );
            CREATE INDEX IF NOT EXISTS positions_mmsi_ts ON positions (mmsi, ts);
            CREATE TABLE IF NOT EXISTS findings (
                mmsi INTEGER NOT NULL,
                category TEXT NOT NULL,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                details TEXT NOT NULL,
                data TEXT NOT NULL,
                ts INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Null columns in `identity` leave the stored value untouched.
    pub fn upsert_identity(&mut self, identity: &IdentityObservation) -> Result<()> {
        self.conn.execute(
            "INSERT INTO vessels (mmsi, name, call_sign, imo, ship_type, length_m, width_m, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(mmsi) DO UPDATE SET
                name = COALESCE(excluded.name, vessels.name),
                call_sign = COALESCE(excluded.call_sign, vessels.call_sign),
                imo = COALESCE(excluded.imo, vessels.imo),
                ship_type = COALESCE(excluded.ship_type, vessels.ship_type),
                length_m = COALESCE(excluded.length_m, vessels.length_m),
                width_m = COALESCE(excluded.width_m, vessels.width_m),
                updated_at = excluded.updated_at",
            params![
                identity.vessel_id as i64,
                identity.name,
                identity.call_sign,
                identity.imo.map(|v| v as i64),
                identity.ship_type,
                identity.length_meters,
                identity.width_meters,
                to_millis(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn record_position(&mut self, row: &PositionRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO positions (mmsi, ts, latitude, longitude, speed, course, source, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.mmsi as i64,
                to_millis(row.ts),
                row.latitude,
                row.longitude,
                row.speed,
                row.course,
                row.source,
                row.confidence,
            ],
        )?;
        Ok(())
    }

    pub fn record_finding(&mut self, row: &FindingRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO findings (mmsi, category, kind, severity, details, data, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.mmsi as i64,
                row.category,
                row.kind,
                row.severity,
                row.details,
                row.data.to_string(),
                to_millis(row.ts),
            ],
        )?;
        Ok(())
    }

    pub fn identity(&self, mmsi: VesselId) -> Result<Option<IdentityObservation>> {
        let row = self
            .conn
            .query_row(
                "SELECT mmsi, name, call_sign, imo, ship_type, length_m, width_m
                 FROM vessels WHERE mmsi = ?1",
                params![mmsi as i64],
                identity_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every stored identity, for pre-fetching the registry at startup.
    pub fn load_identities(&self) -> Result<Vec<IdentityObservation>> {
        let mut stmt = self.conn.prepare(
            "SELECT mmsi, name, call_sign, imo, ship_type, length_m, width_m FROM vessels",
        )?;
        let rows = stmt.query_map([], identity_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Positions for `mmsi` with `start <= ts <= end`, oldest first.
    pub fn history(
        &self,
        mmsi: VesselId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PositionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT mmsi, ts, latitude, longitude, speed, course, source, confidence
             FROM positions WHERE mmsi = ?1 AND ts >= ?2 AND ts <= ?3
             ORDER BY ts ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(
            params![mmsi as i64, to_millis(start), to_millis(end)],
            |r| {
                Ok(PositionRow {
                    mmsi: r.get::<_, i64>(0)? as VesselId,
                    ts: from_millis(r.get(1)?),
                    latitude: r.get(2)?,
                    longitude: r.get(3)?,
                    speed: r.get(4)?,
                    course: r.get(5)?,
                    source: r.get(6)?,
                    confidence: r.get(7)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn finding_count(&self, mmsi: VesselId) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM findings WHERE mmsi = ?1",
            params![mmsi as i64],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }
}

fn identity_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityObservation> {
    Ok(IdentityObservation {
        vessel_id: r.get::<_, i64>(0)? as VesselId,
        name: r.get(1)?,
        call_sign: r.get(2)?,
        imo: r.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        ship_type: r.get(4)?,
        length_meters: r.get(5)?,
        width_meters: r.get(6)?,
    })
}

impl PositionSink for SqliteStore {
    fn write(&mut self, record: &SinkRecord) -> Result<()> {
        match record {
            SinkRecord::Identity(identity) => self.upsert_identity(identity),
            SinkRecord::Position(row) => self.record_position(row),
            SinkRecord::Finding(row) => self.record_finding(row),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl PositionSink for Failing {
        fn write(&mut self, _record: &SinkRecord) -> Result<()> {
            anyhow::bail!("disk on fire")
        }
    }

    #[test]
    fn test_identity_upsert_keeps_known_fields() {
        let mut store = SqliteStore::open(":memory:").unwrap();
        let first = IdentityObservation {
            name: Some("NORDIC STAR".into()),
            ship_type: Some("Tanker".into()),
            ..IdentityObservation::new(219_000_111)
        };
        store.upsert_identity(&first).unwrap();
        let update = IdentityObservation {
            call_sign: Some("OXAB2".into()),
            ..IdentityObservation::new(219_000_111)
        };
        store.upsert_identity(&update).unwrap();

        let got = store.identity(219_000_111).unwrap().unwrap();
        assert_eq!(got.name.as_deref(), Some("NORDIC STAR"));
        assert_eq!(got.call_sign.as_deref(), Some("OXAB2"));
        assert_eq!(got.ship_type.as_deref(), Some("Tanker"));
        assert!(store.identity(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_survives_sink_errors() {
        let (handle, worker) = spawn_sink_worker(Failing, 4);
        assert!(handle.offer(SinkRecord::Identity(IdentityObservation::new(1))));
        drop(handle);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = SinkHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        assert!(handle.offer(SinkRecord::Identity(IdentityObservation::new(1))));
        assert!(!handle.offer(SinkRecord::Identity(IdentityObservation::new(2))));
        assert_eq!(handle.dropped(), 1);
    }
}
