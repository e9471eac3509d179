//! Structured JSON-lines logging for the tracking pipeline.
//!
//! Design goals:
//! 1. Multi-level granularity (TRACE → FATAL)
//! 2. Domain categories so feed chatter can be filtered from findings
//! 3. Periodic aggregated counters instead of per-frame noise
//! 4. Per-run files (`$LOG_DIR/<run_id>/events.jsonl`, `trace.jsonl`)

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::model::{Alert, Deviation, Source, VesselId};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Feed,      // Transport state, frames, reconnects
    Fusion,    // Fused estimates
    Integrity, // Mismatch, speed, teleport alerts
    Behavior,  // Lanes, zones, loitering
    Publish,   // Subscriber fan-out
    Sink,      // Write-behind persistence
    System,    // Startup, shutdown, housekeeping
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Feed => "feed",
            Domain::Fusion => "fusion",
            Domain::Integrity => "integrity",
            Domain::Behavior => "behavior",
            Domain::Publish => "publish",
            Domain::Sink => "sink",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_writer(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext {
                run_id,
                events: None,
                trace: None,
            };
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_writer(run_dir.join("events.jsonl")),
            trace: open_writer(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["api_key", "Apikey", "apikey", "authorization"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["mmsi", "source", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str, flush: bool) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            if flush {
                let _ = w.flush();
            }
        }
    }
}

fn flush_writer(writer: &Option<Mutex<BufWriter<File>>>) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = w.flush();
        }
    }
}

/// Pushes buffered records to the run files. Called on the aggregator
/// tick and at shutdown; errors and above are written through immediately.
pub fn flush() {
    if let Some(ctx) = RUN_CONTEXT.get() {
        flush_writer(&ctx.events);
        flush_writer(&ctx.trace);
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    let urgent = level >= Level::Error;
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line, urgent),
        _ => write_line(&ctx.events, &line, urgent),
    }
    println!("{}", line);
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_feed_state(from: &str, to: &str, reason: &str) {
    log(
        Level::Info,
        Domain::Feed,
        "state_transition",
        obj(&[
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_reconnect_scheduled(attempt: u32, delay_ms: u64, error: Option<&str>) {
    log(
        Level::Warn,
        Domain::Feed,
        "reconnect_scheduled",
        obj(&[
            ("attempt", json!(attempt)),
            ("delay_ms", json!(delay_ms)),
            ("error", error.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_frame_dropped(reason: &str, len: usize) {
    agg_increment("dropped");
    log(
        Level::Debug,
        Domain::Feed,
        "frame_dropped",
        obj(&[("reason", v_str(reason)), ("len", json!(len))]),
    );
}

pub fn log_fusion(mmsi: VesselId, confidence: f64, delta_m: f64) {
    agg_increment("fused");
    log(
        Level::Trace,
        Domain::Fusion,
        "fused",
        obj(&[
            ("mmsi", json!(mmsi)),
            ("confidence", v_num(confidence)),
            ("delta_m", v_num(delta_m)),
        ]),
    );
}

pub fn log_alert(alert: &Alert) {
    agg_increment("alert");
    log(
        Level::Warn,
        Domain::Integrity,
        "alert",
        obj(&[
            ("mmsi", json!(alert.vessel_id)),
            ("kind", json!(alert.kind)),
            ("severity", v_str(alert.severity.as_str())),
            ("msg", v_str(&alert.details)),
        ]),
    );
}

pub fn log_deviation(deviation: &Deviation) {
    agg_increment("deviation");
    log(
        Level::Warn,
        Domain::Behavior,
        "deviation",
        obj(&[
            ("mmsi", json!(deviation.vessel_id)),
            ("kind", json!(deviation.kind)),
            ("severity", v_str(deviation.severity.as_str())),
            ("msg", v_str(&deviation.details)),
        ]),
    );
}

pub fn log_loitering_edge(mmsi: VesselId, started: bool, stationary_minutes: f64) {
    log(
        Level::Info,
        Domain::Behavior,
        if started { "loitering_started" } else { "loitering_ended" },
        obj(&[
            ("mmsi", json!(mmsi)),
            ("stationary_minutes", v_num(stationary_minutes)),
        ]),
    );
}

pub fn log_rejected_observation(mmsi: VesselId, source: Source, reason: &str) {
    agg_increment("dropped");
    log(
        Level::Debug,
        Domain::Feed,
        "observation_rejected",
        obj(&[
            ("mmsi", json!(mmsi)),
            ("source", v_str(source.as_str())),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_sink_failure(op: &str, error: &str) {
    log(
        Level::Warn,
        Domain::Sink,
        "sink_failure",
        obj(&[("op", v_str(op)), ("error", v_str(error))]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Log Aggregator for Periodic Summaries
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

struct LogAggregator {
    frames: u64,
    dropped: u64,
    fused: u64,
    alerts: u64,
    deviations: u64,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            frames: 0,
            dropped: 0,
            fused: 0,
            alerts: 0,
            deviations: 0,
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    fn increment(&mut self, event: &str) {
        match event {
            "frame" => self.frames += 1,
            "dropped" => self.dropped += 1,
            "fused" => self.fused += 1,
            "alert" => self.alerts += 1,
            "deviation" => self.deviations += 1,
            _ => {}
        }
    }

    fn maybe_flush(&mut self) -> Option<[u64; 5]> {
        if self.last_flush.elapsed().as_secs() >= self.flush_interval_secs {
            let result = [
                self.frames,
                self.dropped,
                self.fused,
                self.alerts,
                self.deviations,
            ];
            self.frames = 0;
            self.dropped = 0;
            self.fused = 0;
            self.alerts = 0;
            self.deviations = 0;
            self.last_flush = Instant::now();
            Some(result)
        } else {
            None
        }
    }
}

/// Call periodically to emit aggregated stats
pub fn tick_aggregator() {
    flush();
    if let Ok(mut agg) = get_aggregator().lock() {
        if let Some([frames, dropped, fused, alerts, deviations]) = agg.maybe_flush() {
            log(
                Level::Info,
                Domain::System,
                "aggregated_stats",
                obj(&[
                    ("frames", json!(frames)),
                    ("dropped", json!(dropped)),
                    ("fused", json!(fused)),
                    ("alerts", json!(alerts)),
                    ("deviations", json!(deviations)),
                ]),
            );
        }
    }
}

/// Increment a counter in the aggregator
pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(event);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_credential_redacted() {
        let m = sanitize_fields(obj(&[("Apikey", v_str("secret")), ("url", v_str("wss://x"))]));
        assert_eq!(m.get("Apikey").unwrap(), "[REDACTED]");
        assert_eq!(m.get("url").unwrap(), "wss://x");
    }

    #[test]
    fn test_split_promotes_mmsi() {
        let (top, data) = split_fields(obj(&[("mmsi", json!(123)), ("speed", v_num(4.0))]));
        assert_eq!(top.get("mmsi").unwrap(), 123);
        assert!(data.contains_key("speed"));
        assert!(!data.contains_key("mmsi"));
    }

    #[test]
    fn test_lines_buffer_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let writer = open_writer(path.clone());

        write_line(&writer, "{\"event\":\"fused\"}", false);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        flush_writer(&writer);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"event\":\"fused\"}\n");

        write_line(&writer, "{\"event\":\"sink_failure\"}", true);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }

    #[test]
    fn test_aggregator_flushes_and_resets() {
        let mut agg = LogAggregator::new();
        agg.flush_interval_secs = 0;
        agg.increment("frame");
        agg.increment("frame");
        agg.increment("alert");
        assert_eq!(agg.maybe_flush(), Some([2, 0, 0, 1, 0]));
        assert_eq!(agg.maybe_flush(), Some([0, 0, 0, 0, 0]));
    }
}
