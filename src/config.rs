use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use url::Url;

use crate::behavior::{BehaviorConfig, Geofences};
use crate::feed::aisstream::DEFAULT_URL;
use crate::feed::simulator::SimConfig;
use crate::feed::ClientConfig;
use crate::fusion::FusionConfig;
use crate::geo::BoundingBox;
use crate::integrity::IntegrityConfig;
use crate::pipeline::PipelineSettings;

#[derive(Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub feed_url: String,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub sim_vessels: usize,
    pub sim_tick_ms: u64,
    pub sim_bounds: BoundingBox,
    pub sim_seed: Option<u64>,
    pub shards: usize,
    pub shard_queue_cap: usize,
    pub subscriber_queue_cap: usize,
    pub sink_queue_cap: usize,
    pub heartbeat_secs: u64,
    pub fusion_zero_confidence_m: f64,
    pub mismatch_medium_m: f64,
    pub mismatch_high_m: f64,
    pub speed_anomaly_kn: f64,
    pub teleport_nm: f64,
    pub teleport_window_secs: f64,
    pub loiter_speed_kn: f64,
    pub loiter_minutes: i64,
    pub zone_loiter_speed_kn: f64,
    pub stale_after_secs: i64,
    pub housekeeping_secs: u64,
    pub sqlite_path: Option<String>,
    pub sensor_listen_addr: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("feed_url", &self.feed_url)
            .field("shards", &self.shards)
            .field("sim_vessels", &self.sim_vessels)
            .field("sqlite_path", &self.sqlite_path)
            .field("sensor_listen_addr", &self.sensor_listen_addr)
            .finish_non_exhaustive()
    }
}

/// `min_lat,min_lon,max_lat,max_lon`
pub fn parse_bounds(raw: &str) -> Option<BoundingBox> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [min_lat, min_lon, max_lat, max_lon] => Some(BoundingBox {
            min_lat: *min_lat,
            min_lon: *min_lon,
            max_lat: *max_lat,
            max_lon: *max_lon,
        }),
        _ => None,
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            api_key: non_empty("AISSTREAM_API_KEY"),
            feed_url: std::env::var("AISSTREAM_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
            base_backoff_ms: std::env::var("FEED_BASE_BACKOFF_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(1000),
            max_backoff_ms: std::env::var("FEED_MAX_BACKOFF_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(30_000),
            sim_vessels: std::env::var("SIM_VESSELS").ok().and_then(|v| v.parse().ok()).unwrap_or(20),
            sim_tick_ms: std::env::var("SIM_TICK_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(2000),
            sim_bounds: std::env::var("SIM_BOUNDS").ok().and_then(|v| parse_bounds(&v)).unwrap_or(SimConfig::default().bounds),
            sim_seed: std::env::var("SIM_SEED").ok().and_then(|v| v.parse().ok()),
            shards: std::env::var("PIPELINE_SHARDS").ok().and_then(|v| v.parse().ok()).unwrap_or_else(num_cpus::get),
            shard_queue_cap: std::env::var("SHARD_QUEUE_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(1024),
            subscriber_queue_cap: std::env::var("SUBSCRIBER_QUEUE_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(256),
            sink_queue_cap: std::env::var("SINK_QUEUE_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(4096),
            heartbeat_secs: std::env::var("HEARTBEAT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(15),
            fusion_zero_confidence_m: std::env::var("FUSION_ZERO_CONFIDENCE_M").ok().and_then(|v| v.parse().ok()).unwrap_or(1000.0),
            mismatch_medium_m: std::env::var("MISMATCH_MEDIUM_M").ok().and_then(|v| v.parse().ok()).unwrap_or(500.0),
            mismatch_high_m: std::env::var("MISMATCH_HIGH_M").ok().and_then(|v| v.parse().ok()).unwrap_or(1000.0),
            speed_anomaly_kn: std::env::var("SPEED_ANOMALY_KN").ok().and_then(|v| v.parse().ok()).unwrap_or(60.0),
            teleport_nm: std::env::var("TELEPORT_NM").ok().and_then(|v| v.parse().ok()).unwrap_or(10.0),
            teleport_window_secs: std::env::var("TELEPORT_WINDOW_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60.0),
            loiter_speed_kn: std::env::var("LOITER_SPEED_KN").ok().and_then(|v| v.parse().ok()).unwrap_or(1.0),
            loiter_minutes: std::env::var("LOITER_MINUTES").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            zone_loiter_speed_kn: std::env::var("ZONE_LOITER_SPEED_KN").ok().and_then(|v| v.parse().ok()).unwrap_or(0.5),
            stale_after_secs: std::env::var("STALE_AFTER_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(1800),
            housekeeping_secs: std::env::var("HOUSEKEEPING_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
            sqlite_path: non_empty("SQLITE_PATH"),
            sensor_listen_addr: non_empty("SENSOR_LISTEN_ADDR"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.feed_url).with_context(|| format!("AISSTREAM_URL {}", self.feed_url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("AISSTREAM_URL must be ws:// or wss://, got {}", url.scheme());
        }
        let b = &self.sim_bounds;
        if !(b.min_lat < b.max_lat && b.min_lon < b.max_lon)
            || b.min_lat < -90.0
            || b.max_lat > 90.0
            || b.min_lon < -180.0
            || b.max_lon > 180.0
        {
            bail!("SIM_BOUNDS is not a valid box: {:?}", b);
        }
        if self.shards == 0 {
            bail!("PIPELINE_SHARDS must be at least 1");
        }
        if self.mismatch_medium_m >= self.mismatch_high_m {
            bail!(
                "MISMATCH_MEDIUM_M ({}) must be below MISMATCH_HIGH_M ({})",
                self.mismatch_medium_m,
                self.mismatch_high_m
            );
        }
        if self.base_backoff_ms == 0 || self.max_backoff_ms < self.base_backoff_ms {
            bail!("feed backoff bounds are inconsistent");
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            api_key: self.api_key.clone(),
            url: self.feed_url.clone(),
            base_backoff_ms: self.base_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            sim: SimConfig {
                vessels: self.sim_vessels,
                tick_ms: self.sim_tick_ms,
                bounds: self.sim_bounds,
                seed: self.sim_seed,
            },
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            shards: self.shards.max(1),
            shard_queue_cap: self.shard_queue_cap,
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
            housekeeping: Duration::from_secs(self.housekeeping_secs.max(1)),
            stale_after: chrono::Duration::seconds(self.stale_after_secs),
            fusion: FusionConfig {
                zero_confidence_m: self.fusion_zero_confidence_m,
            },
            integrity: IntegrityConfig {
                mismatch_medium_m: self.mismatch_medium_m,
                mismatch_high_m: self.mismatch_high_m,
                speed_anomaly_kn: self.speed_anomaly_kn,
                teleport_nm: self.teleport_nm,
                teleport_window_secs: self.teleport_window_secs,
            },
            behavior: BehaviorConfig::new(self.loiter_speed_kn, self.loiter_minutes, self.zone_loiter_speed_kn),
            geofences: Arc::new(Geofences::default()),
        }
    }
}
