//! Sharded processing runtime.
//!
//! Observations are routed by `vessel_id % shards`. A shard owns the fusion
//! state, stationary windows, identity book and history of its vessels, so
//! per-vessel ordering is the channel's FIFO order and nothing per-vessel
//! is shared between tasks.

pub mod picture;
mod shard;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::behavior::{BehaviorAnalyzer, BehaviorConfig, Geofences};
use crate::feed::{FeedStatus, ObservationSink};
use crate::fusion::{FusionConfig, FusionEngine};
use crate::integrity::{IntegrityConfig, IntegrityDetector};
use crate::logging::{self, obj, Domain, Level};
use crate::model::{Observation, VesselId};
use crate::publisher::{Heartbeat, PipelineEvent, Publisher};
use crate::registry::VesselRegistry;

pub use picture::{TrackPicture, VesselView};
use shard::{Shard, ShardMsg};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub shards: usize,
    pub shard_queue_cap: usize,
    pub heartbeat: Duration,
    pub housekeeping: Duration,
    pub stale_after: chrono::Duration,
    pub fusion: FusionConfig,
    pub integrity: IntegrityConfig,
    pub behavior: BehaviorConfig,
    pub geofences: Arc<Geofences>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            shards: num_cpus::get().max(1),
            shard_queue_cap: 1024,
            heartbeat: Duration::from_secs(15),
            housekeeping: Duration::from_secs(60),
            stale_after: chrono::Duration::minutes(30),
            fusion: FusionConfig::default(),
            integrity: IntegrityConfig::default(),
            behavior: BehaviorConfig::default(),
            geofences: Arc::new(Geofences::default()),
        }
    }
}

/// Cheap, cloneable input side of the pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    shards: Arc<Vec<mpsc::Sender<ShardMsg>>>,
}

impl PipelineHandle {
    fn shard_for(&self, vessel_id: VesselId) -> &mpsc::Sender<ShardMsg> {
        let idx = (vessel_id % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }
}

#[async_trait]
impl ObservationSink for PipelineHandle {
    /// Waits for queue space; false once the pipeline has shut down.
    async fn submit(&self, observation: Observation) -> bool {
        let tx = self.shard_for(observation.vessel_id());
        tx.send(ShardMsg::Observe(observation)).await.is_ok()
    }
}

pub struct Pipeline {
    handle: PipelineHandle,
    workers: Vec<JoinHandle<()>>,
    tickers: Vec<JoinHandle<()>>,
    tickers_cancel: CancellationToken,
    picture: Arc<TrackPicture>,
    publisher: Arc<Publisher>,
}

impl Pipeline {
    /// Starts the shard workers plus the heartbeat and housekeeping tickers.
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        settings: PipelineSettings,
        registry: Arc<dyn VesselRegistry>,
        publisher: Arc<Publisher>,
        status: Arc<FeedStatus>,
    ) -> Self {
        let picture = Arc::new(TrackPicture::new(Arc::clone(&status)));
        let n = settings.shards.max(1);

        let mut senders = Vec::with_capacity(n);
        let mut workers = Vec::with_capacity(n);
        for index in 0..n {
            let (tx, rx) = mpsc::channel(settings.shard_queue_cap.max(1));
            let shard = Shard {
                index,
                fusion: FusionEngine::new(settings.fusion.clone()),
                integrity: IntegrityDetector::new(settings.integrity.clone()),
                behavior: BehaviorAnalyzer::new(settings.behavior.clone(), Arc::clone(&settings.geofences)),
                identities: HashMap::new(),
                registry: Arc::clone(&registry),
                publisher: Arc::clone(&publisher),
                picture: Arc::clone(&picture),
            };
            senders.push(tx);
            workers.push(tokio::spawn(shard.run(rx)));
        }
        let handle = PipelineHandle {
            shards: Arc::new(senders),
        };

        logging::log(
            Level::Info,
            Domain::System,
            "pipeline_started",
            obj(&[
                ("shards", serde_json::json!(n)),
                ("queue_cap", serde_json::json!(settings.shard_queue_cap)),
            ]),
        );

        let tickers_cancel = CancellationToken::new();
        let tickers = vec![
            tokio::spawn(heartbeat_loop(
                settings.heartbeat,
                Arc::clone(&publisher),
                Arc::clone(&picture),
                status,
                tickers_cancel.clone(),
            )),
            tokio::spawn(housekeeping_loop(
                settings.housekeeping,
                settings.stale_after,
                handle.clone(),
                tickers_cancel.clone(),
            )),
        ];

        Self {
            handle,
            workers,
            tickers,
            tickers_cancel,
            picture,
            publisher,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn picture(&self) -> Arc<TrackPicture> {
        Arc::clone(&self.picture)
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        Arc::clone(&self.publisher)
    }

    /// Lets every shard finish what is already queued, then closes the
    /// publisher. Submits after this return false.
    pub async fn shutdown(self) {
        self.tickers_cancel.cancel();
        for t in self.tickers {
            let _ = t.await;
        }
        for tx in self.handle.shards.iter() {
            let _ = tx.send(ShardMsg::Stop).await;
        }
        for w in self.workers {
            if let Err(err) = w.await {
                logging::log(
                    Level::Error,
                    Domain::System,
                    "shard_panicked",
                    obj(&[("error", logging::v_str(&err.to_string()))]),
                );
            }
        }
        self.publisher.close();
        logging::log(Level::Info, Domain::System, "pipeline_stopped", obj(&[]));
    }
}

async fn heartbeat_loop(
    period: Duration,
    publisher: Arc<Publisher>,
    picture: Arc<TrackPicture>,
    status: Arc<FeedStatus>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        publisher.publish(PipelineEvent::Heartbeat(Heartbeat {
            at: Utc::now(),
            vessels: picture.len(),
            feed_connected: status.connected(),
        }));
        logging::tick_aggregator();
    }
}

async fn housekeeping_loop(
    period: Duration,
    stale_after: chrono::Duration,
    handle: PipelineHandle,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let cutoff = Utc::now() - stale_after;
        for tx in handle.shards.iter() {
            if tx.send(ShardMsg::Housekeep { cutoff }).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PositionObservation, Source};
    use crate::registry::StaticRegistry;

    fn settings(shards: usize) -> PipelineSettings {
        PipelineSettings {
            shards,
            heartbeat: Duration::from_secs(3600),
            housekeeping: Duration::from_secs(3600),
            ..PipelineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_work() {
        let publisher = Arc::new(Publisher::new(1024, None));
        let sub = publisher.subscribe("test");
        let pipeline = Pipeline::spawn(
            settings(3),
            Arc::new(StaticRegistry::new()),
            Arc::clone(&publisher),
            Arc::new(FeedStatus::new()),
        );
        let handle = pipeline.handle();
        for id in 1..=30u64 {
            let obs = PositionObservation::new(id, 1.0, 1.0, Source::Primary, Utc::now()).unwrap();
            assert!(handle.submit(Observation::Position(obs)).await);
        }
        let picture = pipeline.picture();
        pipeline.shutdown().await;

        let mut updates = 0;
        while let Some(event) = sub.recv().await {
            if let PipelineEvent::VesselUpdated(_) = *event {
                updates += 1;
            }
        }
        assert_eq!(updates, 30);
        assert_eq!(picture.len(), 30);

        let late = PositionObservation::new(1, 1.0, 1.0, Source::Primary, Utc::now()).unwrap();
        assert!(!handle.submit(Observation::Position(late)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_evicts_stale_vessels() {
        use crate::model::{AlertKind, IdentityObservation};
        use chrono::TimeZone;

        let publisher = Arc::new(Publisher::new(1024, None));
        let sub = publisher.subscribe("test");
        let pipeline = Pipeline::spawn(
            PipelineSettings {
                shards: 2,
                heartbeat: Duration::from_secs(3600),
                housekeeping: Duration::from_millis(20),
                // cutoff lands in the future: every vessel is stale
                stale_after: chrono::Duration::seconds(-1),
                ..PipelineSettings::default()
            },
            Arc::new(StaticRegistry::new()),
            Arc::clone(&publisher),
            Arc::new(FeedStatus::new()),
        );
        let handle = pipeline.handle();
        let picture = pipeline.picture();

        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        for (id, lat, lon) in [(1u64, 54.10, 7.00), (2, 54.11, 7.00), (3, 54.10, 7.01)] {
            let obs = PositionObservation::new(id, lat, lon, Source::Primary, t0).unwrap();
            assert!(handle.submit(Observation::Position(obs)).await);
        }
        let identity = IdentityObservation {
            name: Some("QUIET".into()),
            ..IdentityObservation::new(4)
        };
        assert!(handle.submit(Observation::Identity(identity)).await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(picture.is_empty());
        let zones = picture.interference_zones();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].event_count, 3);

        // fusion history went with the eviction: a 12nm jump 30s later is
        // a fresh start, not a teleport
        let jump = PositionObservation::new(
            1,
            54.30,
            7.00,
            Source::Primary,
            t0 + chrono::Duration::seconds(30),
        )
        .unwrap();
        assert!(handle.submit(Observation::Position(jump)).await);
        pipeline.shutdown().await;

        let mut teleports = 0;
        while let Some(event) = sub.recv().await {
            if let PipelineEvent::AlertRaised(a) = &*event {
                if a.kind == AlertKind::Teleport {
                    teleports += 1;
                }
            }
        }
        assert_eq!(teleports, 0);
    }

    #[tokio::test]
    async fn test_same_vessel_stays_on_one_shard() {
        let (a, _ra) = mpsc::channel(1);
        let (b, _rb) = mpsc::channel(1);
        let handle = PipelineHandle {
            shards: Arc::new(vec![a, b]),
        };
        assert!(handle.shard_for(7).same_channel(handle.shard_for(7)));
        assert!(!handle.shard_for(7).same_channel(handle.shard_for(8)));
    }
}
