//! The ingestion client: live subscription with reconnect backoff, or the
//! simulator when no credential is configured.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::aisstream::{self, decode_frame, WsConnector};
use super::backoff::Backoff;
use super::simulator::{Fleet, SimConfig};
use super::status::{FeedEvent, FeedStatus};
use super::{FeedConnector, FeedSession, ObservationSink};
use crate::logging::{self, obj, v_str, Domain, Level};
use crate::model::{Observation, ObservationError, PositionObservation, Source, VesselId};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Absent or empty selects simulation.
    pub api_key: Option<String>,
    pub url: String,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub sim: SimConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: aisstream::DEFAULT_URL.to_string(),
            base_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            sim: SimConfig::default(),
        }
    }
}

impl ClientConfig {
    fn credential(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

enum SessionEnd {
    Cancelled,
    Closed(String),
    SinkGone,
}

pub struct IngestionClient<S: ObservationSink + Clone + 'static> {
    cfg: ClientConfig,
    connector: Arc<dyn FeedConnector>,
    sink: S,
    status: Arc<FeedStatus>,
    cancel: CancellationToken,
}

impl<S: ObservationSink + Clone + 'static> IngestionClient<S> {
    pub fn new(cfg: ClientConfig, sink: S, status: Arc<FeedStatus>, cancel: CancellationToken) -> Self {
        let connector = Arc::new(WsConnector::new(cfg.url.clone()));
        Self::with_connector(cfg, connector, sink, status, cancel)
    }

    pub fn with_connector(
        cfg: ClientConfig,
        connector: Arc<dyn FeedConnector>,
        sink: S,
        status: Arc<FeedStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            connector,
            sink,
            status,
            cancel,
        }
    }

    pub fn status(&self) -> Arc<FeedStatus> {
        Arc::clone(&self.status)
    }

    /// Entry point for the independent local sensor.
    pub fn secondary_injector(&self) -> SecondaryInjector<S> {
        SecondaryInjector {
            sink: self.sink.clone(),
            status: Arc::clone(&self.status),
        }
    }

    /// Runs until cancelled (or until the pipeline stops accepting input).
    pub async fn run(self) {
        if self.cfg.credential().is_some() {
            self.run_live().await;
        } else {
            logging::log(
                Level::Warn,
                Domain::Feed,
                "credential_missing",
                obj(&[("msg", v_str("AISSTREAM_API_KEY not set; simulating fleet"))]),
            );
            self.run_simulation().await;
        }
        self.transition(FeedEvent::Stop, "shutdown");
    }

    fn transition(&self, event: FeedEvent, reason: &str) {
        match self.status.apply(event) {
            Ok((from, to)) => logging::log_feed_state(from.as_str(), to.as_str(), reason),
            Err(err) => logging::log(
                Level::Error,
                Domain::Feed,
                "invalid_transition",
                obj(&[
                    ("from", v_str(err.from.as_str())),
                    ("event", v_str(&format!("{:?}", err.event))),
                ]),
            ),
        }
    }

    async fn run_live(&self) {
        let mut backoff = Backoff::new(self.cfg.base_backoff_ms, self.cfg.max_backoff_ms);

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            self.transition(FeedEvent::Connect, "dial");

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = self.connector.connect() => r,
            };

            let reason = match connected {
                Ok(mut session) => {
                    backoff.reset();
                    match self.serve(session.as_mut()).await {
                        SessionEnd::Cancelled => {
                            session.close().await;
                            return;
                        }
                        SessionEnd::SinkGone => {
                            session.close().await;
                            logging::log(
                                Level::Warn,
                                Domain::Feed,
                                "pipeline_closed",
                                obj(&[("msg", v_str("observation sink closed; stopping feed"))]),
                            );
                            return;
                        }
                        SessionEnd::Closed(reason) => reason,
                    }
                }
                Err(err) => format!("{:#}", err),
            };
            self.transition(FeedEvent::Closed, &reason);

            let delay = backoff.next_delay();
            self.status.reconnect_scheduled();
            logging::log_reconnect_scheduled(backoff.attempt(), delay.as_millis() as u64, Some(&reason));

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    /// Subscribes and pumps frames until the session ends.
    async fn serve(&self, session: &mut dyn FeedSession) -> SessionEnd {
        let sub = match self.cfg.credential().map(aisstream::subscription_message) {
            Some(Ok(text)) => text,
            Some(Err(err)) => return SessionEnd::Closed(format!("{:#}", err)),
            None => return SessionEnd::Closed("missing credential".to_string()),
        };
        if let Err(err) = session.send_text(sub).await {
            return SessionEnd::Closed(format!("{:#}", err));
        }
        self.transition(FeedEvent::Opened, "subscribed");

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                r = session.next_text() => r,
            };
            match next {
                Ok(Some(text)) => {
                    if !self.handle_frame(&text, Utc::now()).await {
                        return SessionEnd::SinkGone;
                    }
                }
                Ok(None) => return SessionEnd::Closed("remote closed".to_string()),
                Err(err) => return SessionEnd::Closed(format!("{:#}", err)),
            }
        }
    }

    async fn handle_frame(&self, text: &str, received_at: DateTime<Utc>) -> bool {
        self.status.frame_received(received_at);
        logging::agg_increment("frame");
        match decode_frame(text, received_at) {
            Ok(observations) => {
                self.status.frame_decoded();
                for obs in observations {
                    if !self.sink.submit(obs).await {
                        return false;
                    }
                }
            }
            Err(err) => {
                self.status.frame_dropped();
                logging::log_frame_dropped(err.reason(), text.len());
            }
        }
        true
    }

    async fn run_simulation(&self) {
        self.transition(FeedEvent::Simulate, "no credential");
        let mut fleet = Fleet::new(&self.cfg.sim);
        for identity in fleet.identities() {
            if !self.sink.submit(Observation::Identity(identity)).await {
                return;
            }
        }

        let period = Duration::from_millis(self.cfg.sim.tick_ms.max(1));
        let dt_secs = period.as_secs_f64();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let now = Utc::now();
            for obs in fleet.tick(dt_secs, now) {
                self.status.frame_received(now);
                self.status.frame_decoded();
                if !self.sink.submit(Observation::Position(obs)).await {
                    return;
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum InjectError {
    Invalid(ObservationError),
    PipelineClosed,
}

impl fmt::Display for InjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectError::Invalid(e) => write!(f, "{}", e),
            InjectError::PipelineClosed => write!(f, "pipeline closed"),
        }
    }
}

impl std::error::Error for InjectError {}

/// Accepts `SECONDARY` observations and forwards them into the same
/// pipeline as the feed.
#[derive(Clone)]
pub struct SecondaryInjector<S: ObservationSink + Clone> {
    sink: S,
    status: Arc<FeedStatus>,
}

impl<S: ObservationSink + Clone> SecondaryInjector<S> {
    pub fn new(sink: S, status: Arc<FeedStatus>) -> Self {
        Self { sink, status }
    }

    pub async fn inject(
        &self,
        vessel_id: VesselId,
        latitude: f64,
        longitude: f64,
        speed_kn: Option<f64>,
        heading_deg: Option<f64>,
        observed_at: DateTime<Utc>,
    ) -> Result<(), InjectError> {
        let obs = match PositionObservation::new(vessel_id, latitude, longitude, Source::Secondary, observed_at) {
            Ok(obs) => obs.with_speed(speed_kn).with_course(heading_deg),
            Err(err) => {
                self.status.secondary_rejected();
                logging::log_rejected_observation(vessel_id, Source::Secondary, &err.to_string());
                return Err(InjectError::Invalid(err));
            }
        };
        if !self.sink.submit(Observation::Position(obs)).await {
            return Err(InjectError::PipelineClosed);
        }
        self.status.secondary_accepted();
        Ok(())
    }

    /// Counts a track that failed validation before reaching `inject`.
    pub fn reject(&self) {
        self.status.secondary_rejected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::status::FeedState;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_injector_tags_secondary_and_rejects_bad_coordinates() {
        let (tx, mut rx) = mpsc::channel(4);
        let status = Arc::new(FeedStatus::new());
        let injector = SecondaryInjector::new(tx, Arc::clone(&status));

        injector
            .inject(123_456_789, 48.3, -124.0, Some(12.0), Some(90.0), Utc::now())
            .await
            .unwrap();
        match rx.recv().await {
            Some(Observation::Position(p)) => assert_eq!(p.source(), Source::Secondary),
            other => panic!("unexpected {:?}", other),
        }

        let err = injector
            .inject(123_456_789, 95.0, 0.0, None, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::Invalid(ObservationError::LatitudeOutOfRange(_))));
        let snap = status.snapshot();
        assert_eq!((snap.secondary_accepted, snap.secondary_rejected), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_without_credential() {
        let (tx, mut rx) = mpsc::channel(256);
        let status = Arc::new(FeedStatus::new());
        let cancel = CancellationToken::new();
        let cfg = ClientConfig {
            api_key: Some("   ".into()),
            sim: SimConfig {
                vessels: 3,
                seed: Some(1),
                ..SimConfig::default()
            },
            ..ClientConfig::default()
        };
        let client = IngestionClient::new(cfg, tx, Arc::clone(&status), cancel.clone());
        let task = tokio::spawn(client.run());

        let mut identities = 0;
        let mut positions = 0;
        while positions < 6 {
            match rx.recv().await {
                Some(Observation::Identity(_)) => identities += 1,
                Some(Observation::Position(p)) => {
                    assert_eq!(p.source(), Source::Primary);
                    positions += 1;
                }
                None => break,
            }
        }
        assert_eq!(identities, 3);
        assert_eq!(status.state(), FeedState::Simulating);
        assert!(status.connected());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(status.state(), FeedState::Stopped);
    }
}
