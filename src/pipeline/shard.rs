//! One shard worker. Owns all per-vessel state for the vessel ids hashed
//! to it and processes its queue strictly in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::picture::{TrackPicture, TrackUpdate};
use crate::behavior::{BehaviorAnalyzer, Track};
use crate::fusion::FusionEngine;
use crate::integrity::{IntegrityDetector, IntegrityInput};
use crate::logging;
use crate::model::{IdentityObservation, Observation, PositionObservation, VesselId};
use crate::publisher::{PipelineEvent, Publisher, VesselUpdate};
use crate::registry::VesselRegistry;

#[derive(Debug)]
pub(crate) enum ShardMsg {
    Observe(Observation),
    Housekeep { cutoff: DateTime<Utc> },
    Stop,
}

/// Merged identity plus when this shard last heard anything about it.
#[derive(Debug, Clone)]
pub(crate) struct IdentityEntry {
    pub identity: IdentityObservation,
    pub updated_at: DateTime<Utc>,
}

pub(crate) struct Shard {
    pub index: usize,
    pub fusion: FusionEngine,
    pub integrity: IntegrityDetector,
    pub behavior: BehaviorAnalyzer,
    pub identities: HashMap<VesselId, IdentityEntry>,
    pub registry: Arc<dyn VesselRegistry>,
    pub publisher: Arc<Publisher>,
    pub picture: Arc<TrackPicture>,
}

impl Shard {
    pub async fn run(mut self, mut rx: mpsc::Receiver<ShardMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ShardMsg::Observe(Observation::Position(obs)) => self.handle_position(obs),
                ShardMsg::Observe(Observation::Identity(identity)) => self.handle_identity(identity),
                ShardMsg::Housekeep { cutoff } => self.housekeep(cutoff),
                ShardMsg::Stop => break,
            }
        }
        logging::log(
            logging::Level::Debug,
            logging::Domain::System,
            "shard_stopped",
            logging::obj(&[("shard", serde_json::json!(self.index))]),
        );
    }

    fn ship_type(&self, vessel_id: VesselId) -> Option<String> {
        self.identities
            .get(&vessel_id)
            .and_then(|e| e.identity.ship_type.clone())
            .or_else(|| self.registry.ship_type(vessel_id))
    }

    pub fn handle_position(&mut self, obs: PositionObservation) {
        let id = obs.vessel_id();
        let previous = self.fusion.latest(id, obs.source()).cloned();
        let fused = self.fusion.observe(&obs);
        let counterpart = fused
            .as_ref()
            .and_then(|_| self.fusion.latest(id, obs.source().other()).cloned());
        let ship_type = self.ship_type(id);

        let alerts = self.integrity.evaluate(IntegrityInput {
            observation: &obs,
            previous: previous.as_ref(),
            counterpart: counterpart.as_ref(),
            ship_type: ship_type.as_deref(),
        });

        let report = self.behavior.analyze(&Track {
            vessel_id: id,
            position: fused.as_ref().map_or_else(|| obs.point(), |f| f.point()),
            speed_kn: obs.speed_over_ground(),
            course_deg: obs.course_or_heading(),
            at: obs.observed_at(),
        });

        self.picture.record_track(TrackUpdate {
            raw: obs.clone(),
            fused: fused.clone(),
            is_loitering: report.is_loitering,
            zone_id: report.zone_id.clone(),
            active_findings: report.active.clone(),
        });

        let update = match fused {
            Some(f) => VesselUpdate::Fused(f),
            None => VesselUpdate::Raw {
                observation: obs,
                identity: self.identities.get(&id).map(|e| e.identity.clone()),
            },
        };
        self.publisher.publish(PipelineEvent::VesselUpdated(update));

        for alert in alerts {
            logging::log_alert(&alert);
            self.publisher.publish(PipelineEvent::AlertRaised(alert));
        }
        for deviation in report.deviations {
            logging::log_deviation(&deviation);
            self.publisher.publish(PipelineEvent::DeviationFound(deviation));
        }
    }

    pub fn handle_identity(&mut self, identity: IdentityObservation) {
        if identity.is_empty() {
            return;
        }
        let entry = self.identities.entry(identity.vessel_id).or_insert_with(|| IdentityEntry {
            identity: IdentityObservation::new(identity.vessel_id),
            updated_at: Utc::now(),
        });
        entry.updated_at = Utc::now();
        // repeated static reports refresh liveness only
        if !entry.identity.merge(&identity) {
            return;
        }
        self.picture.record_identity(entry.identity.clone());
        self.publisher.persist_identity(&identity);
    }

    /// Drops vessels whose newest report predates `cutoff`. Vessels with a
    /// position count as signal loss; identity-only vessels just go away.
    pub fn housekeep(&mut self, cutoff: DateTime<Utc>) {
        let now = Utc::now();
        for id in self.fusion.stale_vessels(cutoff) {
            let last_seen = self.fusion.state(id).and_then(|s| {
                match (s.primary.as_ref(), s.secondary.as_ref()) {
                    (Some(p), Some(q)) if q.observed_at() > p.observed_at() => Some(q.point()),
                    (Some(p), _) => Some(p.point()),
                    (None, Some(q)) => Some(q.point()),
                    (None, None) => None,
                }
            });
            self.fusion.evict(id);
            self.behavior.evict(id);
            self.identities.remove(&id);
            match last_seen {
                Some(point) => self.picture.signal_lost(id, point, now),
                None => self.picture.forget(id),
            }
            log_evicted(id, "stale_position");
        }

        let identity_only: Vec<VesselId> = self
            .identities
            .iter()
            .filter(|(id, e)| e.updated_at < cutoff && self.fusion.state(**id).is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in identity_only {
            self.identities.remove(&id);
            self.picture.forget(id);
            log_evicted(id, "stale_identity");
        }
    }
}

fn log_evicted(id: VesselId, reason: &str) {
    logging::log(
        logging::Level::Info,
        logging::Domain::System,
        "vessel_evicted",
        logging::obj(&[("mmsi", serde_json::json!(id)), ("reason", logging::v_str(reason))]),
    );
}
