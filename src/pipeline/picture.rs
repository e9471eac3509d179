//! Read model behind the query surface.
//!
//! Shards write their vessels' latest state here after each observation;
//! readers get owned copies. Each call is consistent on its own, with no
//! guarantee across calls or across vessels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::feed::{FeedStatus, FeedStatusSnapshot};
use crate::geo::LatLon;
use crate::interference::{InterferenceZone, SignalLoss, SignalLossTracker};
use crate::model::{Deviation, FusedPosition, IdentityObservation, PositionObservation, VesselId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VesselView {
    pub vessel_id: VesselId,
    pub identity: Option<IdentityObservation>,
    pub last_raw: Option<PositionObservation>,
    pub last_fused: Option<FusedPosition>,
    pub is_loitering: bool,
    pub zone_id: Option<String>,
    pub active_findings: Vec<Deviation>,
    pub last_update: DateTime<Utc>,
}

impl VesselView {
    fn empty(vessel_id: VesselId, at: DateTime<Utc>) -> Self {
        Self {
            vessel_id,
            identity: None,
            last_raw: None,
            last_fused: None,
            is_loitering: false,
            zone_id: None,
            active_findings: Vec::new(),
            last_update: at,
        }
    }

    /// Fused position when known, else the latest raw report.
    pub fn best_position(&self) -> Option<LatLon> {
        self.last_fused
            .as_ref()
            .map(|f| f.point())
            .or_else(|| self.last_raw.as_ref().map(|r| r.point()))
    }
}

/// Everything a shard learned from one position observation.
#[derive(Debug, Clone)]
pub(crate) struct TrackUpdate {
    pub raw: PositionObservation,
    pub fused: Option<FusedPosition>,
    pub is_loitering: bool,
    pub zone_id: Option<String>,
    pub active_findings: Vec<Deviation>,
}

pub struct TrackPicture {
    vessels: RwLock<HashMap<VesselId, VesselView>>,
    signal_loss: Mutex<SignalLossTracker>,
    status: Arc<FeedStatus>,
}

impl TrackPicture {
    pub fn new(status: Arc<FeedStatus>) -> Self {
        Self {
            vessels: RwLock::new(HashMap::new()),
            signal_loss: Mutex::new(SignalLossTracker::new()),
            status,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<VesselId, VesselView>> {
        self.vessels.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<VesselId, VesselView>> {
        self.vessels.write().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn record_track(&self, update: TrackUpdate) {
        let id = update.raw.vessel_id();
        let at = update.raw.observed_at();
        let mut vessels = self.write();
        let view = vessels.entry(id).or_insert_with(|| VesselView::empty(id, at));
        view.last_raw = Some(update.raw);
        if update.fused.is_some() {
            view.last_fused = update.fused;
        }
        view.is_loitering = update.is_loitering;
        view.zone_id = update.zone_id;
        view.active_findings = update.active_findings;
        view.last_update = view.last_update.max(at);
    }

    pub(crate) fn record_identity(&self, identity: IdentityObservation) {
        let mut vessels = self.write();
        let view = vessels
            .entry(identity.vessel_id)
            .or_insert_with(|| VesselView::empty(identity.vessel_id, Utc::now()));
        view.identity = Some(identity);
    }

    /// Removes a vessel that never reported a position.
    pub(crate) fn forget(&self, vessel_id: VesselId) {
        self.write().remove(&vessel_id);
    }

    /// Removes a vessel that went quiet and records where it was last seen.
    pub(crate) fn signal_lost(&self, vessel_id: VesselId, last_seen: LatLon, now: DateTime<Utc>) {
        self.write().remove(&vessel_id);
        let mut tracker = self.signal_loss.lock().unwrap_or_else(|p| p.into_inner());
        tracker.report(
            SignalLoss {
                vessel_id,
                position: last_seen,
                at: now,
            },
            now,
        );
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All vessels, ordered by id.
    pub fn vessels(&self) -> Vec<VesselView> {
        let mut out: Vec<VesselView> = self.read().values().cloned().collect();
        out.sort_by_key(|v| v.vessel_id);
        out
    }

    pub fn vessel(&self, vessel_id: VesselId) -> Option<VesselView> {
        self.read().get(&vessel_id).cloned()
    }

    /// Loitering findings (zone and global) that currently hold.
    pub fn active_findings(&self) -> Vec<Deviation> {
        let vessels = self.read();
        let mut out: Vec<Deviation> = vessels
            .values()
            .flat_map(|v| v.active_findings.iter().cloned())
            .collect();
        out.sort_by_key(|d| (d.vessel_id, d.detected_at));
        out
    }

    pub fn vessels_in_zone(&self, zone_id: &str) -> Vec<VesselId> {
        let mut ids: Vec<VesselId> = self
            .read()
            .values()
            .filter(|v| v.zone_id.as_deref() == Some(zone_id))
            .map(|v| v.vessel_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn interference_zones(&self) -> Vec<InterferenceZone> {
        let mut tracker = self.signal_loss.lock().unwrap_or_else(|p| p.into_inner());
        tracker.zones(Utc::now())
    }

    pub fn feed_status(&self) -> FeedStatusSnapshot {
        self.status.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    fn raw(id: VesselId, lat: f64) -> PositionObservation {
        PositionObservation::new(id, lat, 7.0, Source::Primary, Utc::now()).unwrap()
    }

    fn update(id: VesselId, zone: Option<&str>) -> TrackUpdate {
        TrackUpdate {
            raw: raw(id, 54.1),
            fused: None,
            is_loitering: false,
            zone_id: zone.map(str::to_string),
            active_findings: Vec::new(),
        }
    }

    #[test]
    fn test_track_and_identity_merge_into_one_view() {
        let picture = TrackPicture::new(Arc::new(FeedStatus::new()));
        picture.record_track(update(2, Some("zone-military-exclusion")));
        picture.record_track(update(1, None));
        picture.record_identity(IdentityObservation {
            name: Some("BRAVO".into()),
            ..IdentityObservation::new(2)
        });

        let all = picture.vessels();
        assert_eq!(all.iter().map(|v| v.vessel_id).collect::<Vec<_>>(), vec![1, 2]);
        let two = picture.vessel(2).unwrap();
        assert_eq!(two.identity.unwrap().name.as_deref(), Some("BRAVO"));
        assert_eq!(picture.vessels_in_zone("zone-military-exclusion"), vec![2]);
        assert!(!picture.feed_status().connected);
    }

    #[test]
    fn test_signal_loss_evicts_and_clusters() {
        let picture = TrackPicture::new(Arc::new(FeedStatus::new()));
        for id in 1..=3 {
            picture.record_track(update(id, None));
            picture.signal_lost(id, LatLon::new(54.1, 7.0), Utc::now());
        }
        assert!(picture.is_empty());
        let zones = picture.interference_zones();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].event_count, 3);
    }
}
