//! Lane conformance and loitering analysis on fused (or raw) tracks.
//!
//! The analyzer owns one `StationaryWindow` per vessel and nothing else;
//! corridor and zone checks are pure.

pub mod lanes;
pub mod loitering;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::geo::LatLon;
use crate::logging;
use crate::model::{Deviation, DeviationKind, Finding, Severity, VesselId};

pub use lanes::{check_corridor, check_zone_loitering, Corridor, Geofences, SensitiveZone, ZoneKind};
pub use loitering::{advance_window, LoiterEdge, LoiterRule, StationaryWindow};

#[derive(Debug, Clone)]
pub struct BehaviorConfig {
    pub loiter: LoiterRule,
    pub zone_loiter_speed_kn: f64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            loiter: LoiterRule::default(),
            zone_loiter_speed_kn: 0.5,
        }
    }
}

impl BehaviorConfig {
    pub fn new(loiter_speed_kn: f64, loiter_minutes: i64, zone_loiter_speed_kn: f64) -> Self {
        Self {
            loiter: LoiterRule {
                speed_kn: loiter_speed_kn,
                after: Duration::minutes(loiter_minutes),
            },
            zone_loiter_speed_kn,
        }
    }
}

/// One position to analyze. `position` is the fused estimate when there is
/// one; speed and course always come from the raw report.
#[derive(Debug, Clone, Copy)]
pub struct Track {
    pub vessel_id: VesselId,
    pub position: LatLon,
    pub speed_kn: Option<f64>,
    pub course_deg: Option<f64>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct BehaviorReport {
    /// New findings to publish.
    pub deviations: Vec<Deviation>,
    /// Loitering findings that hold as of this track, for the read model.
    pub active: Vec<Deviation>,
    pub is_loitering: bool,
    pub edge: Option<LoiterEdge>,
    pub zone_id: Option<String>,
}

pub struct BehaviorAnalyzer {
    cfg: BehaviorConfig,
    geofences: Arc<Geofences>,
    windows: HashMap<VesselId, StationaryWindow>,
}

impl BehaviorAnalyzer {
    pub fn new(cfg: BehaviorConfig, geofences: Arc<Geofences>) -> Self {
        Self {
            cfg,
            geofences,
            windows: HashMap::new(),
        }
    }

    pub fn analyze(&mut self, track: &Track) -> BehaviorReport {
        let mut report = BehaviorReport::default();

        for corridor in &self.geofences.corridors {
            report.deviations.extend(check_corridor(
                corridor,
                track.vessel_id,
                track.position,
                track.speed_kn,
                track.course_deg,
                track.at,
            ));
        }

        let prev = self.windows.get(&track.vessel_id);
        let (window, edge) =
            advance_window(prev, track.vessel_id, track.speed_kn, track.at, &self.cfg.loiter);
        let stationary_minutes = window.as_ref().map(|w| w.minutes_at(track.at));

        if let Some(zone) = self.geofences.zone_at(track.position) {
            report.zone_id = Some(zone.id.clone());
        }
        for zone in &self.geofences.zones {
            if let Some(found) = check_zone_loitering(
                zone,
                track.vessel_id,
                track.position,
                track.speed_kn,
                self.cfg.zone_loiter_speed_kn,
                stationary_minutes,
                track.at,
            ) {
                report.active.push(found.clone());
                report.deviations.push(found);
            }
        }

        report.is_loitering = window.as_ref().map_or(false, |w| w.is_loitering);
        report.edge = edge;

        if let Some(edge) = edge {
            logging::log_loitering_edge(
                track.vessel_id,
                edge == LoiterEdge::Started,
                stationary_minutes.unwrap_or(0.0),
            );
        }
        if let Some(w) = window.as_ref().filter(|w| w.is_loitering) {
            let global = Finding {
                vessel_id: track.vessel_id,
                kind: DeviationKind::Loitering,
                severity: Severity::Medium,
                details: format!("stationary for {:.0}min", w.minutes_at(track.at)),
                data: json!({
                    "since": w.first_below_threshold_at,
                    "thresholdKnots": self.cfg.loiter.speed_kn,
                }),
                detected_at: track.at,
            };
            if edge == Some(LoiterEdge::Started) {
                report.deviations.push(global.clone());
            }
            report.active.push(global);
        }

        match window {
            Some(w) => {
                self.windows.insert(track.vessel_id, w);
            }
            None => {
                self.windows.remove(&track.vessel_id);
            }
        }
        report
    }

    pub fn window(&self, vessel_id: VesselId) -> Option<&StationaryWindow> {
        self.windows.get(&vessel_id)
    }

    pub fn evict(&mut self, vessel_id: VesselId) {
        self.windows.remove(&vessel_id);
    }

    pub fn geofences(&self) -> &Geofences {
        &self.geofences
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn analyzer() -> BehaviorAnalyzer {
        BehaviorAnalyzer::new(BehaviorConfig::default(), Arc::new(Geofences::default()))
    }

    fn track(lat: f64, lon: f64, speed: Option<f64>, course: Option<f64>, min: i64) -> Track {
        Track {
            vessel_id: 366_000_001,
            position: LatLon::new(lat, lon),
            speed_kn: speed,
            course_deg: course,
            at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(min),
        }
    }

    #[test]
    fn test_speeding_in_lane() {
        let report = analyzer().analyze(&track(48.3, -124.0, Some(30.0), Some(90.0), 0));
        assert_eq!(report.deviations.len(), 1);
        assert_eq!(report.deviations[0].kind, DeviationKind::SpeedAnomaly);
        assert_eq!(report.deviations[0].severity, Severity::Medium);
    }

    #[test]
    fn test_wrong_way_in_lane() {
        let report = analyzer().analyze(&track(48.3, -124.0, Some(15.0), Some(270.0), 0));
        assert_eq!(report.deviations.len(), 1);
        assert_eq!(report.deviations[0].kind, DeviationKind::CourseMismatch);
    }

    #[test]
    fn test_loitering_in_protection_zone() {
        let report = analyzer().analyze(&track(48.5, -123.0, Some(0.1), None, 0));
        assert_eq!(report.deviations.len(), 1);
        assert_eq!(report.deviations[0].kind, DeviationKind::Loitering);
        assert_eq!(report.deviations[0].severity, Severity::High);
        assert_eq!(report.zone_id.as_deref(), Some("zone-sensitive-1"));
        assert_eq!(report.active.len(), 1);
    }

    #[test]
    fn test_normal_transit_is_clean() {
        let report = analyzer().analyze(&track(48.3, -124.0, Some(15.0), Some(90.0), 0));
        assert!(report.deviations.is_empty());
        assert!(report.active.is_empty());
    }

    #[test]
    fn test_global_loitering_reported_on_edge_only() {
        let mut a = analyzer();
        let mut raised = 0;
        for m in 0..=40 {
            let r = a.analyze(&track(0.0, 0.0, Some(0.2), None, m));
            raised += r
                .deviations
                .iter()
                .filter(|d| d.kind == DeviationKind::Loitering)
                .count();
            assert_eq!(r.is_loitering, m > 30, "minute {}", m);
        }
        assert_eq!(raised, 1);
        assert!(a.window(366_000_001).unwrap().is_loitering);

        let r = a.analyze(&track(0.0, 0.0, Some(3.0), None, 41));
        assert!(!r.is_loitering);
        assert_eq!(r.edge, Some(LoiterEdge::Ended));
        assert!(r.active.is_empty());
        assert!(a.window(366_000_001).is_none());
    }
}
