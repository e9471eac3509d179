//! Global stationary tracking, independent of zones.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::VesselId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationaryWindow {
    pub vessel_id: VesselId,
    pub first_below_threshold_at: DateTime<Utc>,
    pub is_loitering: bool,
}

impl StationaryWindow {
    pub fn minutes_at(&self, at: DateTime<Utc>) -> f64 {
        (at - self.first_below_threshold_at).num_milliseconds() as f64 / 60_000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoiterEdge {
    Started,
    Ended,
}

#[derive(Debug, Clone, Copy)]
pub struct LoiterRule {
    pub speed_kn: f64,
    pub after: Duration,
}

impl Default for LoiterRule {
    fn default() -> Self {
        Self {
            speed_kn: 1.0,
            after: Duration::minutes(30),
        }
    }
}

/// Next window for one observation.
///
/// * speed absent: previous window kept as is
/// * below threshold: window opened or continued; loitering once the
///   elapsed time strictly exceeds `rule.after`
/// * at or above threshold: window cleared
pub fn advance_window(
    prev: Option<&StationaryWindow>,
    vessel_id: VesselId,
    speed_kn: Option<f64>,
    at: DateTime<Utc>,
    rule: &LoiterRule,
) -> (Option<StationaryWindow>, Option<LoiterEdge>) {
    let was_loitering = prev.map_or(false, |w| w.is_loitering);
    let speed = match speed_kn {
        Some(s) => s,
        None => return (prev.cloned(), None),
    };

    if speed >= rule.speed_kn {
        let edge = was_loitering.then_some(LoiterEdge::Ended);
        return (None, edge);
    }

    let window = match prev {
        Some(w) => {
            let is_loitering = at - w.first_below_threshold_at > rule.after;
            StationaryWindow {
                vessel_id,
                first_below_threshold_at: w.first_below_threshold_at,
                is_loitering,
            }
        }
        None => StationaryWindow {
            vessel_id,
            first_below_threshold_at: at,
            is_loitering: false,
        },
    };
    let edge = match (was_loitering, window.is_loitering) {
        (false, true) => Some(LoiterEdge::Started),
        (true, false) => Some(LoiterEdge::Ended),
        _ => None,
    };
    (Some(window), edge)
}
