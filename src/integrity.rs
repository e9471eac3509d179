//! Stateless integrity checks: source mismatch, implausible speed, teleports.
//!
//! Every check is a pure function of its inputs. The caller decides which
//! checks apply from what it has: mismatch needs both sources, teleport
//! needs the previous snapshot from the same source.

use serde_json::json;

use crate::geo::{distance_meters, distance_nm};
use crate::model::{Alert, AlertKind, Finding, PositionObservation, Severity};

#[derive(Debug, Clone)]
pub struct IntegrityConfig {
    /// Separation above which a mismatch is MEDIUM.
    pub mismatch_medium_m: f64,
    /// Separation above which a mismatch is HIGH.
    pub mismatch_high_m: f64,
    pub speed_anomaly_kn: f64,
    pub teleport_nm: f64,
    pub teleport_window_secs: f64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            mismatch_medium_m: 500.0,
            mismatch_high_m: 1000.0,
            speed_anomaly_kn: 60.0,
            teleport_nm: 10.0,
            teleport_window_secs: 60.0,
        }
    }
}

/// `> high` is HIGH, `(medium, high]` is MEDIUM, anything else is fine.
pub fn classify_mismatch(delta_m: f64, cfg: &IntegrityConfig) -> Option<Severity> {
    if delta_m > cfg.mismatch_high_m {
        Some(Severity::High)
    } else if delta_m > cfg.mismatch_medium_m {
        Some(Severity::Medium)
    } else {
        None
    }
}

/// Two same-vessel observations from different sources.
pub fn check_position_mismatch(
    a: &PositionObservation,
    b: &PositionObservation,
    cfg: &IntegrityConfig,
) -> Option<Alert> {
    if a.vessel_id() != b.vessel_id() || a.source() == b.source() {
        return None;
    }
    let delta_m = distance_meters(a.point(), b.point());
    let severity = classify_mismatch(delta_m, cfg)?;
    let (primary, secondary) = if a.source() == crate::model::Source::Primary {
        (a, b)
    } else {
        (b, a)
    };

    Some(Finding {
        vessel_id: a.vessel_id(),
        kind: AlertKind::PositionMismatch,
        severity,
        details: format!("sources disagree by {:.0}m", delta_m),
        data: json!({
            "deltaMeters": delta_m,
            "primary": { "latitude": primary.latitude(), "longitude": primary.longitude() },
            "secondary": { "latitude": secondary.latitude(), "longitude": secondary.longitude() },
        }),
        detected_at: a.observed_at().max(b.observed_at()),
    })
}

/// True for ship-type strings naming the high-speed-craft class.
pub fn is_high_speed_craft(ship_type: &str) -> bool {
    let t = ship_type.to_ascii_lowercase();
    t.contains("high speed")
        || t.contains("high-speed")
        || t.split(|c: char| !c.is_ascii_alphanumeric()).any(|w| w == "hsc")
}

pub fn check_speed_anomaly(
    obs: &PositionObservation,
    ship_type: Option<&str>,
    cfg: &IntegrityConfig,
) -> Option<Alert> {
    let speed = obs.speed_over_ground()?;
    if speed <= cfg.speed_anomaly_kn {
        return None;
    }
    if ship_type.map_or(false, is_high_speed_craft) {
        return None;
    }

    Some(Finding {
        vessel_id: obs.vessel_id(),
        kind: AlertKind::SpeedAnomaly,
        severity: Severity::Medium,
        details: format!(
            "reported {:.1}kn exceeds {:.0}kn for type {}",
            speed,
            cfg.speed_anomaly_kn,
            ship_type.unwrap_or("unknown")
        ),
        data: json!({
            "speedKnots": speed,
            "limitKnots": cfg.speed_anomaly_kn,
            "shipType": ship_type,
        }),
        detected_at: obs.observed_at(),
    })
}

/// Flags an implied jump of more than `teleport_nm` within the window.
/// Non-positive time deltas (duplicates, out-of-order) are ignored.
pub fn check_teleport(
    previous: &PositionObservation,
    current: &PositionObservation,
    cfg: &IntegrityConfig,
) -> Option<Alert> {
    let dt_secs =
        (current.observed_at() - previous.observed_at()).num_milliseconds() as f64 / 1000.0;
    if dt_secs <= 0.0 || dt_secs >= cfg.teleport_window_secs {
        return None;
    }
    let jump_nm = distance_nm(previous.point(), current.point());
    if jump_nm <= cfg.teleport_nm {
        return None;
    }
    let minutes = dt_secs / 60.0;

    Some(Finding {
        vessel_id: current.vessel_id(),
        kind: AlertKind::Teleport,
        severity: Severity::High,
        details: format!("jumped {:.1}nm in {:.1}min", jump_nm, minutes),
        data: json!({
            "distanceNm": jump_nm,
            "elapsedSecs": dt_secs,
            "from": { "latitude": previous.latitude(), "longitude": previous.longitude() },
            "to": { "latitude": current.latitude(), "longitude": current.longitude() },
        }),
        detected_at: current.observed_at(),
    })
}

/// Everything the detector may look at for one new observation.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityInput<'a> {
    pub observation: &'a PositionObservation,
    /// Same-source snapshot the observation replaced.
    pub previous: Option<&'a PositionObservation>,
    /// Latest snapshot from the other source, present once fused.
    pub counterpart: Option<&'a PositionObservation>,
    pub ship_type: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityDetector {
    cfg: IntegrityConfig,
}

impl IntegrityDetector {
    pub fn new(cfg: IntegrityConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &IntegrityConfig {
        &self.cfg
    }

    /// Runs every applicable check; any subset may fire.
    pub fn evaluate(&self, input: IntegrityInput<'_>) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if let Some(other) = input.counterpart {
            alerts.extend(check_position_mismatch(input.observation, other, &self.cfg));
        }
        alerts.extend(check_speed_anomaly(input.observation, input.ship_type, &self.cfg));
        if let Some(prev) = input.previous {
            alerts.extend(check_teleport(prev, input.observation, &self.cfg));
        }
        alerts
    }
}
