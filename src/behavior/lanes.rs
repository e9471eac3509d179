//! Named corridors and sensitive zones, and the checks run against them.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::geo::{bearing_delta, point_in_polygon, BoundingBox, LatLon};
use crate::model::{Deviation, DeviationKind, Finding, Severity, VesselId};

/// Rectangular traffic lane with an expected direction of travel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Corridor {
    pub id: String,
    pub name: String,
    pub bounds: BoundingBox,
    pub heading_deg: f64,
    pub tolerance_deg: f64,
    pub max_speed_kn: f64,
    /// Carried for display; not checked.
    pub min_speed_kn: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneKind {
    Protection,
    WindFarm,
    Restricted,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitiveZone {
    pub id: String,
    pub name: String,
    pub kind: ZoneKind,
    pub polygon: Vec<LatLon>,
    /// Recorded alongside findings; does not gate them.
    pub max_duration_minutes: f64,
}

impl SensitiveZone {
    pub fn contains(&self, p: LatLon) -> bool {
        point_in_polygon(p, &self.polygon)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofences {
    pub corridors: Vec<Corridor>,
    pub zones: Vec<SensitiveZone>,
}

fn rect(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Vec<LatLon> {
    BoundingBox {
        min_lat,
        min_lon,
        max_lat,
        max_lon,
    }
    .corners()
}

impl Default for Geofences {
    fn default() -> Self {
        Self {
            corridors: vec![Corridor {
                id: "lane-1".into(),
                name: "Strait of Juan de Fuca (Eastbound)".into(),
                bounds: BoundingBox {
                    min_lat: 48.2,
                    min_lon: -124.5,
                    max_lat: 48.4,
                    max_lon: -123.0,
                },
                heading_deg: 90.0,
                tolerance_deg: 60.0,
                max_speed_kn: 25.0,
                min_speed_kn: 5.0,
            }],
            zones: vec![
                SensitiveZone {
                    id: "zone-sensitive-1".into(),
                    name: "San Juan Islands Protection Zone".into(),
                    kind: ZoneKind::Protection,
                    polygon: rect(48.4, -123.2, 48.7, -122.8),
                    max_duration_minutes: 10.0,
                },
                SensitiveZone {
                    id: "zone-nordsee-ost".into(),
                    name: "Nordsee Ost Wind Farm".into(),
                    kind: ZoneKind::WindFarm,
                    polygon: rect(54.40, 7.65, 54.48, 7.75),
                    max_duration_minutes: 10.0,
                },
                SensitiveZone {
                    id: "zone-military-exclusion".into(),
                    name: "Military Exclusion Area".into(),
                    kind: ZoneKind::Restricted,
                    polygon: rect(54.0, 7.0, 54.2, 7.2),
                    max_duration_minutes: 0.0,
                },
                SensitiveZone {
                    id: "zone-heligoland-approach".into(),
                    name: "Heligoland Approach".into(),
                    kind: ZoneKind::Warning,
                    polygon: rect(54.1, 7.8, 54.25, 8.0),
                    max_duration_minutes: 30.0,
                },
            ],
        }
    }
}

impl Geofences {
    /// First zone containing `p`, in declaration order.
    pub fn zone_at(&self, p: LatLon) -> Option<&SensitiveZone> {
        self.zones.iter().find(|z| z.contains(p))
    }
}

/// Course and speed findings for one corridor. Empty when outside it.
pub fn check_corridor(
    corridor: &Corridor,
    vessel_id: VesselId,
    position: LatLon,
    speed_kn: Option<f64>,
    course_deg: Option<f64>,
    at: chrono::DateTime<chrono::Utc>,
) -> Vec<Deviation> {
    let mut out = Vec::new();
    if !corridor.bounds.contains(position) {
        return out;
    }

    if let Some(course) = course_deg {
        let off = bearing_delta(course, corridor.heading_deg);
        if off > corridor.tolerance_deg {
            out.push(Finding {
                vessel_id,
                kind: DeviationKind::CourseMismatch,
                severity: Severity::Medium,
                details: format!(
                    "moving {:.0}° in {} (expected ~{:.0}°)",
                    course, corridor.name, corridor.heading_deg
                ),
                data: json!({
                    "corridor": corridor.id,
                    "expected": corridor.heading_deg,
                    "actual": course,
                }),
                detected_at: at,
            });
        }
    }

    if let Some(speed) = speed_kn {
        if speed > corridor.max_speed_kn {
            out.push(Finding {
                vessel_id,
                kind: DeviationKind::SpeedAnomaly,
                severity: Severity::Medium,
                details: format!(
                    "speed {:.1}kn exceeds max {:.0}kn in {}",
                    speed, corridor.max_speed_kn, corridor.name
                ),
                data: json!({
                    "corridor": corridor.id,
                    "max": corridor.max_speed_kn,
                    "actual": speed,
                }),
                detected_at: at,
            });
        }
    }
    out
}

/// Slow-in-zone finding. Fires on every qualifying observation; the
/// zone's max duration is reported but never consulted.
pub fn check_zone_loitering(
    zone: &SensitiveZone,
    vessel_id: VesselId,
    position: LatLon,
    speed_kn: Option<f64>,
    threshold_kn: f64,
    stationary_minutes: Option<f64>,
    at: chrono::DateTime<chrono::Utc>,
) -> Option<Deviation> {
    let speed = speed_kn?;
    if speed >= threshold_kn || !zone.contains(position) {
        return None;
    }
    Some(Finding {
        vessel_id,
        kind: DeviationKind::Loitering,
        severity: Severity::High,
        details: format!("loitering in {}", zone.name),
        data: json!({
            "zone": zone.id,
            "zoneKind": zone.kind,
            "speed": speed,
            "durationMinutes": stationary_minutes,
            "maxDurationMinutes": zone.max_duration_minutes,
        }),
        detected_at: at,
    })
}
