//! Core data types flowing through the pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geo::LatLon;

/// Maritime station identifier. Any non-zero integer is accepted.
pub type VesselId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Primary,
    Secondary,
}

impl Source {
    pub fn other(self) -> Source {
        match self {
            Source::Primary => Source::Secondary,
            Source::Secondary => Source::Primary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Primary => "PRIMARY",
            Source::Secondary => "SECONDARY",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObservationError {
    ZeroVesselId,
    LatitudeOutOfRange(f64),
    LongitudeOutOfRange(f64),
}

impl fmt::Display for ObservationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationError::ZeroVesselId => write!(f, "vessel id must be non-zero"),
            ObservationError::LatitudeOutOfRange(v) => write!(f, "latitude {} outside [-90, 90]", v),
            ObservationError::LongitudeOutOfRange(v) => {
                write!(f, "longitude {} outside [-180, 180]", v)
            }
        }
    }
}

impl std::error::Error for ObservationError {}

/// A single position report. Fields are private so that an instance
/// always holds in-range coordinates; deserialization goes through `new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawPositionObservation")]
pub struct PositionObservation {
    vessel_id: VesselId,
    latitude: f64,
    longitude: f64,
    speed_over_ground: Option<f64>,
    course_or_heading: Option<f64>,
    source: Source,
    observed_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPositionObservation {
    vessel_id: VesselId,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    speed_over_ground: Option<f64>,
    #[serde(default)]
    course_or_heading: Option<f64>,
    source: Source,
    observed_at: DateTime<Utc>,
}

impl TryFrom<RawPositionObservation> for PositionObservation {
    type Error = ObservationError;

    fn try_from(raw: RawPositionObservation) -> Result<Self, Self::Error> {
        Ok(PositionObservation::new(raw.vessel_id, raw.latitude, raw.longitude, raw.source, raw.observed_at)?
            .with_speed(raw.speed_over_ground)
            .with_course(raw.course_or_heading))
    }
}

impl PositionObservation {
    /// Builds an observation, rejecting out-of-range or non-finite
    /// coordinates instead of clamping them.
    pub fn new(
        vessel_id: VesselId,
        latitude: f64,
        longitude: f64,
        source: Source,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, ObservationError> {
        if vessel_id == 0 {
            return Err(ObservationError::ZeroVesselId);
        }
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(ObservationError::LatitudeOutOfRange(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(ObservationError::LongitudeOutOfRange(longitude));
        }
        Ok(Self {
            vessel_id,
            latitude,
            longitude,
            speed_over_ground: None,
            course_or_heading: None,
            source,
            observed_at,
        })
    }

    /// Non-finite speeds are treated as absent.
    pub fn with_speed(mut self, knots: Option<f64>) -> Self {
        self.speed_over_ground = knots.filter(|v| v.is_finite());
        self
    }

    pub fn with_course(mut self, degrees: Option<f64>) -> Self {
        self.course_or_heading = degrees.filter(|v| v.is_finite());
        self
    }

    pub fn vessel_id(&self) -> VesselId {
        self.vessel_id
    }
    pub fn latitude(&self) -> f64 {
        self.latitude
    }
    pub fn longitude(&self) -> f64 {
        self.longitude
    }
    pub fn speed_over_ground(&self) -> Option<f64> {
        self.speed_over_ground
    }
    pub fn course_or_heading(&self) -> Option<f64> {
        self.course_or_heading
    }
    pub fn source(&self) -> Source {
        self.source
    }
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
    pub fn point(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }
}

/// Static identity fields. `None` means "not present in this message";
/// the feed never clears a field, so merging is last-non-null-wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityObservation {
    pub vessel_id: VesselId,
    pub name: Option<String>,
    pub call_sign: Option<String>,
    pub imo: Option<u64>,
    pub ship_type: Option<String>,
    pub length_meters: Option<f64>,
    pub width_meters: Option<f64>,
}

impl IdentityObservation {
    pub fn new(vessel_id: VesselId) -> Self {
        Self {
            vessel_id,
            ..Default::default()
        }
    }

    /// Overlays every present field of `update` onto `self`. Returns
    /// whether any stored value changed.
    pub fn merge(&mut self, update: &IdentityObservation) -> bool {
        fn take<T: Clone + PartialEq>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
            match incoming {
                Some(v) if slot.as_ref() != Some(v) => {
                    *slot = Some(v.clone());
                    true
                }
                _ => false,
            }
        }
        let mut changed = take(&mut self.name, &update.name);
        changed |= take(&mut self.call_sign, &update.call_sign);
        changed |= take(&mut self.imo, &update.imo);
        changed |= take(&mut self.ship_type, &update.ship_type);
        changed |= take(&mut self.length_meters, &update.length_meters);
        changed |= take(&mut self.width_meters, &update.width_meters);
        changed
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.call_sign.is_none()
            && self.imo.is_none()
            && self.ship_type.is_none()
            && self.length_meters.is_none()
            && self.width_meters.is_none()
    }
}

/// What the ingestion side hands to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Position(PositionObservation),
    Identity(IdentityObservation),
}

impl Observation {
    pub fn vessel_id(&self) -> VesselId {
        match self {
            Observation::Position(p) => p.vessel_id(),
            Observation::Identity(i) => i.vessel_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedPosition {
    pub vessel_id: VesselId,
    pub latitude: f64,
    pub longitude: f64,
    pub confidence: f64,
    pub computed_at: DateTime<Utc>,
    pub contributing_sources: Vec<Source>,
}

impl FusedPosition {
    pub fn point(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    PositionMismatch,
    SpeedAnomaly,
    Teleport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviationKind {
    CourseMismatch,
    SpeedAnomaly,
    Loitering,
}

/// Immutable finding. Lifecycle (acknowledgement etc.) lives elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding<K> {
    pub vessel_id: VesselId,
    pub kind: K,
    pub severity: Severity,
    pub details: String,
    /// Machine-readable measurements behind `details`.
    pub data: Value,
    pub detected_at: DateTime<Utc>,
}

pub type Alert = Finding<AlertKind>;
pub type Deviation = Finding<DeviationKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_out_of_range_coordinates() {
        let now = Utc::now();
        assert_eq!(
            PositionObservation::new(1, 91.0, 0.0, Source::Primary, now),
            Err(ObservationError::LatitudeOutOfRange(91.0))
        );
        assert_eq!(
            PositionObservation::new(1, 0.0, -180.5, Source::Primary, now),
            Err(ObservationError::LongitudeOutOfRange(-180.5))
        );
        assert!(PositionObservation::new(1, f64::NAN, 0.0, Source::Primary, now).is_err());
        assert!(PositionObservation::new(0, 0.0, 0.0, Source::Primary, now).is_err());
        assert!(PositionObservation::new(1, -90.0, 180.0, Source::Primary, now).is_ok());
    }

    #[test]
    fn test_identity_merge_last_non_null_wins() {
        let mut known = IdentityObservation {
            vessel_id: 7,
            name: Some("ALPHA".into()),
            ship_type: Some("Cargo".into()),
            ..IdentityObservation::new(7)
        };
        let update = IdentityObservation {
            name: None,
            call_sign: Some("K7AB".into()),
            ship_type: Some("Tanker".into()),
            ..IdentityObservation::new(7)
        };
        assert!(known.merge(&update));
        assert_eq!(known.name.as_deref(), Some("ALPHA"));
        assert_eq!(known.call_sign.as_deref(), Some("K7AB"));
        assert_eq!(known.ship_type.as_deref(), Some("Tanker"));

        // repeating the same report changes nothing
        assert!(!known.merge(&update));
        assert!(!known.merge(&IdentityObservation::new(7)));
    }

    #[test]
    fn test_deserialize_validates_coordinates() {
        let bad = r#"{"vesselId":0,"latitude":500.0,"longitude":-999.0,"speedOverGround":null,
            "courseOrHeading":null,"source":"PRIMARY","observedAt":"2024-05-01T12:00:00Z"}"#;
        assert!(serde_json::from_str::<PositionObservation>(bad).is_err());

        let lat = r#"{"vesselId":5,"latitude":91.0,"longitude":0.0,"source":"PRIMARY","observedAt":"2024-05-01T12:00:00Z"}"#;
        let err = serde_json::from_str::<PositionObservation>(lat).unwrap_err();
        assert!(err.to_string().contains("latitude"), "{}", err);

        let obs = PositionObservation::new(5, 48.3, -124.0, Source::Secondary, Utc::now())
            .unwrap()
            .with_speed(Some(12.0))
            .with_course(Some(90.0));
        let text = serde_json::to_string(&obs).unwrap();
        assert_eq!(serde_json::from_str::<PositionObservation>(&text).unwrap(), obs);
    }

    #[test]
    fn test_non_finite_speed_is_absent() {
        let obs = PositionObservation::new(1, 0.0, 0.0, Source::Primary, Utc::now())
            .unwrap()
            .with_speed(Some(f64::INFINITY))
            .with_course(Some(90.0));
        assert_eq!(obs.speed_over_ground(), None);
        assert_eq!(obs.course_or_heading(), Some(90.0));
    }
}
