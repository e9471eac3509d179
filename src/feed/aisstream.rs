//! AISStream JSON envelopes and the websocket transport that carries them.

use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{FeedConnector, FeedSession};
use crate::model::{IdentityObservation, Observation, ObservationError, PositionObservation, Source};

pub const DEFAULT_URL: &str = "wss://stream.aisstream.io/v0/stream";

pub const POSITION_TYPES: [&str; 2] = ["PositionReport", "StandardClassBPositionReport"];
pub const IDENTITY_TYPES: [&str; 2] = ["ShipStaticData", "StaticDataReport"];

/// AIS "not available" encodings.
const SOG_NOT_AVAILABLE: f64 = 102.3;
const COG_NOT_AVAILABLE: f64 = 360.0;
const HEADING_NOT_AVAILABLE: f64 = 511.0;

#[derive(Debug, Serialize)]
pub struct Subscription<'a> {
    #[serde(rename = "Apikey")]
    pub api_key: &'a str,
    #[serde(rename = "BoundingBoxes")]
    pub bounding_boxes: [[[f64; 2]; 2]; 1],
    #[serde(rename = "FilterMessageTypes")]
    pub filter_message_types: Vec<&'static str>,
}

/// Whole world, position and identity classes only.
pub fn subscription_message(api_key: &str) -> Result<String> {
    let sub = Subscription {
        api_key,
        bounding_boxes: [[[-90.0, -180.0], [90.0, 180.0]]],
        filter_message_types: POSITION_TYPES.iter().chain(IDENTITY_TYPES.iter()).copied().collect(),
    };
    serde_json::to_string(&sub).context("encoding subscription")
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "MessageType")]
    message_type: String,
    #[serde(rename = "MetaData", alias = "Metadata", default)]
    meta: Option<MetaData>,
    #[serde(rename = "Message", default)]
    message: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct MetaData {
    #[serde(rename = "MMSI", default)]
    mmsi: Option<u64>,
    #[serde(rename = "ShipName", alias = "VesselName", alias = "Name", default)]
    ship_name: Option<String>,
    #[serde(default)]
    time_utc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PositionReport {
    #[serde(rename = "UserID", default)]
    user_id: u64,
    #[serde(rename = "Latitude")]
    latitude: f64,
    #[serde(rename = "Longitude")]
    longitude: f64,
    #[serde(rename = "Sog", default)]
    sog: Option<f64>,
    #[serde(rename = "Cog", default)]
    cog: Option<f64>,
    #[serde(rename = "TrueHeading", default)]
    true_heading: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct Dimension {
    #[serde(rename = "A", default)]
    a: f64,
    #[serde(rename = "B", default)]
    b: f64,
    #[serde(rename = "C", default)]
    c: f64,
    #[serde(rename = "D", default)]
    d: f64,
}

impl Dimension {
    fn length(&self) -> Option<f64> {
        Some(self.a + self.b).filter(|v| *v > 0.0)
    }

    fn width(&self) -> Option<f64> {
        Some(self.c + self.d).filter(|v| *v > 0.0)
    }
}

#[derive(Debug, Deserialize)]
struct ShipStaticData {
    #[serde(rename = "UserID", default)]
    user_id: u64,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "CallSign", default)]
    call_sign: Option<String>,
    #[serde(rename = "ImoNumber", default)]
    imo: Option<u64>,
    #[serde(rename = "Type", default)]
    ship_type: Option<u32>,
    #[serde(rename = "Dimension", default)]
    dimension: Option<Dimension>,
}

#[derive(Debug, Default, Deserialize)]
struct ReportA {
    #[serde(rename = "Valid", default)]
    valid: bool,
    #[serde(rename = "Name", default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReportB {
    #[serde(rename = "Valid", default)]
    valid: bool,
    #[serde(rename = "ShipType", default)]
    ship_type: Option<u32>,
    #[serde(rename = "CallSign", default)]
    call_sign: Option<String>,
    #[serde(rename = "Dimension", default)]
    dimension: Option<Dimension>,
}

#[derive(Debug, Deserialize)]
struct StaticDataReport {
    #[serde(rename = "UserID", default)]
    user_id: u64,
    #[serde(rename = "ReportA", default)]
    report_a: ReportA,
    #[serde(rename = "ReportB", default)]
    report_b: ReportB,
}

#[derive(Debug)]
pub enum DecodeError {
    Json(serde_json::Error),
    UnsupportedType(String),
    MissingBody(String),
    MissingVesselId,
    Invalid(ObservationError),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "malformed json: {}", e),
            DecodeError::UnsupportedType(t) => write!(f, "unsupported message type {}", t),
            DecodeError::MissingBody(t) => write!(f, "missing {} body", t),
            DecodeError::MissingVesselId => write!(f, "missing vessel id"),
            DecodeError::Invalid(e) => write!(f, "invalid observation: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl DecodeError {
    /// Short machine-friendly reason for logs and counters.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Json(_) => "malformed",
            DecodeError::UnsupportedType(_) => "unsupported_type",
            DecodeError::MissingBody(_) => "missing_body",
            DecodeError::MissingVesselId => "missing_mmsi",
            DecodeError::Invalid(_) => "invalid_coordinates",
        }
    }
}

/// Descriptive label for an AIS ship-and-cargo type code.
pub fn ship_type_label(code: u32) -> Option<&'static str> {
    let label = match code {
        20..=29 => "Wing in Ground",
        30 => "Fishing",
        31 | 32 => "Towing",
        33 => "Dredging",
        34 => "Diving Ops",
        35 => "Military Ops",
        36 => "Sailing",
        37 => "Pleasure Craft",
        40..=49 => "High Speed Craft",
        50 => "Pilot Vessel",
        51 => "Search and Rescue",
        52 => "Tug",
        53 => "Port Tender",
        55 => "Law Enforcement",
        58 => "Medical Transport",
        60..=69 => "Passenger",
        70..=79 => "Cargo",
        80..=89 => "Tanker",
        90..=99 => "Other",
        _ => return None,
    };
    Some(label)
}

/// AIS text fields are right-padded with `@` or spaces.
fn clean_text(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim_end_matches('@').trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_time_utc(raw: &str) -> Option<DateTime<Utc>> {
    // "2024-05-01 12:00:00.123456789 +0000 UTC"
    let stamp = raw.split(" +").next()?;
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

fn body<T: for<'de> Deserialize<'de>>(
    message: &Option<Map<String, Value>>,
    kind: &str,
) -> Result<T, DecodeError> {
    let raw = message
        .as_ref()
        .and_then(|m| m.get(kind))
        .ok_or_else(|| DecodeError::MissingBody(kind.to_string()))?;
    T::deserialize(raw).map_err(DecodeError::Json)
}

fn pick_id(user_id: u64, meta: &MetaData) -> Result<u64, DecodeError> {
    if user_id != 0 {
        return Ok(user_id);
    }
    meta.mmsi.filter(|v| *v != 0).ok_or(DecodeError::MissingVesselId)
}

/// Decodes one text frame into zero or more observations, all `PRIMARY`.
/// A position report with a ship name in its metadata also yields an
/// identity observation.
pub fn decode_frame(text: &str, received_at: DateTime<Utc>) -> Result<Vec<Observation>, DecodeError> {
    let env: Envelope = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let meta = env.meta.unwrap_or_default();
    let kind = env.message_type.as_str();

    if POSITION_TYPES.contains(&kind) {
        let report: PositionReport = body(&env.message, kind)?;
        let vessel_id = pick_id(report.user_id, &meta)?;
        let observed_at = meta
            .time_utc
            .as_deref()
            .and_then(parse_time_utc)
            .unwrap_or(received_at);

        let sog = report.sog.filter(|v| *v >= 0.0 && *v < SOG_NOT_AVAILABLE);
        let cog = report.cog.filter(|v| *v >= 0.0 && *v < COG_NOT_AVAILABLE);
        let heading = report
            .true_heading
            .filter(|v| *v >= 0.0 && *v < 360.0 && *v != HEADING_NOT_AVAILABLE);

        let position = PositionObservation::new(
            vessel_id,
            report.latitude,
            report.longitude,
            Source::Primary,
            observed_at,
        )
        .map_err(DecodeError::Invalid)?
        .with_speed(sog)
        .with_course(cog.or(heading));

        let mut out = vec![Observation::Position(position)];
        if let Some(name) = clean_text(meta.ship_name) {
            out.push(Observation::Identity(IdentityObservation {
                name: Some(name),
                ..IdentityObservation::new(vessel_id)
            }));
        }
        return Ok(out);
    }

    match kind {
        "ShipStaticData" => {
            let data: ShipStaticData = body(&env.message, kind)?;
            let vessel_id = pick_id(data.user_id, &meta)?;
            let dims = data.dimension.unwrap_or_default();
            let identity = IdentityObservation {
                vessel_id,
                name: clean_text(data.name).or_else(|| clean_text(meta.ship_name)),
                call_sign: clean_text(data.call_sign),
                imo: data.imo.filter(|v| *v != 0),
                ship_type: data.ship_type.and_then(ship_type_label).map(str::to_string),
                length_meters: dims.length(),
                width_meters: dims.width(),
            };
            Ok(vec![Observation::Identity(identity)])
        }
        "StaticDataReport" => {
            let data: StaticDataReport = body(&env.message, kind)?;
            let vessel_id = pick_id(data.user_id, &meta)?;
            let mut identity = IdentityObservation::new(vessel_id);
            if data.report_a.valid {
                identity.name = clean_text(data.report_a.name);
            }
            if data.report_b.valid {
                let dims = data.report_b.dimension.unwrap_or_default();
                identity.call_sign = clean_text(data.report_b.call_sign);
                identity.ship_type = data.report_b.ship_type.and_then(ship_type_label).map(str::to_string);
                identity.length_meters = dims.length();
                identity.width_meters = dims.width();
            }
            if identity.name.is_none() {
                identity.name = clean_text(meta.ship_name);
            }
            if identity.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![Observation::Identity(identity)])
        }
        other => Err(DecodeError::UnsupportedType(other.to_string())),
    }
}

// =============================================================================
// Websocket transport
// =============================================================================

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn FeedSession>> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connecting to {}", self.url))?;
        Ok(Box::new(WsSession { ws }))
    }
}

pub struct WsSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedSession for WsSession {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.ws.send(Message::Text(text)).await.context("websocket send")?;
        Ok(())
    }

    async fn next_text(&mut self) -> Result<Option<String>> {
        while let Some(msg) = self.ws.next().await {
            match msg.context("websocket read")? {
                Message::Text(text) => return Ok(Some(text)),
                // the upstream sends JSON as binary frames
                Message::Binary(bytes) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_subscription_shape() {
        let text = subscription_message("k").unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["Apikey"], "k");
        assert_eq!(v["BoundingBoxes"], serde_json::json!([[[-90.0, -180.0], [90.0, 180.0]]]));
        assert_eq!(v["FilterMessageTypes"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_position_report_with_sentinels() {
        let frame = r#"{
            "MessageType": "PositionReport",
            "MetaData": {"MMSI": 366000001, "ShipName": "SEA LION@@@  ", "time_utc": "2024-05-01 11:59:58.5 +0000 UTC"},
            "Message": {"PositionReport": {"UserID": 366000001, "Latitude": 48.3, "Longitude": -124.0,
                        "Sog": 102.3, "Cog": 360, "TrueHeading": 87}}
        }"#;
        let out = decode_frame(frame, now()).unwrap();
        assert_eq!(out.len(), 2);
        match &out[0] {
            Observation::Position(p) => {
                assert_eq!(p.vessel_id(), 366_000_001);
                assert_eq!(p.source(), Source::Primary);
                assert_eq!(p.speed_over_ground(), None);
                assert_eq!(p.course_or_heading(), Some(87.0));
                assert_eq!(p.observed_at().timestamp(), now().timestamp() - 2);
            }
            other => panic!("expected position, got {:?}", other),
        }
        match &out[1] {
            Observation::Identity(i) => assert_eq!(i.name.as_deref(), Some("SEA LION")),
            other => panic!("expected identity, got {:?}", other),
        }
    }

    #[test]
    fn test_class_b_with_lowercase_metadata_key() {
        let frame = r#"{"MessageType":"StandardClassBPositionReport","Metadata":{"MMSI":211000002},
            "Message":{"StandardClassBPositionReport":{"UserID":0,"Latitude":54.1,"Longitude":7.9,"Sog":4.5,"Cog":120.0,"TrueHeading":511}}}"#;
        let out = decode_frame(frame, now()).unwrap();
        assert_eq!(out.len(), 1);
        let Observation::Position(p) = &out[0] else {
            panic!("expected position")
        };
        assert_eq!(p.vessel_id(), 211_000_002);
        assert_eq!(p.speed_over_ground(), Some(4.5));
        assert_eq!(p.course_or_heading(), Some(120.0));
        assert_eq!(p.observed_at(), now());
    }

    #[test]
    fn test_static_data_dimensions_and_type() {
        let frame = r#"{"MessageType":"ShipStaticData","MetaData":{"MMSI":257000001},
            "Message":{"ShipStaticData":{"UserID":257000001,"Name":"FJORD KATT","CallSign":"LLAB",
            "ImoNumber":9000001,"Type":40,"Dimension":{"A":20,"B":15,"C":5,"D":5}}}}"#;
        let out = decode_frame(frame, now()).unwrap();
        let Observation::Identity(i) = &out[0] else {
            panic!("expected identity")
        };
        assert_eq!(i.ship_type.as_deref(), Some("High Speed Craft"));
        assert_eq!(i.length_meters, Some(35.0));
        assert_eq!(i.width_meters, Some(10.0));
        assert_eq!(i.imo, Some(9_000_001));
    }

    #[test]
    fn test_static_data_report_parts() {
        let frame = r#"{"MessageType":"StaticDataReport","MetaData":{},
            "Message":{"StaticDataReport":{"UserID":3,"ReportA":{"Valid":false,"Name":""},
            "ReportB":{"Valid":true,"ShipType":72,"CallSign":"AB12","Dimension":{"A":0,"B":0,"C":0,"D":0}}}}}"#;
        let out = decode_frame(frame, now()).unwrap();
        let Observation::Identity(i) = &out[0] else {
            panic!("expected identity")
        };
        assert_eq!(i.ship_type.as_deref(), Some("Cargo"));
        assert_eq!(i.call_sign.as_deref(), Some("AB12"));
        assert_eq!(i.length_meters, None);
    }

    #[test]
    fn test_bad_frames_are_errors_not_panics() {
        let cases = [
            ("not json", "malformed"),
            (r#"{"MessageType":"AidsToNavigationReport","Message":{}}"#, "unsupported_type"),
            (r#"{"MessageType":"PositionReport","Message":{}}"#, "missing_body"),
            (
                r#"{"MessageType":"PositionReport","Message":{"PositionReport":{"UserID":1,"Latitude":"x","Longitude":1}}}"#,
                "malformed",
            ),
            (
                r#"{"MessageType":"PositionReport","Message":{"PositionReport":{"UserID":1,"Latitude":91,"Longitude":181}}}"#,
                "invalid_coordinates",
            ),
            (
                r#"{"MessageType":"PositionReport","Message":{"PositionReport":{"Latitude":1,"Longitude":1}}}"#,
                "missing_mmsi",
            ),
        ];
        for (frame, reason) in cases {
            let err = decode_frame(frame, now()).unwrap_err();
            assert_eq!(err.reason(), reason, "{}", frame);
        }
    }

    #[test]
    fn test_ship_type_labels() {
        assert_eq!(ship_type_label(30), Some("Fishing"));
        assert_eq!(ship_type_label(45), Some("High Speed Craft"));
        assert_eq!(ship_type_label(84), Some("Tanker"));
        assert_eq!(ship_type_label(0), None);
    }
}
