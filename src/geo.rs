//! Great-circle helpers shared by fusion, integrity and behavior checks.

use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const METERS_PER_NM: f64 = 1852.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Axis-aligned lat/lon rectangle, edges inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, p: LatLon) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }

    pub fn corners(&self) -> Vec<LatLon> {
        vec![
            LatLon::new(self.min_lat, self.min_lon),
            LatLon::new(self.min_lat, self.max_lon),
            LatLon::new(self.max_lat, self.max_lon),
            LatLon::new(self.max_lat, self.min_lon),
        ]
    }
}

/// Ray-casting test; points exactly on an edge may fall either way.
pub fn point_in_polygon(p: LatLon, ring: &[LatLon]) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        if (a.lat > p.lat) != (b.lat > p.lat) {
            let cross_lon = (b.lon - a.lon) * (p.lat - a.lat) / (b.lat - a.lat) + a.lon;
            if p.lon < cross_lon {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Haversine distance in meters.
pub fn distance_meters(a: LatLon, b: LatLon) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (b.lon - a.lon).to_radians();

    let sin_lat = (d_lat / 2.0).sin();
    let sin_lon = (d_lon / 2.0).sin();
    let h = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lon * sin_lon;
    // h can drift a hair above 1.0 for antipodal points
    let h = h.clamp(0.0, 1.0);

    EARTH_RADIUS_M * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

pub fn distance_nm(a: LatLon, b: LatLon) -> f64 {
    distance_meters(a, b) / METERS_PER_NM
}

/// Smallest angular difference between two bearings, in [0, 180].
pub fn bearing_delta(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// Bearing folded into [0, 360).
pub fn normalize_bearing(deg: f64) -> f64 {
    deg.rem_euclid(360.0)
}

/// Point displaced by `distance_nm` along `bearing_deg`, flat-earth
/// approximation good enough for a few seconds of travel.
pub fn dead_reckon(from: LatLon, bearing_deg: f64, distance_nm: f64) -> LatLon {
    let bearing = bearing_deg.to_radians();
    let d_lat = distance_nm / 60.0 * bearing.cos();
    let cos_lat = from.lat.to_radians().cos().max(1e-6);
    let d_lon = distance_nm / 60.0 * bearing.sin() / cos_lat;
    LatLon::new(from.lat + d_lat, from.lon + d_lon)
}
