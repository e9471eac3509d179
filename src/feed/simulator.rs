//! Synthetic fleet used when no feed credential is configured.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geo::{dead_reckon, normalize_bearing, BoundingBox, LatLon};
use crate::model::{IdentityObservation, PositionObservation, Source, VesselId};

const SHIP_TYPES: [&str; 5] = ["Cargo", "Tanker", "Passenger", "Fishing", "High Speed Craft"];
const NAMES: [&str; 8] = [
    "ORCA", "KESTREL", "NORTHERN LIGHT", "SALISH DAWN", "HARBOR STAR", "TIDE RUNNER", "GREY HERON",
    "CAPE FLATTERY",
];
const HEADING_JITTER_DEG: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub vessels: usize,
    pub tick_ms: u64,
    pub bounds: BoundingBox,
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            vessels: 20,
            tick_ms: 2000,
            bounds: BoundingBox {
                min_lat: 48.1,
                min_lon: -124.6,
                max_lat: 48.8,
                max_lon: -122.7,
            },
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimVessel {
    pub vessel_id: VesselId,
    pub position: LatLon,
    pub heading: f64,
    pub speed_kn: f64,
    pub name: String,
    pub call_sign: String,
    pub ship_type: &'static str,
}

pub struct Fleet {
    vessels: Vec<SimVessel>,
    bounds: BoundingBox,
    rng: StdRng,
}

impl Fleet {
    pub fn new(cfg: &SimConfig) -> Self {
        let mut rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let b = cfg.bounds;
        let vessels = (0..cfg.vessels)
            .map(|i| {
                // roughly one in ten drifts, to exercise loitering checks
                let speed_kn = if rng.gen_bool(0.1) {
                    rng.gen_range(0.0..0.8)
                } else {
                    rng.gen_range(4.0..22.0)
                };
                SimVessel {
                    vessel_id: 200_000_000 + i as u64 * 1000 + rng.gen_range(0..1000),
                    position: LatLon::new(
                        rng.gen_range(b.min_lat..=b.max_lat),
                        rng.gen_range(b.min_lon..=b.max_lon),
                    ),
                    heading: rng.gen_range(0.0..360.0),
                    speed_kn,
                    name: format!("{} {}", NAMES[i % NAMES.len()], i + 1),
                    call_sign: format!("SIM{:03}", i + 1),
                    ship_type: SHIP_TYPES[rng.gen_range(0..SHIP_TYPES.len())],
                }
            })
            .collect();
        Self { vessels, bounds: b, rng }
    }

    pub fn vessels(&self) -> &[SimVessel] {
        &self.vessels
    }

    pub fn identities(&self) -> Vec<IdentityObservation> {
        self.vessels
            .iter()
            .map(|v| IdentityObservation {
                name: Some(v.name.clone()),
                call_sign: Some(v.call_sign.clone()),
                ship_type: Some(v.ship_type.to_string()),
                ..IdentityObservation::new(v.vessel_id)
            })
            .collect()
    }

    /// Advances every vessel by `dt_secs` and reports the new positions.
    pub fn tick(&mut self, dt_secs: f64, at: DateTime<Utc>) -> Vec<PositionObservation> {
        let b = self.bounds;
        let mut out = Vec::with_capacity(self.vessels.len());
        for v in &mut self.vessels {
            v.heading = normalize_bearing(
                v.heading + self.rng.gen_range(-HEADING_JITTER_DEG..=HEADING_JITTER_DEG),
            );
            let next = dead_reckon(v.position, v.heading, v.speed_kn * dt_secs / 3600.0);
            let (position, heading) = reflect(next, v.heading, &b);
            v.position = position;
            v.heading = heading;

            let obs = PositionObservation::new(
                v.vessel_id,
                v.position.lat,
                v.position.lon,
                Source::Primary,
                at,
            );
            // bounds are validated at config load, so this only fails on a bad box
            if let Ok(obs) = obs {
                out.push(obs.with_speed(Some(v.speed_kn)).with_course(Some(v.heading)));
            }
        }
        out
    }
}

/// Keeps a point inside `b`, mirroring the heading off whichever edge it crossed.
fn reflect(p: LatLon, heading: f64, b: &BoundingBox) -> (LatLon, f64) {
    let (mut lat, mut lon, mut heading) = (p.lat, p.lon, heading);
    if lat < b.min_lat || lat > b.max_lat {
        lat = lat.clamp(b.min_lat, b.max_lat);
        heading = normalize_bearing(180.0 - heading);
    }
    if lon < b.min_lon || lon > b.max_lon {
        lon = lon.clamp(b.min_lon, b.max_lon);
        heading = normalize_bearing(360.0 - heading);
    }
    (LatLon::new(lat, lon), heading)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(seed: u64) -> SimConfig {
        SimConfig {
            vessels: 12,
            seed: Some(seed),
            ..SimConfig::default()
        }
    }

    #[test]
    fn test_seeded_fleets_match() {
        let a = Fleet::new(&cfg(7));
        let b = Fleet::new(&cfg(7));
        let ids_a: Vec<_> = a.vessels().iter().map(|v| v.vessel_id).collect();
        let ids_b: Vec<_> = b.vessels().iter().map(|v| v.vessel_id).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.identities().len(), 12);
    }

    #[test]
    fn test_fleet_stays_in_bounds() {
        let c = cfg(42);
        let mut fleet = Fleet::new(&c);
        let now = Utc::now();
        for _ in 0..500 {
            for obs in fleet.tick(600.0, now) {
                assert!(c.bounds.contains(obs.point()), "{:?}", obs.point());
                assert_eq!(obs.source(), Source::Primary);
            }
        }
    }

    #[test]
    fn test_reflect_off_north_edge() {
        let b = SimConfig::default().bounds;
        let (p, h) = reflect(LatLon::new(49.0, -123.0), 10.0, &b);
        assert_eq!(p.lat, b.max_lat);
        assert_eq!(h, 170.0);
    }
}
