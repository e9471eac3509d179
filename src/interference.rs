//! Suspected jamming: clusters of vessels that went quiet close together.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::geo::{distance_meters, LatLon};
use crate::model::{Severity, VesselId};

pub const EVENT_TTL_MINUTES: i64 = 10;
pub const CLUSTER_RADIUS_M: f64 = 5000.0;
pub const MIN_CLUSTER_EVENTS: usize = 3;
/// Clusters strictly larger than this are HIGH.
pub const HIGH_SEVERITY_EVENTS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct SignalLoss {
    pub vessel_id: VesselId,
    pub position: LatLon,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterferenceZone {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
    pub severity: Severity,
    pub event_count: usize,
}

#[derive(Debug, Default)]
pub struct SignalLossTracker {
    events: Vec<SignalLoss>,
}

impl SignalLossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let ttl = Duration::minutes(EVENT_TTL_MINUTES);
        self.events.retain(|e| now - e.at <= ttl);
    }

    pub fn report(&mut self, event: SignalLoss, now: DateTime<Utc>) {
        self.expire(now);
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Greedy single pass: each unassigned event seeds a cluster and
    /// absorbs every other unassigned event within the radius of the seed.
    pub fn zones(&mut self, now: DateTime<Utc>) -> Vec<InterferenceZone> {
        self.expire(now);
        let mut taken = vec![false; self.events.len()];
        let mut zones = Vec::new();

        for i in 0..self.events.len() {
            if taken[i] {
                continue;
            }
            taken[i] = true;
            let seed = self.events[i].position;
            let (mut lat_sum, mut lon_sum, mut count) = (seed.lat, seed.lon, 1usize);

            for j in 0..self.events.len() {
                if taken[j] {
                    continue;
                }
                let other = self.events[j].position;
                if distance_meters(seed, other) <= CLUSTER_RADIUS_M {
                    taken[j] = true;
                    lat_sum += other.lat;
                    lon_sum += other.lon;
                    count += 1;
                }
            }

            if count >= MIN_CLUSTER_EVENTS {
                zones.push(InterferenceZone {
                    latitude: lat_sum / count as f64,
                    longitude: lon_sum / count as f64,
                    radius_meters: CLUSTER_RADIUS_M,
                    severity: if count > HIGH_SEVERITY_EVENTS {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    event_count: count,
                });
            }
        }
        zones
    }
}
