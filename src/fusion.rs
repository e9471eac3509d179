//! Per-vessel two-source position fusion.
//!
//! Each vessel keeps the latest PRIMARY and the latest SECONDARY snapshot.
//! Once both exist, every new observation yields the midpoint of the two
//! snapshots with a confidence that decays linearly with their separation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::geo::distance_meters;
use crate::model::{FusedPosition, PositionObservation, Source, VesselId};

#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Source separation at which confidence reaches zero.
    pub zero_confidence_m: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            zero_confidence_m: 1000.0,
        }
    }
}

impl FusionConfig {
    /// `1 - delta/zero_confidence_m`, clamped to [0, 1]. Non-increasing in `delta_m`.
    pub fn confidence(&self, delta_m: f64) -> f64 {
        if self.zero_confidence_m <= 0.0 {
            return if delta_m <= 0.0 { 1.0 } else { 0.0 };
        }
        (1.0 - delta_m / self.zero_confidence_m).clamp(0.0, 1.0)
    }
}

/// Latest raw snapshot per source for one vessel.
#[derive(Debug, Clone, Default)]
pub struct FusionState {
    pub primary: Option<PositionObservation>,
    pub secondary: Option<PositionObservation>,
}

impl FusionState {
    pub fn get(&self, source: Source) -> Option<&PositionObservation> {
        match source {
            Source::Primary => self.primary.as_ref(),
            Source::Secondary => self.secondary.as_ref(),
        }
    }

    fn slot_mut(&mut self, source: Source) -> &mut Option<PositionObservation> {
        match source {
            Source::Primary => &mut self.primary,
            Source::Secondary => &mut self.secondary,
        }
    }

    fn last_seen(&self) -> Option<DateTime<Utc>> {
        let p = self.primary.as_ref().map(|o| o.observed_at());
        let s = self.secondary.as_ref().map(|o| o.observed_at());
        p.max(s)
    }
}

/// Owns every vessel's `FusionState`. Not shared: one engine per shard.
#[derive(Debug, Default)]
pub struct FusionEngine {
    cfg: FusionConfig,
    states: HashMap<VesselId, FusionState>,
}

impl FusionEngine {
    pub fn new(cfg: FusionConfig) -> Self {
        Self {
            cfg,
            states: HashMap::new(),
        }
    }

    /// Stores `obs` as the latest snapshot for its source (last write wins)
    /// and returns the fused estimate if the other source has reported.
    pub fn observe(&mut self, obs: &PositionObservation) -> Option<FusedPosition> {
        let state = self.states.entry(obs.vessel_id()).or_default();
        *state.slot_mut(obs.source()) = Some(obs.clone());

        let primary = state.primary.as_ref()?;
        let secondary = state.secondary.as_ref()?;

        let delta_m = distance_meters(primary.point(), secondary.point());
        let confidence = self.cfg.confidence(delta_m);
        crate::logging::log_fusion(obs.vessel_id(), confidence, delta_m);

        Some(FusedPosition {
            vessel_id: obs.vessel_id(),
            latitude: (primary.latitude() + secondary.latitude()) / 2.0,
            longitude: (primary.longitude() + secondary.longitude()) / 2.0,
            confidence,
            computed_at: obs.observed_at(),
            contributing_sources: vec![Source::Primary, Source::Secondary],
        })
    }

    pub fn latest(&self, vessel_id: VesselId, source: Source) -> Option<&PositionObservation> {
        self.states.get(&vessel_id).and_then(|s| s.get(source))
    }

    pub fn state(&self, vessel_id: VesselId) -> Option<&FusionState> {
        self.states.get(&vessel_id)
    }

    /// Vessels whose newest snapshot (either source) is older than `cutoff`.
    pub fn stale_vessels(&self, cutoff: DateTime<Utc>) -> Vec<VesselId> {
        self.states
            .iter()
            .filter(|(_, s)| s.last_seen().map_or(true, |t| t < cutoff))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn evict(&mut self, vessel_id: VesselId) -> Option<FusionState> {
        self.states.remove(&vessel_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(id: VesselId, source: Source, lat: f64, lon: f64) -> PositionObservation {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        PositionObservation::new(id, lat, lon, source, at).unwrap()
    }

    #[test]
    fn test_single_source_never_fuses() {
        let mut engine = FusionEngine::default();
        assert!(engine.observe(&obs(1, Source::Primary, 10.0, 10.0)).is_none());
        assert!(engine.observe(&obs(1, Source::Primary, 10.1, 10.0)).is_none());
        // other vessel's secondary does not count
        assert!(engine.observe(&obs(2, Source::Secondary, 10.1, 10.0)).is_none());
        assert!(engine.observe(&obs(1, Source::Primary, 10.2, 10.0)).is_none());
    }

    #[test]
    fn test_midpoint_and_partial_confidence() {
        // 0.01 deg of longitude at 10N is ~1095 m, past the default 1 km zero point
        let mut engine = FusionEngine::new(FusionConfig {
            zero_confidence_m: 2000.0,
        });
        engine.observe(&obs(1, Source::Primary, 10.0, 10.0));
        let fused = engine
            .observe(&obs(1, Source::Secondary, 10.0, 10.01))
            .expect("both sources reported");
        assert_eq!(fused.latitude, 10.0);
        assert!((fused.longitude - 10.005).abs() < 1e-12);
        assert!(fused.confidence > 0.0 && fused.confidence < 1.0, "{}", fused.confidence);
        assert_eq!(fused.contributing_sources, vec![Source::Primary, Source::Secondary]);
    }

    #[test]
    fn test_default_scale_clamps_kilometre_split_to_zero() {
        let mut engine = FusionEngine::default();
        engine.observe(&obs(1, Source::Primary, 10.0, 10.0));
        let fused = engine.observe(&obs(1, Source::Secondary, 10.0, 10.01)).unwrap();
        assert_eq!(fused.confidence, 0.0);

        let fused = engine.observe(&obs(1, Source::Secondary, 10.0, 10.004)).unwrap();
        assert!(fused.confidence > 0.0 && fused.confidence < 1.0);
    }

    #[test]
    fn test_last_write_wins_per_source() {
        let mut engine = FusionEngine::default();
        engine.observe(&obs(1, Source::Secondary, 0.0, 0.0));
        engine.observe(&obs(1, Source::Primary, 1.0, 1.0));
        let fused = engine.observe(&obs(1, Source::Primary, 0.0, 0.0)).unwrap();
        assert_eq!(fused.latitude, 0.0);
        assert_eq!(fused.confidence, 1.0);
        assert_eq!(engine.latest(1, Source::Primary).unwrap().latitude(), 0.0);
    }

    #[test]
    fn test_confidence_clamped_and_monotonic() {
        let cfg = FusionConfig::default();
        assert_eq!(cfg.confidence(0.0), 1.0);
        assert_eq!(cfg.confidence(1000.0), 0.0);
        assert_eq!(cfg.confidence(5000.0), 0.0);
        let mut last = 1.0;
        for d in [10.0, 100.0, 250.0, 500.0, 999.0] {
            let c = cfg.confidence(d);
            assert!(c <= last);
            last = c;
        }
    }

    #[test]
    fn test_evict_forgets_snapshots() {
        let mut engine = FusionEngine::default();
        engine.observe(&obs(1, Source::Primary, 0.0, 0.0));
        assert_eq!(engine.len(), 1);
        assert!(engine.evict(1).is_some());
        assert!(engine.observe(&obs(1, Source::Secondary, 0.0, 0.0)).is_none());
    }
}
