//! Read-only lookup of previously known vessel identities.

use std::collections::HashMap;

use crate::model::{IdentityObservation, VesselId};

/// Must answer from memory; it is called on the hot path.
pub trait VesselRegistry: Send + Sync {
    fn lookup(&self, vessel_id: VesselId) -> Option<IdentityObservation>;

    fn ship_type(&self, vessel_id: VesselId) -> Option<String> {
        self.lookup(vessel_id).and_then(|i| i.ship_type)
    }
}

/// Snapshot loaded once (from storage or fixtures) and never refreshed.
#[derive(Debug, Default, Clone)]
pub struct StaticRegistry {
    entries: HashMap<VesselId, IdentityObservation>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: IdentityObservation) {
        self.entries
            .entry(identity.vessel_id)
            .or_insert_with(|| IdentityObservation::new(identity.vessel_id))
            .merge(&identity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<IdentityObservation> for StaticRegistry {
    fn from_iter<I: IntoIterator<Item = IdentityObservation>>(iter: I) -> Self {
        let mut reg = StaticRegistry::new();
        for identity in iter {
            reg.insert(identity);
        }
        reg
    }
}

impl VesselRegistry for StaticRegistry {
    fn lookup(&self, vessel_id: VesselId) -> Option<IdentityObservation> {
        self.entries.get(&vessel_id).cloned()
    }
}
