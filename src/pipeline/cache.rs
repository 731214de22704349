use crate::types::RateSnapshot;
use chrono::{DateTime, Utc};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedRates {
    pub snapshot: RateSnapshot,
    pub updated_at: DateTime<Utc>,
}

/// Single slot holding the most recent stored snapshot.
///
/// Written only by [`Broadcaster::publish_latest`](crate::pipeline::broadcast::Broadcaster::publish_latest),
/// which pairs the write with the `ratesUpdate` fan-out.
#[derive(Debug, Default)]
pub struct LatestStateCache {
    slot: RwLock<Option<CachedRates>>,
}

impl LatestStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<CachedRates> {
        self.slot.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn update(&self, snapshot: RateSnapshot) -> CachedRates {
        let cached = CachedRates {
            snapshot,
            updated_at: Utc::now(),
        };
        *self.slot.write().unwrap_or_else(|p| p.into_inner()) = Some(cached.clone());
        cached
    }
}
