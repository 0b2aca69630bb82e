//! Derived per-device counters over the in-memory event cache.
//!
//! The cache is seeded from the store at startup (newest first) and
//! prepended-to as events arrive, so index 0 is always the latest event.
//! Counters are a cache of a cache: recomputable at any time, refreshed
//! wholesale on `refresh()`, never patched incrementally, and never the
//! source of truth.

use crate::storage::store::CameraEvent;
use chrono::{Duration, Local, NaiveDateTime};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Shared in-memory list of events, newest first.
#[derive(Clone)]
pub struct EventCache {
    inner: Arc<RwLock<Vec<CameraEvent>>>,
}

impl EventCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Replace the cache contents with a store query result (newest first).
    pub fn seed(&self, events: Vec<CameraEvent>) {
        *self.inner.write().unwrap() = events;
    }

    /// Prepend a newly arrived event.
    pub fn prepend(&self, event: CameraEvent) {
        self.inner.write().unwrap().insert(0, event);
    }

    /// Flip the viewed flag on the event with the given identity.
    /// Returns true when a cached event matched.
    pub fn mark_viewed(&self, device_id: &str, timestamp: &str, artifact_ref: &str) -> bool {
        let mut events = self.inner.write().unwrap();
        for e in events.iter_mut() {
            if e.device_id == device_id && e.timestamp == timestamp && e.artifact_ref == artifact_ref
            {
                e.viewed = true;
                return true;
            }
        }
        false
    }

    pub fn snapshot(&self) -> Vec<CameraEvent> {
        self.inner.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached counters for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounts {
    pub unviewed: u64,
    pub last_24h: u64,
}

/// Derived read model: cheap counter lookups for the presentation layer.
#[derive(Clone)]
pub struct ReadModel {
    cache: EventCache,
    counts: Arc<RwLock<HashMap<String, DeviceCounts>>>,
}

impl ReadModel {
    pub fn new(cache: EventCache) -> Self {
        Self {
            cache,
            counts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Recompute all cached counters from the event cache.
    ///
    /// Called by the presentation loop on `RefreshCounts` and once after the
    /// initial cache seed.
    pub fn refresh(&self) {
        self.refresh_at(Local::now().naive_local());
    }

    fn refresh_at(&self, now: NaiveDateTime) {
        let events = self.cache.snapshot();
        let cutoff = now - Duration::hours(24);
        let mut fresh: HashMap<String, DeviceCounts> = HashMap::new();
        for e in &events {
            let entry = fresh.entry(e.device_id.clone()).or_default();
            if !e.viewed {
                entry.unviewed += 1;
            }
            if let Some(t) = parse_timestamp(&e.timestamp) {
                if t >= cutoff {
                    entry.last_24h += 1;
                }
            }
        }
        debug!(devices = fresh.len(), events = events.len(), "counters refreshed");
        *self.counts.write().unwrap() = fresh;
    }

    /// Cached counters for a device; zeros when the device has no events.
    pub fn counts(&self, device_id: &str) -> DeviceCounts {
        self.counts
            .read()
            .unwrap()
            .get(device_id)
            .copied()
            .unwrap_or_default()
    }

    /// Count unviewed events for a device directly from the cache.
    pub fn unviewed_count(&self, device_id: &str) -> u64 {
        self.cache
            .snapshot()
            .iter()
            .filter(|e| e.device_id == device_id && !e.viewed)
            .count() as u64
    }

    /// Count events for a device with a timestamp within `window` of now.
    ///
    /// Malformed timestamps are excluded from the count rather than
    /// causing failure.
    pub fn recent_count(&self, device_id: &str, window: Duration) -> u64 {
        self.recent_count_at(device_id, window, Local::now().naive_local())
    }

    fn recent_count_at(&self, device_id: &str, window: Duration, now: NaiveDateTime) -> u64 {
        let cutoff = now - window;
        self.cache
            .snapshot()
            .iter()
            .filter(|e| e.device_id == device_id)
            .filter_map(|e| parse_timestamp(&e.timestamp))
            .filter(|t| *t >= cutoff)
            .count() as u64
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok()
}
