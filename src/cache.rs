//! Last-known device state cache
//!
//! Written only by the command dispatcher and the background refresher;
//! everyone else reads. Readers always get a cloned snapshot, never a
//! partially written one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::model::DeviceSnapshot;

struct CachedState {
    snapshot: DeviceSnapshot,
    cached_at: Instant,
}

/// Shared cache of last-known device snapshots
#[derive(Default)]
pub struct DeviceStateCache {
    inner: RwLock<HashMap<String, CachedState>>,
}

impl DeviceStateCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a snapshot as the device's last-known state
    pub async fn insert(&self, snapshot: DeviceSnapshot) {
        let mut inner = self.inner.write().await;
        inner.insert(
            snapshot.device_id.clone(),
            CachedState {
                snapshot,
                cached_at: Instant::now(),
            },
        );
    }

    /// Last-known snapshot regardless of age
    pub async fn get(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let inner = self.inner.read().await;
        inner.get(device_id).map(|c| c.snapshot.clone())
    }

    /// Snapshot only if cached within `ttl`
    ///
    /// The short-circuit idempotency path and `get_status` use this to
    /// decide whether the cache can stand in for a vendor round-trip.
    pub async fn get_fresh(&self, device_id: &str, ttl: Duration) -> Option<DeviceSnapshot> {
        let inner = self.inner.read().await;
        inner
            .get(device_id)
            .filter(|c| c.cached_at.elapsed() <= ttl)
            .map(|c| c.snapshot.clone())
    }

    /// Drop a device's cached state
    pub async fn evict(&self, device_id: &str) {
        self.inner.write().await.remove(device_id);
    }

    /// Number of cached devices
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether anything is cached
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LockState;

    #[tokio::test]
    async fn insert_and_get() {
        let cache = DeviceStateCache::new();
        assert!(cache.get("d1").await.is_none());

        cache
            .insert(DeviceSnapshot::observed_now("d1", LockState::Locked))
            .await;
        let snap = cache.get("d1").await.unwrap();
        assert_eq!(snap.state, LockState::Locked);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn freshness_window_expires() {
        let cache = DeviceStateCache::new();
        cache
            .insert(DeviceSnapshot::observed_now("d1", LockState::Locked))
            .await;

        assert!(cache.get_fresh("d1", Duration::from_secs(60)).await.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get_fresh("d1", Duration::from_millis(5)).await.is_none());
        // Stale entries still serve unbounded reads
        assert!(cache.get("d1").await.is_some());
    }

    #[tokio::test]
    async fn newer_snapshot_replaces_older() {
        let cache = DeviceStateCache::new();
        cache
            .insert(DeviceSnapshot::observed_now("d1", LockState::Locked))
            .await;
        cache
            .insert(DeviceSnapshot::observed_now("d1", LockState::Unlocked))
            .await;

        assert_eq!(cache.get("d1").await.unwrap().state, LockState::Unlocked);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn evict_removes_entry() {
        let cache = DeviceStateCache::new();
        cache
            .insert(DeviceSnapshot::observed_now("d1", LockState::Locked))
            .await;
        cache.evict("d1").await;
        assert!(cache.is_empty().await);
    }
}
