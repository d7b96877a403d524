//! Background reconciliation of device state against vendor clouds
//!
//! Periodically asks every registered adapter for its device inventory,
//! refreshes the state cache, and updates online/offline flags in the
//! store. Failures are logged and skipped; the loop itself never dies.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::AdapterRegistry;
use crate::cache::DeviceStateCache;
use crate::db::EntityRepo;

/// Periodic device-state refresher
pub struct StateRefresher {
    adapters: AdapterRegistry,
    cache: Arc<DeviceStateCache>,
    entities: EntityRepo,
    interval: Duration,
}

impl StateRefresher {
    #[must_use]
    pub fn new(
        adapters: AdapterRegistry,
        cache: Arc<DeviceStateCache>,
        entities: EntityRepo,
        interval: Duration,
    ) -> Self {
        Self {
            adapters,
            cache,
            entities,
            interval,
        }
    }

    /// Run the refresh loop until the task is aborted
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.refresh_once().await;
        }
    }

    /// One reconciliation pass, all registered vendors in parallel
    pub async fn refresh_once(&self) {
        let passes = self
            .adapters
            .vendors()
            .into_iter()
            .map(|vendor| self.refresh_vendor(vendor));
        futures::future::join_all(passes).await;
    }

    async fn refresh_vendor(&self, vendor: &str) {
        let Ok(adapter) = self.adapters.resolve(vendor) else {
            return;
        };
        let snapshots = match adapter.fetch_devices().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::warn!(vendor, error = %e, "vendor inventory fetch failed");
                return;
            }
        };

        let mut seen = HashSet::new();
        for snapshot in snapshots {
            seen.insert(snapshot.device_id.clone());
            if let Err(e) = self.entities.set_device_online(&snapshot.device_id, true) {
                tracing::debug!(
                    device = %snapshot.device_id,
                    error = %e,
                    "skipping snapshot for unknown device"
                );
                continue;
            }
            self.cache.insert(snapshot).await;
        }

        // Devices the vendor stopped reporting are marked offline
        match self.entities.devices_for_vendor(vendor) {
            Ok(devices) => {
                for device in devices {
                    if !seen.contains(&device.id) && device.is_online {
                        tracing::info!(device = %device.id, vendor, "device went offline");
                        if let Err(e) = self.entities.set_device_online(&device.id, false) {
                            tracing::warn!(device = %device.id, error = %e, "offline mark failed");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(vendor, error = %e, "device listing failed during refresh");
            }
        }

        tracing::debug!(vendor, devices = seen.len(), "refresh pass complete");
    }
}
