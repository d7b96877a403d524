//! Keyed per-device gates backing dispatch serialization

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Map size at which idle entries are swept before inserting a new one
const PRUNE_THRESHOLD: usize = 512;

/// Serialization gate for one device: an async mutex plus a count of
/// callers currently queued behind the holder
#[derive(Default)]
pub struct DeviceGate {
    lock: tokio::sync::Mutex<()>,
    queued: AtomicUsize,
}

/// Decrements the queued count when the waiter stops waiting, whether it
/// acquired the lock or its future was dropped mid-wait
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DeviceGate {
    /// Take the gate only if no command is in flight
    pub fn try_acquire(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.lock.try_lock().ok()
    }

    /// Wait behind the in-flight command, refusing when `max_queue_depth`
    /// callers are already waiting
    pub async fn acquire_queued(
        &self,
        max_queue_depth: usize,
    ) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if let Ok(guard) = self.lock.try_lock() {
            return Some(guard);
        }

        // Reserve a waiter slot or give up
        let mut waiting = self.queued.load(Ordering::Acquire);
        loop {
            if waiting >= max_queue_depth {
                return None;
            }
            match self.queued.compare_exchange(
                waiting,
                waiting + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => waiting = current,
            }
        }

        let slot = QueueSlot(&self.queued);
        let guard = self.lock.lock().await;
        drop(slot);
        Some(guard)
    }
}

/// One gate per device id, created lazily
///
/// The outer std mutex only guards the map itself and is never held across
/// an await point.
#[derive(Clone, Default)]
pub struct DeviceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<DeviceGate>>>>,
}

impl DeviceLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The gate for a device, inserting it on first use
    ///
    /// Once the map grows past a threshold, entries nobody holds a handle
    /// to are swept out, so gates for deleted devices do not pile up.
    #[must_use]
    pub fn for_device(&self, device_id: &str) -> Arc<DeviceGate> {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if map.len() >= PRUNE_THRESHOLD && !map.contains_key(device_id) {
            map.retain(|_, gate| Arc::strong_count(gate) > 1);
        }
        map.entry(device_id.to_string())
            .or_insert_with(|| Arc::new(DeviceGate::default()))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
