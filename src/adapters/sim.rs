//! Simulated vendor adapter
//!
//! In-process vendor with scriptable failures and timing, used by the demo
//! seed flow and the integration tests. Tracks whether two `execute` calls
//! for the same device ever overlapped, which the dispatcher's per-device
//! serialization must prevent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::DeviceAdapter;
use crate::error::AdapterError;
use crate::model::{DeviceCommand, DeviceSnapshot, LockState};

/// Simulated device record
#[derive(Debug, Clone)]
struct SimDevice {
    state: LockState,
    battery_level: Option<u8>,
}

/// In-process vendor adapter for demos and tests
pub struct SimAdapter {
    vendor: String,
    devices: RwLock<HashMap<String, SimDevice>>,
    /// Failures consumed by upcoming `execute` calls, in order
    fail_queue: Mutex<VecDeque<AdapterError>>,
    execute_delay: Mutex<Duration>,
    executions: Mutex<Vec<(String, DeviceCommand)>>,
    in_flight: Mutex<HashSet<String>>,
    overlap: AtomicBool,
    init_calls: AtomicU32,
}

impl SimAdapter {
    /// Create a simulated vendor
    #[must_use]
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            devices: RwLock::new(HashMap::new()),
            fail_queue: Mutex::new(VecDeque::new()),
            execute_delay: Mutex::new(Duration::ZERO),
            executions: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
            init_calls: AtomicU32::new(0),
        }
    }

    /// Add a device with an initial state
    pub async fn add_device(&self, device_id: impl Into<String>, state: LockState) {
        self.devices.write().await.insert(
            device_id.into(),
            SimDevice {
                state,
                battery_level: Some(100),
            },
        );
    }

    /// Force a device state (out-of-band change, e.g. a manual thumb turn)
    pub async fn set_state(&self, device_id: &str, state: LockState) {
        if let Some(device) = self.devices.write().await.get_mut(device_id) {
            device.state = state;
        }
    }

    /// Queue a failure for the next `execute` call
    pub fn inject_failure(&self, error: AdapterError) {
        self.fail_queue.lock().unwrap().push_back(error);
    }

    /// Make every `execute` take this long (for contention tests)
    pub fn set_execute_delay(&self, delay: Duration) {
        *self.execute_delay.lock().unwrap() = delay;
    }

    /// Commands executed so far, in completion order
    #[must_use]
    pub fn executed(&self) -> Vec<(String, DeviceCommand)> {
        self.executions.lock().unwrap().clone()
    }

    /// Number of `execute` calls that ran to completion
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    /// Whether two `execute` calls for one device ever ran concurrently
    #[must_use]
    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    /// How many times `initialize` has been called
    #[must_use]
    pub fn init_count(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    fn snapshot(device_id: &str, device: &SimDevice) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: device_id.to_string(),
            state: device.state,
            battery_level: device.battery_level,
            observed_at: chrono::Utc::now(),
        }
    }
}

#[async_trait]
impl DeviceAdapter for SimAdapter {
    fn vendor(&self) -> &str {
        &self.vendor
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_devices(&self) -> Result<Vec<DeviceSnapshot>, AdapterError> {
        let devices = self.devices.read().await;
        Ok(devices
            .iter()
            .map(|(id, device)| Self::snapshot(id, device))
            .collect())
    }

    async fn get_status(&self, device_id: &str) -> Result<DeviceSnapshot, AdapterError> {
        let devices = self.devices.read().await;
        devices
            .get(device_id)
            .map(|device| Self::snapshot(device_id, device))
            .ok_or(AdapterError::Rejected {
                vendor_reason: format!("unknown device '{device_id}'"),
            })
    }

    async fn execute(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<DeviceSnapshot, AdapterError> {
        if let Some(error) = self.fail_queue.lock().unwrap().pop_front() {
            return Err(error);
        }

        // Detect overlapping executions per device
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(device_id.to_string()) {
                self.overlap.store(true, Ordering::SeqCst);
            }
        }

        let delay = *self.execute_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(device_id) {
                Some(device) => {
                    match &command {
                        DeviceCommand::Lock => device.state = LockState::Locked,
                        DeviceCommand::Unlock => device.state = LockState::Unlocked,
                        DeviceCommand::ApplySettings(_) => {}
                    }
                    Ok(Self::snapshot(device_id, device))
                }
                None => Err(AdapterError::Rejected {
                    vendor_reason: format!("unknown device '{device_id}'"),
                }),
            }
        };

        self.in_flight.lock().unwrap().remove(device_id);
        if result.is_ok() {
            self.executions
                .lock()
                .unwrap()
                .push((device_id.to_string(), command));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_and_unlock_flip_state() {
        let sim = SimAdapter::new("sim");
        sim.add_device("d1", LockState::Unlocked).await;

        let snap = sim.execute("d1", DeviceCommand::Lock).await.unwrap();
        assert_eq!(snap.state, LockState::Locked);

        let snap = sim.execute("d1", DeviceCommand::Unlock).await.unwrap();
        assert_eq!(snap.state, LockState::Unlocked);
        assert_eq!(sim.execution_count(), 2);
    }

    #[tokio::test]
    async fn injected_failures_surface_in_order() {
        let sim = SimAdapter::new("sim");
        sim.add_device("d1", LockState::Locked).await;
        sim.inject_failure(AdapterError::DeviceUnreachable);

        assert!(matches!(
            sim.execute("d1", DeviceCommand::Lock).await,
            Err(AdapterError::DeviceUnreachable)
        ));
        // Queue drained; next call succeeds
        assert!(sim.execute("d1", DeviceCommand::Lock).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_device_is_rejected() {
        let sim = SimAdapter::new("sim");
        assert!(matches!(
            sim.execute("ghost", DeviceCommand::Lock).await,
            Err(AdapterError::Rejected { .. })
        ));
        assert!(matches!(
            sim.get_status("ghost").await,
            Err(AdapterError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn discovery_lists_all_devices() {
        let sim = SimAdapter::new("sim");
        sim.add_device("d1", LockState::Locked).await;
        sim.add_device("d2", LockState::Unlocked).await;

        let found = sim.fetch_devices().await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn initialize_is_idempotent_and_counted() {
        let sim = SimAdapter::new("sim");
        sim.initialize().await.unwrap();
        sim.initialize().await.unwrap();
        assert_eq!(sim.init_count(), 2);
    }
}
