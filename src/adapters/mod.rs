//! Vendor device adapters
//!
//! Each vendor integration implements the `DeviceAdapter` trait to provide
//! a uniform capability surface: discovery, status reads, and command
//! execution. Mapping vendor wire errors into [`AdapterError`] is the only
//! vendor-specific logic exposed upward.

mod cloud;
pub mod retry;
mod sim;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::AdapterError;
use crate::model::{DeviceCommand, DeviceSnapshot};
use crate::{Error, Result};

pub use cloud::CloudLockAdapter;
pub use retry::RetryPolicy;
pub use sim::SimAdapter;

/// Opaque credential source consumed by adapters
///
/// Refresh mechanics (OAuth and friends) live behind this seam; adapters
/// only ask for the current secret or a forced refresh.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current credential for a vendor
    async fn credential(&self, vendor: &str) -> Result<SecretString>;

    /// Force-refresh and return the new credential
    async fn refresh(&self, vendor: &str) -> Result<SecretString>;
}

/// Credentials sourced from `LATCH_VENDOR_<NAME>_TOKEN` environment
/// variables
///
/// Refresh re-reads the variable, which covers rotated-on-disk setups.
pub struct EnvCredentials;

impl EnvCredentials {
    fn var_name(vendor: &str) -> String {
        format!(
            "LATCH_VENDOR_{}_TOKEN",
            vendor.to_uppercase().replace('-', "_")
        )
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn credential(&self, vendor: &str) -> Result<SecretString> {
        let name = Self::var_name(vendor);
        std::env::var(&name)
            .map(SecretString::from)
            .map_err(|_| Error::Credential(format!("missing env var {name}")))
    }

    async fn refresh(&self, vendor: &str) -> Result<SecretString> {
        self.credential(vendor).await
    }
}

/// Trait for vendor device adapters
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Vendor key this adapter serves (matches `Device::vendor`)
    fn vendor(&self) -> &str;

    /// Establish credentials/session; idempotent, safe to call repeatedly
    async fn initialize(&self) -> std::result::Result<(), AdapterError>;

    /// Full discovery; used for reconciliation, never per-command
    async fn fetch_devices(&self) -> std::result::Result<Vec<DeviceSnapshot>, AdapterError>;

    /// Observed state of one device
    async fn get_status(&self, device_id: &str)
    -> std::result::Result<DeviceSnapshot, AdapterError>;

    /// Send one state-changing command and return the resulting observed
    /// state (not merely an acknowledgement)
    async fn execute(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> std::result::Result<DeviceSnapshot, AdapterError>;
}

/// Adapter registry keyed by vendor, populated at startup from
/// configuration and resolved by lookup
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn DeviceAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its vendor key
    pub fn register(&mut self, adapter: Arc<dyn DeviceAdapter>) {
        tracing::info!(vendor = adapter.vendor(), "registered device adapter");
        self.adapters.insert(adapter.vendor().to_string(), adapter);
    }

    /// Resolve the adapter for a vendor
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownVendor`] if nothing is registered for it
    pub fn resolve(&self, vendor: &str) -> Result<Arc<dyn DeviceAdapter>> {
        self.adapters
            .get(vendor)
            .cloned()
            .ok_or_else(|| Error::UnknownVendor(vendor.to_string()))
    }

    /// Registered vendor keys
    #[must_use]
    pub fn vendors(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    /// Initialize every registered adapter
    ///
    /// # Errors
    ///
    /// Returns the first initialization failure
    pub async fn initialize_all(&self) -> std::result::Result<(), AdapterError> {
        for adapter in self.adapters.values() {
            tracing::info!(vendor = adapter.vendor(), "initializing adapter");
            adapter.initialize().await?;
        }
        Ok(())
    }
}
