//! Generic REST lock vendor adapter
//!
//! Speaks a plain bearer-token JSON API: `GET /devices`, `GET
//! /devices/{id}`, `POST /devices/{id}/commands`. Several residential lock
//! cloud APIs fit this shape with only a base-url change. Vendors that
//! acknowledge a command without reporting the resulting state are wrapped
//! by a single follow-up status poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{CredentialProvider, DeviceAdapter};
use crate::error::AdapterError;
use crate::model::{DeviceCommand, DeviceSnapshot, LockState};

/// Adapter for bearer-token REST lock vendors
pub struct CloudLockAdapter {
    vendor: String,
    base_url: String,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    token: RwLock<Option<SecretString>>,
}

/// Device payload on the vendor wire
#[derive(Debug, Deserialize)]
struct WireDevice {
    id: String,
    state: Option<String>,
    battery: Option<u8>,
}

/// Command response; `state` may be absent for ack-only vendors
#[derive(Debug, Deserialize)]
struct WireCommandResult {
    state: Option<String>,
    battery: Option<u8>,
}

impl CloudLockAdapter {
    /// Create an adapter for one vendor endpoint
    ///
    /// `call_timeout` bounds every HTTP call; an expired deadline surfaces
    /// as [`AdapterError::DeviceUnreachable`].
    #[must_use]
    pub fn new(
        vendor: impl Into<String>,
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        call_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .unwrap_or_default();
        Self {
            vendor: vendor.into(),
            base_url: base_url.into(),
            client,
            credentials,
            token: RwLock::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, AdapterError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.expose_secret().to_string());
        }
        // No session yet; initialize on demand
        self.initialize().await?;
        let guard = self.token.read().await;
        guard
            .as_ref()
            .map(|t| t.expose_secret().to_string())
            .ok_or(AdapterError::AuthExpired)
    }

    /// Refresh the credential once; used for the transparent retry on 401
    async fn refresh_token(&self) -> Result<(), AdapterError> {
        let fresh = self
            .credentials
            .refresh(&self.vendor)
            .await
            .map_err(|_| AdapterError::AuthExpired)?;
        *self.token.write().await = Some(fresh);
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, AdapterError> {
        let mut refreshed = false;
        loop {
            let token = self.bearer().await?;
            let response = self
                .client
                .get(format!("{}{path}", self.base_url))
                .bearer_auth(&token)
                .send()
                .await
                .map_err(classify_transport)?;

            match check_status(&response) {
                Some(AdapterError::AuthExpired) if !refreshed => {
                    self.refresh_token().await?;
                    refreshed = true;
                }
                Some(err) => return Err(err),
                None => return response.json().await.map_err(|_| AdapterError::Malformed),
            }
        }
    }

    async fn post_command(
        &self,
        device_id: &str,
        body: &serde_json::Value,
    ) -> Result<WireCommandResult, AdapterError> {
        let mut refreshed = false;
        loop {
            let token = self.bearer().await?;
            let response = self
                .client
                .post(format!("{}/devices/{device_id}/commands", self.base_url))
                .bearer_auth(&token)
                .json(body)
                .send()
                .await
                .map_err(classify_transport)?;

            match check_status(&response) {
                Some(AdapterError::AuthExpired) if !refreshed => {
                    self.refresh_token().await?;
                    refreshed = true;
                }
                Some(err) => return Err(err),
                None => return response.json().await.map_err(|_| AdapterError::Malformed),
            }
        }
    }
}

#[async_trait]
impl DeviceAdapter for CloudLockAdapter {
    fn vendor(&self) -> &str {
        &self.vendor
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        // Re-resolving an existing credential is harmless, which keeps this
        // idempotent.
        let credential = self
            .credentials
            .credential(&self.vendor)
            .await
            .map_err(|_| AdapterError::AuthExpired)?;
        *self.token.write().await = Some(credential);
        Ok(())
    }

    async fn fetch_devices(&self) -> Result<Vec<DeviceSnapshot>, AdapterError> {
        let devices: Vec<WireDevice> = self.get_json("/devices").await?;
        Ok(devices.into_iter().map(wire_snapshot).collect())
    }

    async fn get_status(&self, device_id: &str) -> Result<DeviceSnapshot, AdapterError> {
        let device: WireDevice = self.get_json(&format!("/devices/{device_id}")).await?;
        Ok(wire_snapshot(device))
    }

    async fn execute(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<DeviceSnapshot, AdapterError> {
        let body = command_body(&command);
        let result = self.post_command(device_id, &body).await?;

        // Ack-only response: poll once so callers always get observed state
        match result.state {
            Some(state) => Ok(DeviceSnapshot {
                device_id: device_id.to_string(),
                state: LockState::parse(&state),
                battery_level: result.battery,
                observed_at: chrono::Utc::now(),
            }),
            None => self.get_status(device_id).await,
        }
    }
}

fn wire_snapshot(device: WireDevice) -> DeviceSnapshot {
    DeviceSnapshot {
        state: device
            .state
            .as_deref()
            .map_or(LockState::Unknown, LockState::parse),
        battery_level: device.battery,
        device_id: device.id,
        observed_at: chrono::Utc::now(),
    }
}

fn command_body(command: &DeviceCommand) -> serde_json::Value {
    match command {
        DeviceCommand::Lock => serde_json::json!({ "command": "lock" }),
        DeviceCommand::Unlock => serde_json::json!({ "command": "unlock" }),
        DeviceCommand::ApplySettings(settings) => {
            serde_json::json!({ "command": "apply_settings", "settings": settings })
        }
    }
}

/// Map transport-level failures into the closed adapter error set
fn classify_transport(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() || err.is_connect() {
        AdapterError::DeviceUnreachable
    } else if err.is_decode() {
        AdapterError::Malformed
    } else {
        AdapterError::DeviceUnreachable
    }
}

/// Map a non-success HTTP status into the closed adapter error set
///
/// Returns `None` for success statuses.
fn check_status(response: &reqwest::Response) -> Option<AdapterError> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    classify_status(status.as_u16(), retry_after)
}

/// Status-code classification, separated for testing
fn classify_status(status: u16, retry_after: Option<Duration>) -> Option<AdapterError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(AdapterError::AuthExpired),
        408 => Some(AdapterError::DeviceUnreachable),
        429 => Some(AdapterError::RateLimited { retry_after }),
        500..=599 => Some(AdapterError::DeviceUnreachable),
        other => Some(AdapterError::Rejected {
            vendor_reason: format!("http {other}"),
        }),
    }
}
