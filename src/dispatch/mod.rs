//! Command dispatcher: the single entry point for state-changing device
//! operations
//!
//! Every dispatch runs the same sequence: authorize, execute through the
//! vendor adapter with bounded retries, update the state cache, and append
//! exactly one audit record before returning. Per-device execution is
//! serialized by a keyed gate with a bounded waiter queue; unrelated
//! devices proceed in parallel.

mod locks;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, RetryPolicy, retry};
use crate::authz::{AuthzEngine, Decision, DenialReason, EntityDirectory};
use crate::cache::DeviceStateCache;
use crate::db::AuditRepo;
use crate::error::{AdapterError, DispatchError};
use crate::model::{
    AccessRecord, Device, DeviceCommand, DeviceSnapshot, LockState, Operation, Outcome,
};
use crate::Error;

pub use locks::{DeviceGate, DeviceLocks};

/// What a second dispatch for an in-flight device does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentionMode {
    /// Wait for the in-flight command (preferred for UI-triggered toggles)
    #[default]
    Queue,
    /// Fail immediately with `Busy` (preferred for bulk/automation callers)
    FailFast,
}

/// Dispatcher tuning knobs
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Behavior when a command for the device is already in flight
    pub contention: ContentionMode,
    /// How many callers may queue behind an in-flight command before
    /// further ones are refused with `Busy` (`Queue` mode only)
    pub max_queue_depth: usize,
    /// Backoff policy for retryable adapter failures
    pub retry: RetryPolicy,
    /// Deadline for each individual adapter call
    pub call_deadline: Duration,
    /// Confirm pure state assertions from a fresh cache instead of the
    /// vendor; off by default because vendors are the source of truth
    pub cache_short_circuit: bool,
    /// How fresh a cache entry must be to stand in for the vendor
    pub cache_ttl: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            contention: ContentionMode::Queue,
            max_queue_depth: 8,
            retry: RetryPolicy::default(),
            call_deadline: Duration::from_secs(10),
            cache_short_circuit: false,
            cache_ttl: Duration::from_secs(3),
        }
    }
}

/// Caller-held handle that cancels one in-flight dispatch
pub struct CancelHandle {
    tx: oneshot::Sender<()>,
}

impl CancelHandle {
    /// Request cooperative cancellation
    ///
    /// The dispatch stops at the next suspension point; the audit record
    /// for the partial outcome is still written.
    pub fn cancel(self) {
        let _ = self.tx.send(());
    }
}

/// Token observed by the dispatcher for cooperative cancellation
pub struct CancelToken {
    // `None` once the receiver has completed: a oneshot receiver panics if
    // polled again after completion, and each `select!` arm builds a fresh
    // `cancelled()` future over the same token.
    rx: Option<oneshot::Receiver<()>>,
}

impl CancelToken {
    /// A handle/token pair for one dispatch call
    #[must_use]
    pub fn pair() -> (CancelHandle, Self) {
        let (tx, rx) = oneshot::channel();
        (CancelHandle { tx }, Self { rx: Some(rx) })
    }

    /// A token that never fires
    #[must_use]
    pub fn never() -> Self {
        let (_, rx) = oneshot::channel();
        Self { rx: Some(rx) }
    }

    /// Resolves when cancellation is requested; pends forever otherwise
    ///
    /// A dropped handle means the caller lost interest in cancelling, not
    /// that they cancelled.
    async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.await.is_ok() {
                return;
            }
            self.rx = None;
        }
        std::future::pending::<()>().await;
    }
}

/// The command dispatcher ("lock DAL")
#[derive(Clone)]
pub struct CommandDispatcher {
    entities: Arc<dyn EntityDirectory>,
    engine: AuthzEngine,
    adapters: AdapterRegistry,
    cache: Arc<DeviceStateCache>,
    audit: AuditRepo,
    config: DispatchConfig,
    locks: DeviceLocks,
}

impl CommandDispatcher {
    /// Wire up a dispatcher; all collaborators are injected
    #[must_use]
    pub fn new(
        entities: Arc<dyn EntityDirectory>,
        engine: AuthzEngine,
        adapters: AdapterRegistry,
        cache: Arc<DeviceStateCache>,
        audit: AuditRepo,
        config: DispatchConfig,
    ) -> Self {
        Self {
            entities,
            engine,
            adapters,
            cache,
            audit,
            config,
            locks: DeviceLocks::new(),
        }
    }

    /// Shared state cache handle
    #[must_use]
    pub fn cache(&self) -> Arc<DeviceStateCache> {
        self.cache.clone()
    }

    /// Execute an authorized operation on a device
    ///
    /// Operations without a device command (`ReadStatus`, `Rename`,
    /// `Remove`, `ManageAccess`) are authorized and audited here but
    /// perform no mutation; the corresponding metadata changes are entity
    /// store operations outside the dispatch path.
    ///
    /// # Errors
    ///
    /// See [`DispatchError`]; every terminal outcome has already been
    /// written to the audit log when this returns.
    pub async fn dispatch(
        &self,
        actor_id: &str,
        device_id: &str,
        operation: Operation,
    ) -> Result<DeviceSnapshot, DispatchError> {
        self.dispatch_with_cancel(actor_id, device_id, operation, CancelToken::never())
            .await
    }

    /// [`Self::dispatch`] with a cooperative cancellation token
    ///
    /// # Errors
    ///
    /// See [`DispatchError`]. A cancelled dispatch is recorded as
    /// `GrantedFailure` with reason `cancelled`, never silently dropped.
    pub async fn dispatch_with_cancel(
        &self,
        actor_id: &str,
        device_id: &str,
        operation: Operation,
        mut cancel: CancelToken,
    ) -> Result<DeviceSnapshot, DispatchError> {
        let requested_at = Utc::now();
        let record = |outcome: Outcome, reason: Option<String>| AccessRecord {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            actor_id: actor_id.to_string(),
            operation,
            requested_at,
            outcome,
            denial_reason: reason,
        };

        // Per-device serialization before anything touches the adapter.
        // Queue mode waits behind the in-flight command but refuses once
        // the waiter count hits the configured bound.
        let gate = self.locks.for_device(device_id);
        let acquired = match self.config.contention {
            ContentionMode::Queue => gate.acquire_queued(self.config.max_queue_depth).await,
            ContentionMode::FailFast => gate.try_acquire(),
        };
        let Some(_guard) = acquired else {
            tracing::debug!(device = device_id, actor = actor_id, "dispatch busy");
            self.audit.append(&record(
                Outcome::Denied,
                Some(DenialReason::DeviceBusy.to_string()),
            ))?;
            return Err(DispatchError::Busy);
        };

        // Load the device and authorize; a broken chain is a data problem,
        // not a denial, but it is still audited and never retried
        let device = match self.load_device(device_id) {
            Ok(device) => device,
            Err(e) => {
                let msg = e.to_string();
                self.audit
                    .append(&record(Outcome::Denied, Some(msg.clone())))?;
                return Err(match e {
                    Error::DataIntegrity(m) => DispatchError::DataIntegrity(m),
                    other => DispatchError::Internal(other),
                });
            }
        };

        match self.engine.decide(actor_id, &device, operation) {
            Ok(Decision::Allow) => {}
            Ok(Decision::Deny(reason)) => {
                tracing::info!(
                    device = device_id,
                    actor = actor_id,
                    op = %operation,
                    reason = %reason,
                    "dispatch denied"
                );
                self.audit
                    .append(&record(Outcome::Denied, Some(reason.to_string())))?;
                return Err(DispatchError::NotAuthorized(reason));
            }
            Err(Error::DataIntegrity(msg)) => {
                tracing::error!(device = device_id, error = %msg, "containment chain broken");
                self.audit
                    .append(&record(Outcome::Denied, Some(msg.clone())))?;
                return Err(DispatchError::DataIntegrity(msg));
            }
            Err(e) => {
                self.audit
                    .append(&record(Outcome::Denied, Some(e.to_string())))?;
                return Err(DispatchError::Internal(e));
            }
        }

        // Operations with no device command complete here: an authorized,
        // audited access check; any metadata mutation is the caller's store
        // operation, not ours
        let Some(command) = DeviceCommand::for_operation(operation) else {
            let snapshot = match self.cache.get(device_id).await {
                Some(snapshot) => snapshot,
                None => DeviceSnapshot::observed_now(device_id, LockState::Unknown),
            };
            self.audit.append(&record(Outcome::GrantedSuccess, None))?;
            return Ok(snapshot);
        };

        // Optional idempotency short-circuit: a fresh cache entry already in
        // the asserted state stands in for the vendor round-trip. Still
        // audited like any other dispatch.
        if self.config.cache_short_circuit {
            if let (Some(asserted), Some(cached)) = (
                command.asserted_state(),
                self.cache.get_fresh(device_id, self.config.cache_ttl).await,
            ) {
                if cached.state == asserted {
                    tracing::debug!(device = device_id, "cache-confirmed no-op");
                    self.audit.append(&record(Outcome::GrantedSuccess, None))?;
                    return Ok(cached);
                }
            }
        }

        let adapter = match self.adapters.resolve(&device.vendor) {
            Ok(adapter) => adapter,
            Err(e) => {
                self.audit
                    .append(&record(Outcome::GrantedFailure, Some(e.to_string())))?;
                return Err(DispatchError::Internal(e));
            }
        };

        // Execute with bounded retries; `AuthExpired` gets one transparent
        // re-initialize outside the backoff budget
        let mut attempts: u32 = 0;
        let mut auth_retried = false;
        let last_error: AdapterError;
        loop {
            attempts += 1;
            let outcome = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!(device = device_id, actor = actor_id, "dispatch cancelled");
                    self.audit.append(&record(
                        Outcome::GrantedFailure,
                        Some("cancelled".to_string()),
                    ))?;
                    return Err(DispatchError::Cancelled);
                }
                result = tokio::time::timeout(
                    self.config.call_deadline,
                    adapter.execute(device_id, command.clone()),
                ) => result.unwrap_or(Err(AdapterError::DeviceUnreachable)),
            };

            match outcome {
                Ok(snapshot) => {
                    self.cache.insert(snapshot.clone()).await;
                    self.audit.append(&record(Outcome::GrantedSuccess, None))?;
                    tracing::info!(
                        device = device_id,
                        actor = actor_id,
                        op = %operation,
                        state = snapshot.state.as_str(),
                        "dispatch succeeded"
                    );
                    return Ok(snapshot);
                }
                Err(AdapterError::AuthExpired) if !auth_retried => {
                    auth_retried = true;
                    attempts -= 1;
                    tracing::debug!(vendor = %device.vendor, "credential expired, re-initializing");
                    if let Err(e) = adapter.initialize().await {
                        last_error = e;
                        break;
                    }
                }
                Err(e) => {
                    let backoff = if attempts < self.config.retry.max_attempts {
                        retry::backoff_for(&self.config.retry, attempts - 1, &e)
                    } else {
                        None
                    };
                    let Some(delay) = backoff else {
                        last_error = e;
                        break;
                    };
                    tracing::debug!(
                        device = device_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying adapter call"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            self.audit.append(&record(
                                Outcome::GrantedFailure,
                                Some("cancelled".to_string()),
                            ))?;
                            return Err(DispatchError::Cancelled);
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::warn!(
            device = device_id,
            actor = actor_id,
            attempts,
            error = %last_error,
            "dispatch exhausted adapter retries"
        );
        self.audit.append(&record(
            Outcome::GrantedFailure,
            Some(last_error.to_string()),
        ))?;
        Err(DispatchError::AdapterFailed {
            attempts,
            last_error,
        })
    }

    fn load_device(&self, device_id: &str) -> crate::Result<Device> {
        self.entities
            .device(device_id)?
            .ok_or_else(|| Error::DataIntegrity(format!("device '{device_id}' not found")))
    }
}
