//! Latch Gateway - Authorization and command dispatch for smart locks
//!
//! This library provides the core functionality for the Latch gateway:
//! - Hierarchical role-based authorization over a property portfolio
//! - Vendor-agnostic lock adapters with classified failures
//! - Per-device serialized command dispatch with bounded retries
//! - Append-only audit logging of every access decision
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Callers                          │
//! │      CLI  │  Embedding services  │  Automation      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Latch Gateway                        │
//! │   Authz Engine  │  Dispatcher  │  Cache  │  Audit   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Vendor Adapters                        │
//! │   Cloud lock APIs  │  Simulated fleet (testing)     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod adapters;
pub mod authz;
pub mod cache;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod model;
pub mod refresh;

pub use adapters::{AdapterRegistry, CredentialProvider, DeviceAdapter, RetryPolicy};
pub use authz::{AuthzEngine, Decision, DenialReason, EntityDirectory, RoleDirectory};
pub use cache::DeviceStateCache;
pub use config::Config;
pub use db::{DbConn, DbPool};
pub use dispatch::{
    CancelHandle, CancelToken, CommandDispatcher, ContentionMode, DispatchConfig,
};
pub use error::{AdapterError, DispatchError, Error, Result};
pub use gateway::Gateway;
pub use model::{
    AccessRecord, Attachment, Device, DeviceCommand, DeviceKind, DeviceSnapshot, GuestGrant,
    LockState, Operation, Outcome, Portfolio, Property, Role, RoleAssociation, Scope, Unit,
};
pub use refresh::StateRefresher;
