//! Core data model: the ownership hierarchy, roles, operations, and
//! device/audit records
//!
//! The hierarchy is a strict tree (Portfolio → Property → Unit) with
//! devices attached at either the Unit or the Property level. Records
//! here carry no policy logic; all hierarchy semantics live in the
//! authorization engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top level of the ownership hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: String,
    pub name: String,
}

/// A property inside a portfolio; may host common-area devices directly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub name: String,
    pub portfolio_id: String,
}

/// A rentable unit inside a property
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub name: String,
    pub property_id: String,
}

/// Where a device hangs off the hierarchy
///
/// Exactly one of the two: a unit device or a common-area property device,
/// never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attachment {
    /// Attached to a unit
    Unit(String),
    /// Attached directly to a property (common area)
    Property(String),
}

impl Attachment {
    /// Unit id, if unit-attached
    #[must_use]
    pub fn unit_id(&self) -> Option<&str> {
        match self {
            Self::Unit(id) => Some(id),
            Self::Property(_) => None,
        }
    }

    /// Property id, if directly property-attached
    #[must_use]
    pub fn property_id(&self) -> Option<&str> {
        match self {
            Self::Property(id) => Some(id),
            Self::Unit(_) => None,
        }
    }
}

/// Device category tag; kind-specific behavior lives in free functions,
/// not a class hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Lock,
    Thermostat,
    Light,
    Sensor,
}

impl DeviceKind {
    /// Stable string form used in storage and config
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Thermostat => "thermostat",
            Self::Light => "light",
            Self::Sensor => "sensor",
        }
    }

    /// Parse from the stable string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lock" => Some(Self::Lock),
            "thermostat" => Some(Self::Thermostat),
            "light" => Some(Self::Light),
            "sensor" => Some(Self::Sensor),
            _ => None,
        }
    }
}

/// A controllable device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Vendor key used to resolve the adapter in the registry
    pub vendor: String,
    pub kind: DeviceKind,
    pub attachment: Attachment,
    pub is_online: bool,
    pub remote_operation_enabled: bool,
}

/// Roles grantable on hierarchy entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    PortfolioAdmin,
    PropertyManager,
    Tenant,
    Guest,
}

impl Role {
    /// Stable string form used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::PortfolioAdmin => "portfolio_admin",
            Self::PropertyManager => "property_manager",
            Self::Tenant => "tenant",
            Self::Guest => "guest",
        }
    }

    /// Parse from the stable string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "portfolio_admin" => Some(Self::PortfolioAdmin),
            "property_manager" => Some(Self::PropertyManager),
            "tenant" => Some(Self::Tenant),
            "guest" => Some(Self::Guest),
            _ => None,
        }
    }
}

/// Entity a role association is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Portfolio(String),
    Property(String),
    Unit(String),
}

impl Scope {
    /// Storage discriminant
    #[must_use]
    pub const fn entity_type(&self) -> &'static str {
        match self {
            Self::Portfolio(_) => "portfolio",
            Self::Property(_) => "property",
            Self::Unit(_) => "unit",
        }
    }

    /// Scoped entity id
    #[must_use]
    pub fn entity_id(&self) -> &str {
        match self {
            Self::Portfolio(id) | Self::Property(id) | Self::Unit(id) => id,
        }
    }

    /// Rebuild from storage discriminant + id
    #[must_use]
    pub fn from_parts(entity_type: &str, entity_id: &str) -> Option<Self> {
        match entity_type {
            "portfolio" => Some(Self::Portfolio(entity_id.to_string())),
            "property" => Some(Self::Property(entity_id.to_string())),
            "unit" => Some(Self::Unit(entity_id.to_string())),
            _ => None,
        }
    }
}

/// A grant of a role to an actor scoped to one hierarchy entity
///
/// Grants carry no storage-level inheritance; "higher level implies lower
/// level" is computed by the engine from the containment chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssociation {
    pub id: String,
    pub actor_id: String,
    pub scope: Scope,
    pub role: Role,
}

/// Time-boxed, device-list-scoped access grant independent of the hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestGrant {
    pub id: String,
    pub actor_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub device_ids: Vec<String>,
}

impl GuestGrant {
    /// Whether the grant window covers `now`
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now <= self.valid_until
    }

    /// Whether the grant's allow-list names the device
    #[must_use]
    pub fn covers_device(&self, device_id: &str) -> bool {
        self.device_ids.iter().any(|d| d == device_id)
    }
}

/// Operations an actor can request on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ReadStatus,
    Lock,
    Unlock,
    ChangeSettings,
    ManageAccess,
    Rename,
    Remove,
}

impl Operation {
    /// Whether executing this operation reaches out to the device
    ///
    /// Connectivity-free operations (metadata changes, cache-served status
    /// reads) bypass the online and remote-operation device gates.
    #[must_use]
    pub const fn requires_connectivity(self) -> bool {
        matches!(self, Self::Lock | Self::Unlock | Self::ChangeSettings)
    }

    /// Stable string form used in storage and the CLI
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadStatus => "read_status",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::ChangeSettings => "change_settings",
            Self::ManageAccess => "manage_access",
            Self::Rename => "rename",
            Self::Remove => "remove",
        }
    }

    /// Parse from the stable string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read_status" => Some(Self::ReadStatus),
            "lock" => Some(Self::Lock),
            "unlock" => Some(Self::Unlock),
            "change_settings" => Some(Self::ChangeSettings),
            "manage_access" => Some(Self::ManageAccess),
            "rename" => Some(Self::Rename),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed lock bolt state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Locked,
    Unlocked,
    Jammed,
    Unknown,
}

impl LockState {
    /// Stable string form used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::Jammed => "jammed",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from the stable string form; anything else reads as `Unknown`
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "locked" => Self::Locked,
            "unlocked" => Self::Unlocked,
            "jammed" => Self::Jammed,
            _ => Self::Unknown,
        }
    }
}

/// Observed device state as returned by an adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub state: LockState,
    pub battery_level: Option<u8>,
    pub observed_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    /// Snapshot with the given state observed now
    #[must_use]
    pub fn observed_now(device_id: impl Into<String>, state: LockState) -> Self {
        Self {
            device_id: device_id.into(),
            state,
            battery_level: None,
            observed_at: Utc::now(),
        }
    }
}

/// A state-changing command sent to a vendor adapter
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Lock,
    Unlock,
    /// Vendor-interpreted settings payload
    ApplySettings(serde_json::Value),
}

impl DeviceCommand {
    /// Map an authorized operation to the adapter command it implies
    ///
    /// Returns `None` for operations that never touch the adapter
    /// (status reads served from cache, metadata changes).
    #[must_use]
    pub fn for_operation(operation: Operation) -> Option<Self> {
        match operation {
            Operation::Lock => Some(Self::Lock),
            Operation::Unlock => Some(Self::Unlock),
            Operation::ChangeSettings => Some(Self::ApplySettings(serde_json::Value::Null)),
            _ => None,
        }
    }

    /// The state this command asserts, for idempotency short-circuiting
    #[must_use]
    pub const fn asserted_state(&self) -> Option<LockState> {
        match self {
            Self::Lock => Some(LockState::Locked),
            Self::Unlock => Some(LockState::Unlocked),
            Self::ApplySettings(_) => None,
        }
    }
}

/// Terminal classification of an audited access attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Authorized and the vendor call succeeded
    GrantedSuccess,
    /// Authorized but the vendor call (or the caller) failed it
    GrantedFailure,
    /// Refused by policy before any vendor call
    Denied,
}

impl Outcome {
    /// Stable string form used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GrantedSuccess => "granted_success",
            Self::GrantedFailure => "granted_failure",
            Self::Denied => "denied",
        }
    }

    /// Parse from the stable string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "granted_success" => Some(Self::GrantedSuccess),
            "granted_failure" => Some(Self::GrantedFailure),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

/// Immutable audit entry for one access attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecord {
    pub id: String,
    pub device_id: String,
    pub actor_id: String,
    pub operation: Operation,
    pub requested_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub denial_reason: Option<String>,
}
