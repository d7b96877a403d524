//! Authorization engine
//!
//! Decides whether an actor may perform an operation on a device by
//! walking the device's containment chain (Unit? → Property → Portfolio)
//! against the actor's role associations, falling back to standing guest
//! grants, and applying the device-level gates last. Default is deny; an
//! explicit allowing match is required.
//!
//! The engine is a pure function of its inputs plus wall-clock time (guest
//! windows only). It never mutates the stores it reads.

pub mod permissions;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::model::{Device, GuestGrant, Operation, Portfolio, Property, RoleAssociation, Scope, Unit};
use crate::{Error, Result};

pub use permissions::{GUEST_GRANT_OPERATIONS, guest_grant_permits, permits};

/// Read-only view of the entity hierarchy (consumed interface)
pub trait EntityDirectory: Send + Sync {
    /// Look up a device by id
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails
    fn device(&self, id: &str) -> Result<Option<Device>>;

    /// Look up a unit by id
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails
    fn unit(&self, id: &str) -> Result<Option<Unit>>;

    /// Look up a property by id
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails
    fn property(&self, id: &str) -> Result<Option<Property>>;

    /// Resolve the portfolio housing a property
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails
    fn portfolio_for_property(&self, property_id: &str) -> Result<Option<Portfolio>>;
}

/// Read-only view of role associations and guest grants (consumed interface)
pub trait RoleDirectory: Send + Sync {
    /// All role associations held by an actor
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails
    fn associations_for(&self, actor_id: &str) -> Result<Vec<RoleAssociation>>;

    /// All standing guest grants held by an actor
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails
    fn guest_grants_for(&self, actor_id: &str) -> Result<Vec<GuestGrant>>;
}

/// Why an operation was refused
///
/// Callers surface these verbatim; collapsing them into a generic
/// "forbidden" loses information operators rely on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// Actor holds no association reaching this device and no guest grant
    NoMatchingAssociation,
    /// Actor's matched roles do not include this operation
    InsufficientRole,
    /// Guest grant exists but its window has already closed
    GuestWindowExpired,
    /// Guest grant exists but its window has not opened yet
    GuestWindowNotStarted,
    /// Guest grant window is open but the device is not on its allow-list
    DeviceNotInGuestList,
    /// Operation requires connectivity and the device is offline
    DeviceOffline,
    /// Remote operation has been disabled on the device itself
    RemoteOperationDisabled,
    /// Another command for the device is already in flight
    DeviceBusy,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NoMatchingAssociation => "no role association covers this device",
            Self::InsufficientRole => "insufficient role for this operation",
            Self::GuestWindowExpired => "guest access window has expired",
            Self::GuestWindowNotStarted => "guest access window has not started",
            Self::DeviceNotInGuestList => "device is not covered by the guest grant",
            Self::DeviceOffline => "device is offline",
            Self::RemoteOperationDisabled => "remote operation is disabled for this device",
            Self::DeviceBusy => "device busy: concurrent command in flight",
        };
        f.write_str(msg)
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Operation may proceed
    Allow,
    /// Operation refused, with a caller-surfaceable reason
    Deny(DenialReason),
}

impl Decision {
    /// Whether the decision allows the operation
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// The denial reason, if denied
    #[must_use]
    pub const fn denial_reason(&self) -> Option<&DenialReason> {
        match self {
            Self::Allow => None,
            Self::Deny(reason) => Some(reason),
        }
    }
}

/// A device together with its resolved containment chain
///
/// At least the property is always present; unit only for unit-attached
/// devices.
#[derive(Debug, Clone)]
pub struct DeviceChain {
    pub device: Device,
    pub unit: Option<Unit>,
    pub property: Property,
    pub portfolio: Portfolio,
}

/// Resolve a device's ancestors through the entity directory
///
/// # Errors
///
/// Returns [`Error::DataIntegrity`] when any link in the chain is missing
/// (an orphaned device) so callers can distinguish "cannot evaluate" from
/// a policy denial.
pub fn resolve_chain(entities: &dyn EntityDirectory, device: Device) -> Result<DeviceChain> {
    let (unit, property_id) = match &device.attachment {
        crate::model::Attachment::Unit(unit_id) => {
            let unit = entities.unit(unit_id)?.ok_or_else(|| {
                Error::DataIntegrity(format!(
                    "device '{}' references missing unit '{unit_id}'",
                    device.id
                ))
            })?;
            let property_id = unit.property_id.clone();
            (Some(unit), property_id)
        }
        crate::model::Attachment::Property(property_id) => (None, property_id.clone()),
    };

    let property = entities.property(&property_id)?.ok_or_else(|| {
        Error::DataIntegrity(format!(
            "device '{}' references missing property '{property_id}'",
            device.id
        ))
    })?;

    let portfolio = entities.portfolio_for_property(&property.id)?.ok_or_else(|| {
        Error::DataIntegrity(format!(
            "property '{}' references missing portfolio '{}'",
            property.id, property.portfolio_id
        ))
    })?;

    Ok(DeviceChain {
        device,
        unit,
        property,
        portfolio,
    })
}

/// The authorization engine
///
/// Holds read-only handles to the entity and role directories; substitutes
/// cleanly in tests (no global state).
#[derive(Clone)]
pub struct AuthzEngine {
    entities: Arc<dyn EntityDirectory>,
    roles: Arc<dyn RoleDirectory>,
}

impl AuthzEngine {
    /// Create an engine over the given directories
    #[must_use]
    pub fn new(entities: Arc<dyn EntityDirectory>, roles: Arc<dyn RoleDirectory>) -> Self {
        Self { entities, roles }
    }

    /// Decide whether `actor_id` may perform `operation` on the device
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataIntegrity`] for an unresolvable containment
    /// chain, or a store error.
    pub fn decide(&self, actor_id: &str, device: &Device, operation: Operation) -> Result<Decision> {
        self.decide_at(actor_id, device, operation, Utc::now())
    }

    /// Decision at an explicit instant (guest windows are the only
    /// time-dependent input)
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataIntegrity`] for an unresolvable containment
    /// chain, or a store error.
    pub fn decide_at(
        &self,
        actor_id: &str,
        device: &Device,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let chain = resolve_chain(self.entities.as_ref(), device.clone())?;

        let associations = self.roles.associations_for(actor_id)?;
        let matched: Vec<_> = associations
            .iter()
            .filter(|assoc| scope_matches(&assoc.scope, &chain))
            .collect();

        let role_allows = matched.iter().any(|a| permits(a.role, operation));

        let allowed_by = if role_allows {
            Some(GrantPath::Role)
        } else {
            self.guest_path(actor_id, device, operation, now, matched.is_empty())?
        };

        match allowed_by {
            Some(_) => Ok(device_gate(device, operation)),
            None => {
                if matched.is_empty() {
                    // No role reached the device; explain the closest guest
                    // grant if one exists, else the default deny.
                    Ok(Decision::Deny(self.guest_denial(actor_id, device, now)?))
                } else {
                    Ok(Decision::Deny(DenialReason::InsufficientRole))
                }
            }
        }
    }

    /// Side-effect-free preflight check for UI enablement
    ///
    /// # Errors
    ///
    /// Returns error if the device does not exist, its chain is broken, or
    /// a store read fails.
    pub fn can_perform(&self, actor_id: &str, device_id: &str, operation: Operation) -> Result<bool> {
        let device = self
            .entities
            .device(device_id)?
            .ok_or_else(|| Error::NotFound(format!("device '{device_id}'")))?;
        Ok(self.decide(actor_id, &device, operation)?.is_allowed())
    }

    /// Whether an active guest grant admits the operation
    fn guest_path(
        &self,
        actor_id: &str,
        device: &Device,
        operation: Operation,
        now: DateTime<Utc>,
        no_role_matched: bool,
    ) -> Result<Option<GrantPath>> {
        // Guest grants are only consulted when no role association reached
        // the device at all; a matched-but-insufficient role stays an
        // explicit role denial.
        if !no_role_matched || !guest_grant_permits(operation) {
            return Ok(None);
        }

        let grants = self.roles.guest_grants_for(actor_id)?;
        let admits = grants
            .iter()
            .any(|g| g.is_active(now) && g.covers_device(&device.id));
        Ok(admits.then_some(GrantPath::Guest))
    }

    /// Pick the most informative denial when no grant path matched
    fn guest_denial(
        &self,
        actor_id: &str,
        device: &Device,
        now: DateTime<Utc>,
    ) -> Result<DenialReason> {
        let grants = self.roles.guest_grants_for(actor_id)?;
        let covering: Vec<_> = grants.iter().filter(|g| g.covers_device(&device.id)).collect();

        if let Some(grant) = covering.first() {
            if covering.iter().any(|g| g.is_active(now)) {
                // Window open and device covered; the operation itself was
                // outside the guest subset.
                return Ok(DenialReason::InsufficientRole);
            }
            return Ok(if now < grant.valid_from {
                DenialReason::GuestWindowNotStarted
            } else {
                DenialReason::GuestWindowExpired
            });
        }

        if grants.iter().any(|g| g.is_active(now)) {
            return Ok(DenialReason::DeviceNotInGuestList);
        }

        Ok(DenialReason::NoMatchingAssociation)
    }
}

/// How the actor was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantPath {
    Role,
    Guest,
}

/// Whether a role association's scope reaches the device's chain
fn scope_matches(scope: &Scope, chain: &DeviceChain) -> bool {
    match scope {
        Scope::Unit(id) => chain.unit.as_ref().is_some_and(|u| &u.id == id),
        Scope::Property(id) => &chain.property.id == id,
        Scope::Portfolio(id) => &chain.portfolio.id == id,
    }
}

/// Device-level gate applied after a positive role/guest match
///
/// Connectivity-free operations (metadata-only) bypass both gates.
fn device_gate(device: &Device, operation: Operation) -> Decision {
    if !operation.requires_connectivity() {
        return Decision::Allow;
    }
    if !device.remote_operation_enabled {
        return Decision::Deny(DenialReason::RemoteOperationDisabled);
    }
    if !device.is_online {
        return Decision::Deny(DenialReason::DeviceOffline);
    }
    Decision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Duration;

    use crate::model::{Attachment, DeviceKind, Role};

    /// In-memory directories for engine tests
    #[derive(Default)]
    struct Fixture {
        devices: HashMap<String, Device>,
        units: HashMap<String, Unit>,
        properties: HashMap<String, Property>,
        portfolios: HashMap<String, Portfolio>,
        associations: Mutex<Vec<RoleAssociation>>,
        grants: Mutex<Vec<GuestGrant>>,
    }

    impl EntityDirectory for Fixture {
        fn device(&self, id: &str) -> Result<Option<Device>> {
            Ok(self.devices.get(id).cloned())
        }
        fn unit(&self, id: &str) -> Result<Option<Unit>> {
            Ok(self.units.get(id).cloned())
        }
        fn property(&self, id: &str) -> Result<Option<Property>> {
            Ok(self.properties.get(id).cloned())
        }
        fn portfolio_for_property(&self, property_id: &str) -> Result<Option<Portfolio>> {
            Ok(self
                .properties
                .get(property_id)
                .and_then(|p| self.portfolios.get(&p.portfolio_id))
                .cloned())
        }
    }

    impl RoleDirectory for Fixture {
        fn associations_for(&self, actor_id: &str) -> Result<Vec<RoleAssociation>> {
            Ok(self
                .associations
                .lock()
                .unwrap()
                .iter()
                .filter(|a| a.actor_id == actor_id)
                .cloned()
                .collect())
        }
        fn guest_grants_for(&self, actor_id: &str) -> Result<Vec<GuestGrant>> {
            Ok(self
                .grants
                .lock()
                .unwrap()
                .iter()
                .filter(|g| g.actor_id == actor_id)
                .cloned()
                .collect())
        }
    }

    fn device(id: &str, attachment: Attachment) -> Device {
        Device {
            id: id.into(),
            name: format!("device {id}"),
            vendor: "sim".into(),
            kind: DeviceKind::Lock,
            attachment,
            is_online: true,
            remote_operation_enabled: true,
        }
    }

    /// One portfolio, one property, two units, one device per unit plus a
    /// common-area device on the property.
    fn hierarchy() -> Fixture {
        let mut fx = Fixture::default();
        fx.portfolios.insert(
            "pf1".into(),
            Portfolio {
                id: "pf1".into(),
                name: "North Holdings".into(),
            },
        );
        fx.properties.insert(
            "p1".into(),
            Property {
                id: "p1".into(),
                name: "Birch Street".into(),
                portfolio_id: "pf1".into(),
            },
        );
        for unit_id in ["u1", "u2"] {
            fx.units.insert(
                unit_id.into(),
                Unit {
                    id: unit_id.into(),
                    name: format!("Unit {unit_id}"),
                    property_id: "p1".into(),
                },
            );
        }
        fx.devices
            .insert("d1".into(), device("d1", Attachment::Unit("u1".into())));
        fx.devices
            .insert("d2".into(), device("d2", Attachment::Unit("u2".into())));
        fx.devices
            .insert("dc".into(), device("dc", Attachment::Property("p1".into())));
        fx
    }

    fn engine(fx: Fixture) -> (AuthzEngine, Arc<Fixture>) {
        let fx = Arc::new(fx);
        (
            AuthzEngine::new(fx.clone(), fx.clone()),
            fx,
        )
    }

    fn tenant_on(fx: &Fixture, actor: &str, unit: &str) {
        fx.associations.lock().unwrap().push(RoleAssociation {
            id: uuid::Uuid::new_v4().to_string(),
            actor_id: actor.into(),
            scope: Scope::Unit(unit.into()),
            role: Role::Tenant,
        });
    }

    #[test]
    fn tenant_operates_own_unit_device() {
        let (engine, fx) = engine(hierarchy());
        tenant_on(&fx, "eve", "u1");

        let d1 = fx.devices.get("d1").unwrap();
        assert!(engine.decide("eve", d1, Operation::Unlock).unwrap().is_allowed());
        assert!(engine.decide("eve", d1, Operation::ReadStatus).unwrap().is_allowed());
        assert_eq!(
            engine.decide("eve", d1, Operation::ChangeSettings).unwrap(),
            Decision::Deny(DenialReason::InsufficientRole)
        );
    }

    #[test]
    fn tenant_never_reaches_sibling_unit() {
        let (engine, fx) = engine(hierarchy());
        tenant_on(&fx, "eve", "u1");

        let d2 = fx.devices.get("d2").unwrap();
        for op in [Operation::ReadStatus, Operation::Lock, Operation::Unlock] {
            assert_eq!(
                engine.decide("eve", d2, op).unwrap(),
                Decision::Deny(DenialReason::NoMatchingAssociation)
            );
        }
    }

    #[test]
    fn property_manager_reaches_all_devices_transitively() {
        let (engine, fx) = engine(hierarchy());
        fx.associations.lock().unwrap().push(RoleAssociation {
            id: "a1".into(),
            actor_id: "mgr".into(),
            scope: Scope::Property("p1".into()),
            role: Role::PropertyManager,
        });

        for device_id in ["d1", "d2", "dc"] {
            let d = fx.devices.get(device_id).unwrap();
            assert!(
                engine.decide("mgr", d, Operation::Unlock).unwrap().is_allowed(),
                "manager should reach {device_id}"
            );
            assert!(
                engine
                    .decide("mgr", d, Operation::ManageAccess)
                    .unwrap()
                    .is_allowed()
            );
        }
    }

    #[test]
    fn portfolio_admin_reaches_devices_through_containment_lookup() {
        let (engine, fx) = engine(hierarchy());
        fx.associations.lock().unwrap().push(RoleAssociation {
            id: "a1".into(),
            actor_id: "admin".into(),
            scope: Scope::Portfolio("pf1".into()),
            role: Role::PortfolioAdmin,
        });

        let d1 = fx.devices.get("d1").unwrap();
        assert!(engine.decide("admin", d1, Operation::Remove).unwrap().is_allowed());
    }

    #[test]
    fn revoking_only_association_flips_decision() {
        let (engine, fx) = engine(hierarchy());
        tenant_on(&fx, "eve", "u1");

        assert!(engine.can_perform("eve", "d1", Operation::Lock).unwrap());
        fx.associations.lock().unwrap().clear();
        assert!(!engine.can_perform("eve", "d1", Operation::Lock).unwrap());
    }

    #[test]
    fn guest_grant_admits_inside_window_only() {
        let (engine, fx) = engine(hierarchy());
        let now = Utc::now();
        fx.grants.lock().unwrap().push(GuestGrant {
            id: "g1".into(),
            actor_id: "visitor".into(),
            valid_from: now - Duration::hours(1),
            valid_until: now + Duration::hours(1),
            device_ids: vec!["d1".into()],
        });

        let d1 = fx.devices.get("d1").unwrap().clone();
        assert!(engine.decide_at("visitor", &d1, Operation::Unlock, now).unwrap().is_allowed());

        // Outside the window the same grant denies, with the window reason
        let late = now + Duration::hours(2);
        assert_eq!(
            engine.decide_at("visitor", &d1, Operation::Unlock, late).unwrap(),
            Decision::Deny(DenialReason::GuestWindowExpired)
        );
        let early = now - Duration::hours(2);
        assert_eq!(
            engine.decide_at("visitor", &d1, Operation::Unlock, early).unwrap(),
            Decision::Deny(DenialReason::GuestWindowNotStarted)
        );
    }

    #[test]
    fn guest_grant_never_reaches_settings_or_uncovered_devices() {
        let (engine, fx) = engine(hierarchy());
        let now = Utc::now();
        fx.grants.lock().unwrap().push(GuestGrant {
            id: "g1".into(),
            actor_id: "visitor".into(),
            valid_from: now - Duration::hours(1),
            valid_until: now + Duration::hours(1),
            device_ids: vec!["d1".into()],
        });

        let d1 = fx.devices.get("d1").unwrap().clone();
        assert_eq!(
            engine
                .decide_at("visitor", &d1, Operation::ChangeSettings, now)
                .unwrap(),
            Decision::Deny(DenialReason::InsufficientRole)
        );

        let d2 = fx.devices.get("d2").unwrap().clone();
        assert_eq!(
            engine.decide_at("visitor", &d2, Operation::Unlock, now).unwrap(),
            Decision::Deny(DenialReason::DeviceNotInGuestList)
        );
    }

    #[test]
    fn unknown_actor_gets_default_deny() {
        let (engine, fx) = engine(hierarchy());
        let d1 = fx.devices.get("d1").unwrap();
        assert_eq!(
            engine.decide("nobody", d1, Operation::Unlock).unwrap(),
            Decision::Deny(DenialReason::NoMatchingAssociation)
        );
    }

    #[test]
    fn device_gates_outrank_full_roles() {
        let (engine, fx) = engine(hierarchy());
        fx.associations.lock().unwrap().push(RoleAssociation {
            id: "a1".into(),
            actor_id: "mgr".into(),
            scope: Scope::Property("p1".into()),
            role: Role::PropertyManager,
        });

        let mut offline = fx.devices.get("d1").unwrap().clone();
        offline.is_online = false;
        assert_eq!(
            engine.decide("mgr", &offline, Operation::Lock).unwrap(),
            Decision::Deny(DenialReason::DeviceOffline)
        );

        let mut disabled = fx.devices.get("d1").unwrap().clone();
        disabled.remote_operation_enabled = false;
        assert_eq!(
            engine.decide("mgr", &disabled, Operation::Lock).unwrap(),
            Decision::Deny(DenialReason::RemoteOperationDisabled)
        );

        // Metadata operations bypass both gates
        assert!(engine.decide("mgr", &disabled, Operation::Rename).unwrap().is_allowed());
    }

    #[test]
    fn orphaned_device_is_a_data_integrity_error_not_a_denial() {
        let mut fx = hierarchy();
        fx.devices
            .insert("ghost".into(), device("ghost", Attachment::Unit("u404".into())));
        let (engine, fx) = engine(fx);
        tenant_on(&fx, "eve", "u1");

        let ghost = fx.devices.get("ghost").unwrap();
        let err = engine.decide("eve", ghost, Operation::Lock).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)), "got {err:?}");
    }

    #[test]
    fn decision_is_deterministic_for_fixed_inputs() {
        let (engine, fx) = engine(hierarchy());
        tenant_on(&fx, "eve", "u1");
        let d1 = fx.devices.get("d1").unwrap();
        let now = Utc::now();

        let first = engine.decide_at("eve", d1, Operation::Unlock, now).unwrap();
        for _ in 0..10 {
            assert_eq!(engine.decide_at("eve", d1, Operation::Unlock, now).unwrap(), first);
        }
    }
}
