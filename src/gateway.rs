//! Gateway facade wiring the stores, the authorization engine, the vendor
//! adapters, and the dispatcher into one surface
//!
//! Callers (the CLI, embedding services) talk only to [`Gateway`]; the
//! collaborators underneath stay private to the wiring here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::authz::{AuthzEngine, Decision, EntityDirectory, RoleDirectory, permits};
use crate::cache::DeviceStateCache;
use crate::db::{AuditQuery, AuditRepo, CachedRoles, DbPool, EntityRepo, RoleRepo};
use crate::dispatch::{CancelToken, CommandDispatcher, DispatchConfig};
use crate::error::{DispatchError, Error, Result};
use crate::model::{
    AccessRecord, DeviceSnapshot, GuestGrant, Operation, Outcome, Role, RoleAssociation, Scope,
};

/// How long cached role lookups may lag behind the store
const ROLE_CACHE_TTL: Duration = Duration::from_secs(30);

/// The assembled Latch gateway
#[derive(Clone)]
pub struct Gateway {
    entities: EntityRepo,
    roles: RoleRepo,
    cached_roles: CachedRoles,
    engine: AuthzEngine,
    adapters: AdapterRegistry,
    audit: AuditRepo,
    cache: Arc<DeviceStateCache>,
    dispatcher: CommandDispatcher,
}

impl Gateway {
    /// Assemble a gateway over a database pool and an adapter registry
    #[must_use]
    pub fn new(pool: DbPool, adapters: AdapterRegistry, config: DispatchConfig) -> Self {
        let entities = EntityRepo::new(pool.clone());
        let roles = RoleRepo::new(pool.clone());
        let cached_roles = CachedRoles::new(Arc::new(roles.clone()), ROLE_CACHE_TTL);
        let entity_dir: Arc<dyn EntityDirectory> = Arc::new(entities.clone());
        let role_dir: Arc<dyn RoleDirectory> = Arc::new(cached_roles.clone());
        let engine = AuthzEngine::new(entity_dir.clone(), role_dir);
        let audit = AuditRepo::new(pool);
        let cache = Arc::new(DeviceStateCache::new());
        let dispatcher = CommandDispatcher::new(
            entity_dir,
            engine.clone(),
            adapters.clone(),
            cache.clone(),
            audit.clone(),
            config,
        );
        Self {
            entities,
            roles,
            cached_roles,
            engine,
            adapters,
            audit,
            cache,
            dispatcher,
        }
    }

    /// Entity store handle for CRUD and seeding
    #[must_use]
    pub fn entities(&self) -> &EntityRepo {
        &self.entities
    }

    /// Shared device state cache
    #[must_use]
    pub fn cache(&self) -> Arc<DeviceStateCache> {
        self.cache.clone()
    }

    /// Execute an authorized operation on a device
    ///
    /// # Errors
    ///
    /// See [`DispatchError`]
    pub async fn dispatch(
        &self,
        actor_id: &str,
        device_id: &str,
        operation: Operation,
    ) -> std::result::Result<DeviceSnapshot, DispatchError> {
        self.dispatcher.dispatch(actor_id, device_id, operation).await
    }

    /// [`Self::dispatch`] with a cooperative cancellation token
    ///
    /// # Errors
    ///
    /// See [`DispatchError`]
    pub async fn dispatch_with_cancel(
        &self,
        actor_id: &str,
        device_id: &str,
        operation: Operation,
        cancel: CancelToken,
    ) -> std::result::Result<DeviceSnapshot, DispatchError> {
        self.dispatcher
            .dispatch_with_cancel(actor_id, device_id, operation, cancel)
            .await
    }

    /// Authorized status read, cache-first with a vendor fallback
    ///
    /// A fresh cache entry is served directly; otherwise the vendor is
    /// asked and the cache backfilled. Audited like any other access.
    ///
    /// # Errors
    ///
    /// See [`DispatchError`]
    pub async fn get_status(
        &self,
        actor_id: &str,
        device_id: &str,
        max_age: Duration,
    ) -> std::result::Result<DeviceSnapshot, DispatchError> {
        let requested_at = Utc::now();
        let record = |outcome: Outcome, reason: Option<String>| AccessRecord {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            actor_id: actor_id.to_string(),
            operation: Operation::ReadStatus,
            requested_at,
            outcome,
            denial_reason: reason,
        };

        // A missing device or broken chain is a data problem, mapped the
        // same way dispatch maps it
        let Some(device) = self.entities.device(device_id)? else {
            let msg = format!("device '{device_id}' not found");
            self.audit
                .append(&record(Outcome::Denied, Some(msg.clone())))?;
            return Err(DispatchError::DataIntegrity(msg));
        };

        match self.engine.decide(actor_id, &device, Operation::ReadStatus) {
            Ok(Decision::Allow) => {}
            Ok(Decision::Deny(reason)) => {
                self.audit
                    .append(&record(Outcome::Denied, Some(reason.to_string())))?;
                return Err(DispatchError::NotAuthorized(reason));
            }
            Err(Error::DataIntegrity(msg)) => {
                self.audit
                    .append(&record(Outcome::Denied, Some(msg.clone())))?;
                return Err(DispatchError::DataIntegrity(msg));
            }
            Err(e) => return Err(DispatchError::Internal(e)),
        }

        if let Some(snapshot) = self.cache.get_fresh(device_id, max_age).await {
            self.audit.append(&record(Outcome::GrantedSuccess, None))?;
            return Ok(snapshot);
        }

        let adapter = self.adapters.resolve(&device.vendor)?;
        match adapter.get_status(device_id).await {
            Ok(snapshot) => {
                self.cache.insert(snapshot.clone()).await;
                self.audit.append(&record(Outcome::GrantedSuccess, None))?;
                Ok(snapshot)
            }
            Err(e) => {
                self.audit
                    .append(&record(Outcome::GrantedFailure, Some(e.to_string())))?;
                Err(DispatchError::AdapterFailed {
                    attempts: 1,
                    last_error: e,
                })
            }
        }
    }

    /// Whether an actor could perform an operation, without side effects
    ///
    /// # Errors
    ///
    /// Returns error if the stores fail or the containment chain is broken
    pub fn can_perform(
        &self,
        actor_id: &str,
        device_id: &str,
        operation: Operation,
    ) -> Result<bool> {
        self.engine.can_perform(actor_id, device_id, operation)
    }

    /// Grant the first owner role without an authority check
    ///
    /// Every other grant goes through [`Self::grant_role`]; this exists
    /// only for bootstrapping an empty store.
    ///
    /// # Errors
    ///
    /// Returns error if the store insert fails
    pub fn bootstrap_owner(&self, actor_id: &str, scope: &Scope) -> Result<RoleAssociation> {
        let association = self.roles.grant(actor_id, scope, Role::Owner)?;
        self.cached_roles.invalidate(actor_id);
        tracing::info!(actor = actor_id, scope_id = scope.entity_id(), "owner bootstrapped");
        Ok(association)
    }

    /// Grant a role at a scope, authorized by the granting actor's own
    /// access-management authority over that scope
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credential`] when the grantor lacks authority
    pub fn grant_role(
        &self,
        grantor_id: &str,
        actor_id: &str,
        scope: &Scope,
        role: Role,
    ) -> Result<RoleAssociation> {
        self.require_manage_authority(grantor_id, scope)?;
        let association = self.roles.grant(actor_id, scope, role)?;
        self.cached_roles.invalidate(actor_id);
        tracing::info!(
            grantor = grantor_id,
            actor = actor_id,
            role = role.as_str(),
            scope_type = scope.entity_type(),
            scope_id = scope.entity_id(),
            "role granted"
        );
        Ok(association)
    }

    /// Revoke a role at a scope; takes effect on the next decision once
    /// the role cache entry for the actor is dropped
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credential`] when the revoker lacks authority
    pub fn revoke_role(
        &self,
        revoker_id: &str,
        actor_id: &str,
        scope: &Scope,
        role: Role,
    ) -> Result<usize> {
        self.require_manage_authority(revoker_id, scope)?;
        let removed = self.roles.revoke(actor_id, scope, role)?;
        self.cached_roles.invalidate(actor_id);
        tracing::info!(
            revoker = revoker_id,
            actor = actor_id,
            role = role.as_str(),
            removed,
            "role revoked"
        );
        Ok(removed)
    }

    /// Issue a time-boxed guest grant over an explicit device list
    ///
    /// The grantor must hold access-management authority over every
    /// listed device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credential`] when authority is missing for any
    /// device in the list
    pub fn issue_guest_grant(
        &self,
        grantor_id: &str,
        actor_id: &str,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
        device_ids: &[String],
    ) -> Result<GuestGrant> {
        if valid_until <= valid_from {
            return Err(Error::Config(
                "guest grant window must end after it starts".to_string(),
            ));
        }
        for device_id in device_ids {
            if !self
                .engine
                .can_perform(grantor_id, device_id, Operation::ManageAccess)?
            {
                return Err(Error::Credential(format!(
                    "'{grantor_id}' cannot manage access to device '{device_id}'"
                )));
            }
        }
        let grant = self
            .roles
            .issue_guest_grant(actor_id, valid_from, valid_until, device_ids)?;
        self.cached_roles.invalidate(actor_id);
        tracing::info!(
            grantor = grantor_id,
            actor = actor_id,
            grant = %grant.id,
            devices = device_ids.len(),
            "guest grant issued"
        );
        Ok(grant)
    }

    /// Revoke a guest grant before its window closes
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown grant and
    /// [`Error::Credential`] when the revoker lacks authority over the
    /// grant's devices
    pub fn revoke_guest_grant(&self, revoker_id: &str, grant_id: &str) -> Result<()> {
        let grant = self
            .roles
            .guest_grant(grant_id)?
            .ok_or_else(|| Error::NotFound(format!("guest grant '{grant_id}'")))?;
        for device_id in &grant.device_ids {
            if !self
                .engine
                .can_perform(revoker_id, device_id, Operation::ManageAccess)?
            {
                return Err(Error::Credential(format!(
                    "'{revoker_id}' cannot manage access to device '{device_id}'"
                )));
            }
        }
        self.roles.revoke_guest_grant(grant_id)?;
        self.cached_roles.invalidate(&grant.actor_id);
        tracing::info!(revoker = revoker_id, grant = grant_id, "guest grant revoked");
        Ok(())
    }

    /// Query the append-only access log
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn audit_log(&self, filter: &AuditQuery) -> Result<Vec<AccessRecord>> {
        self.audit.query(filter)
    }

    /// Check that the actor holds a role permitting `ManageAccess` at the
    /// target scope or at any scope containing it
    fn require_manage_authority(&self, actor_id: &str, scope: &Scope) -> Result<()> {
        let containing = self.containing_scopes(scope)?;
        let associations = self.roles.associations_for(actor_id)?;
        let authorized = associations.iter().any(|assoc| {
            permits(assoc.role, Operation::ManageAccess)
                && containing.iter().any(|s| *s == assoc.scope)
        });
        if authorized {
            Ok(())
        } else {
            Err(Error::Credential(format!(
                "'{actor_id}' cannot manage access at {} '{}'",
                scope.entity_type(),
                scope.entity_id()
            )))
        }
    }

    /// A scope plus every ancestor scope in the containment hierarchy
    fn containing_scopes(&self, scope: &Scope) -> Result<Vec<Scope>> {
        let mut scopes = vec![scope.clone()];
        match scope {
            Scope::Portfolio(_) => {}
            Scope::Property(property_id) => {
                let portfolio = self
                    .entities
                    .portfolio_for_property(property_id)?
                    .ok_or_else(|| {
                        Error::DataIntegrity(format!(
                            "property '{property_id}' has no portfolio"
                        ))
                    })?;
                scopes.push(Scope::Portfolio(portfolio.id));
            }
            Scope::Unit(unit_id) => {
                let unit = self
                    .entities
                    .unit(unit_id)?
                    .ok_or_else(|| Error::NotFound(format!("unit '{unit_id}'")))?;
                let portfolio = self
                    .entities
                    .portfolio_for_property(&unit.property_id)?
                    .ok_or_else(|| {
                        Error::DataIntegrity(format!(
                            "property '{}' has no portfolio",
                            unit.property_id
                        ))
                    })?;
                scopes.push(Scope::Property(unit.property_id));
                scopes.push(Scope::Portfolio(portfolio.id));
            }
        }
        Ok(scopes)
    }
}
