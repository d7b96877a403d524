//! Role association store and guest grants
//!
//! Grants are flat triples; nothing here encodes hierarchy semantics. The
//! engine computes reach from the containment chain at decision time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;
use rusqlite::params;
use uuid::Uuid;

use super::DbPool;
use crate::authz::RoleDirectory;
use crate::model::{GuestGrant, Role, RoleAssociation, Scope};
use crate::{Error, Result};

/// Repository over role associations and guest grants
#[derive(Clone)]
pub struct RoleRepo {
    pool: DbPool,
}

impl RoleRepo {
    /// Create a new role repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Grant a role to an actor on a hierarchy entity
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails
    pub fn grant(&self, actor_id: &str, scope: &Scope, role: Role) -> Result<RoleAssociation> {
        let assoc = RoleAssociation {
            id: Uuid::new_v4().to_string(),
            actor_id: actor_id.to_string(),
            scope: scope.clone(),
            role,
        };
        self.conn()?.execute(
            "INSERT INTO role_associations (id, actor_id, entity_type, entity_id, role)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                assoc.id,
                assoc.actor_id,
                scope.entity_type(),
                scope.entity_id(),
                role.as_str(),
            ],
        )?;
        Ok(assoc)
    }

    /// Revoke a role from an actor on a hierarchy entity
    ///
    /// Returns how many associations were removed (the same triple may have
    /// been granted more than once).
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails
    pub fn revoke(&self, actor_id: &str, scope: &Scope, role: Role) -> Result<usize> {
        let removed = self.conn()?.execute(
            "DELETE FROM role_associations
             WHERE actor_id = ?1 AND entity_type = ?2 AND entity_id = ?3 AND role = ?4",
            params![
                actor_id,
                scope.entity_type(),
                scope.entity_id(),
                role.as_str(),
            ],
        )?;
        Ok(removed)
    }

    /// Issue a time-boxed guest grant over an explicit device list
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails
    pub fn issue_guest_grant(
        &self,
        actor_id: &str,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
        device_ids: &[String],
    ) -> Result<GuestGrant> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let grant = GuestGrant {
            id: Uuid::new_v4().to_string(),
            actor_id: actor_id.to_string(),
            valid_from,
            valid_until,
            device_ids: device_ids.to_vec(),
        };

        tx.execute(
            "INSERT INTO guest_grants (id, actor_id, valid_from, valid_until)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                grant.id,
                grant.actor_id,
                grant.valid_from.to_rfc3339(),
                grant.valid_until.to_rfc3339(),
            ],
        )?;
        for device_id in device_ids {
            tx.execute(
                "INSERT INTO guest_grant_devices (grant_id, device_id) VALUES (?1, ?2)",
                params![grant.id, device_id],
            )?;
        }

        tx.commit()?;
        Ok(grant)
    }

    /// Remove a guest grant by id
    ///
    /// # Errors
    ///
    /// Returns error if the grant does not exist or the delete fails
    pub fn revoke_guest_grant(&self, grant_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM guest_grant_devices WHERE grant_id = ?1",
            [grant_id],
        )?;
        let removed = tx.execute("DELETE FROM guest_grants WHERE id = ?1", [grant_id])?;
        tx.commit()?;

        if removed == 0 {
            return Err(Error::NotFound(format!("guest grant '{grant_id}'")));
        }
        Ok(())
    }

    /// Load one guest grant
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn guest_grant(&self, grant_id: &str) -> Result<Option<GuestGrant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, actor_id, valid_from, valid_until FROM guest_grants WHERE id = ?1",
        )?;
        let mut grants = collect_grants(&conn, stmt.query_map([grant_id], grant_header)?)?;
        Ok(grants.pop())
    }

    /// Guest grants whose allow-list names a device
    ///
    /// Used when checking revocation authority over a device's grants.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn guest_grants_covering(&self, device_id: &str) -> Result<Vec<GuestGrant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT g.id, g.actor_id, g.valid_from, g.valid_until
             FROM guest_grants g
             JOIN guest_grant_devices gd ON gd.grant_id = g.id
             WHERE gd.device_id = ?1",
        )?;
        collect_grants(&conn, stmt.query_map([device_id], grant_header)?)
    }
}

impl RoleDirectory for RoleRepo {
    fn associations_for(&self, actor_id: &str) -> Result<Vec<RoleAssociation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, actor_id, entity_type, entity_id, role
             FROM role_associations WHERE actor_id = ?1",
        )?;
        let rows = stmt.query_map([actor_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, actor_id, entity_type, entity_id, role) = row?;
            let scope = Scope::from_parts(&entity_type, &entity_id).ok_or_else(|| {
                Error::Database(format!("bad scope type '{entity_type}' on association '{id}'"))
            })?;
            let role = Role::parse(&role)
                .ok_or_else(|| Error::Database(format!("bad role '{role}' on association '{id}'")))?;
            out.push(RoleAssociation {
                id,
                actor_id,
                scope,
                role,
            });
        }
        Ok(out)
    }

    fn guest_grants_for(&self, actor_id: &str) -> Result<Vec<GuestGrant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, actor_id, valid_from, valid_until
             FROM guest_grants WHERE actor_id = ?1",
        )?;
        collect_grants(&conn, stmt.query_map([actor_id], grant_header)?)
    }
}

type GrantHeader = (String, String, String, String);

fn grant_header(row: &rusqlite::Row<'_>) -> rusqlite::Result<GrantHeader> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn collect_grants(
    conn: &rusqlite::Connection,
    rows: impl Iterator<Item = rusqlite::Result<GrantHeader>>,
) -> Result<Vec<GuestGrant>> {
    let mut out = Vec::new();
    for row in rows {
        let (id, actor_id, valid_from, valid_until) = row?;

        let mut stmt =
            conn.prepare("SELECT device_id FROM guest_grant_devices WHERE grant_id = ?1")?;
        let device_ids = stmt
            .query_map([&id], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        out.push(GuestGrant {
            id,
            actor_id,
            valid_from: parse_datetime(&valid_from)?,
            valid_until: parse_datetime(&valid_until)?,
            device_ids,
        });
    }
    Ok(out)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("bad timestamp '{s}': {e}")))
}

/// TTL read-through cache over a [`RoleDirectory`]
///
/// Bounds how long a revocation can lag: a stale allow never outlives the
/// configured TTL. Writes should call [`CachedRoles::invalidate`] when
/// immediate effect matters.
#[derive(Clone)]
pub struct CachedRoles {
    inner: Arc<dyn RoleDirectory>,
    associations: Cache<String, Arc<Vec<RoleAssociation>>>,
    grants: Cache<String, Arc<Vec<GuestGrant>>>,
}

impl CachedRoles {
    /// Wrap a directory with the given TTL
    #[must_use]
    pub fn new(inner: Arc<dyn RoleDirectory>, ttl: Duration) -> Self {
        Self {
            inner,
            associations: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            grants: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Drop cached entries for an actor so the next read hits the store
    pub fn invalidate(&self, actor_id: &str) {
        self.associations.invalidate(&actor_id.to_string());
        self.grants.invalidate(&actor_id.to_string());
    }
}

impl RoleDirectory for CachedRoles {
    fn associations_for(&self, actor_id: &str) -> Result<Vec<RoleAssociation>> {
        let key = actor_id.to_string();
        if let Some(cached) = self.associations.get(&key) {
            return Ok(cached.as_ref().clone());
        }
        let fresh = self.inner.associations_for(actor_id)?;
        self.associations.insert(key, Arc::new(fresh.clone()));
        Ok(fresh)
    }

    fn guest_grants_for(&self, actor_id: &str) -> Result<Vec<GuestGrant>> {
        let key = actor_id.to_string();
        if let Some(cached) = self.grants.get(&key) {
            return Ok(cached.as_ref().clone());
        }
        let fresh = self.inner.guest_grants_for(actor_id)?;
        self.grants.insert(key, Arc::new(fresh.clone()));
        Ok(fresh)
    }
}
