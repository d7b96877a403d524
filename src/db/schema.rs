//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Ownership hierarchy: Portfolio -> Property -> Unit
        CREATE TABLE IF NOT EXISTS portfolios (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS properties (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            portfolio_id TEXT NOT NULL REFERENCES portfolios(id),
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_properties_portfolio ON properties(portfolio_id);

        CREATE TABLE IF NOT EXISTS units (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            property_id TEXT NOT NULL REFERENCES properties(id),
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_units_property ON units(property_id);

        -- Devices attach to exactly one of a unit or a property
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            vendor TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('lock', 'thermostat', 'light', 'sensor')),
            unit_id TEXT REFERENCES units(id),
            property_id TEXT REFERENCES properties(id),
            is_online INTEGER NOT NULL DEFAULT 1,
            remote_operation_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            CHECK ((unit_id IS NULL) != (property_id IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_devices_unit ON devices(unit_id);
        CREATE INDEX IF NOT EXISTS idx_devices_property ON devices(property_id);
        CREATE INDEX IF NOT EXISTS idx_devices_vendor ON devices(vendor);

        -- Role associations: actor -> entity -> role, no uniqueness beyond
        -- the tuple itself and no storage-level inheritance
        CREATE TABLE IF NOT EXISTS role_associations (
            id TEXT PRIMARY KEY,
            actor_id TEXT NOT NULL,
            entity_type TEXT NOT NULL CHECK(entity_type IN ('portfolio', 'property', 'unit')),
            entity_id TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN
                ('owner', 'portfolio_admin', 'property_manager', 'tenant', 'guest')),
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_role_associations_actor ON role_associations(actor_id);

        -- Time-boxed guest grants with a device allow-list
        CREATE TABLE IF NOT EXISTS guest_grants (
            id TEXT PRIMARY KEY,
            actor_id TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_until TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_guest_grants_actor ON guest_grants(actor_id);

        CREATE TABLE IF NOT EXISTS guest_grant_devices (
            grant_id TEXT NOT NULL REFERENCES guest_grants(id) ON DELETE CASCADE,
            device_id TEXT NOT NULL,
            PRIMARY KEY (grant_id, device_id)
        );

        CREATE INDEX IF NOT EXISTS idx_guest_grant_devices_device
            ON guest_grant_devices(device_id);

        -- Append-only access log; rows are never updated or deleted
        CREATE TABLE IF NOT EXISTS access_log (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            requested_at TEXT NOT NULL,
            outcome TEXT NOT NULL CHECK(outcome IN
                ('granted_success', 'granted_failure', 'denied')),
            denial_reason TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_access_log_device ON access_log(device_id, requested_at);
        CREATE INDEX IF NOT EXISTS idx_access_log_actor ON access_log(actor_id, requested_at);

        PRAGMA user_version = 1;
        ",
    )?;

    Ok(())
}
