//! Entity store: the Portfolio/Property/Unit/Device hierarchy
//!
//! Administrative create/reattach/delete operations live here; the
//! authorization engine and dispatcher only consume the read side through
//! [`EntityDirectory`].

use rusqlite::{OptionalExtension, Row, params};

use super::DbPool;
use crate::authz::EntityDirectory;
use crate::model::{Attachment, Device, DeviceKind, Portfolio, Property, Unit};
use crate::{Error, Result};

/// Repository over the hierarchy tables
#[derive(Clone)]
pub struct EntityRepo {
    pool: DbPool,
}

impl EntityRepo {
    /// Create a new entity repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Insert a portfolio
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn create_portfolio(&self, portfolio: &Portfolio) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO portfolios (id, name) VALUES (?1, ?2)",
            params![portfolio.id, portfolio.name],
        )?;
        Ok(())
    }

    /// Insert a property under its portfolio
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn create_property(&self, property: &Property) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO properties (id, name, portfolio_id) VALUES (?1, ?2, ?3)",
            params![property.id, property.name, property.portfolio_id],
        )?;
        Ok(())
    }

    /// Insert a unit under its property
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn create_unit(&self, unit: &Unit) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO units (id, name, property_id) VALUES (?1, ?2, ?3)",
            params![unit.id, unit.name, unit.property_id],
        )?;
        Ok(())
    }

    /// Insert a device with its attachment
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn create_device(&self, device: &Device) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO devices
                (id, name, vendor, kind, unit_id, property_id, is_online, remote_operation_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                device.id,
                device.name,
                device.vendor,
                device.kind.as_str(),
                device.attachment.unit_id(),
                device.attachment.property_id(),
                device.is_online,
                device.remote_operation_enabled,
            ],
        )?;
        Ok(())
    }

    /// Rename a device
    ///
    /// # Errors
    ///
    /// Returns error if the device does not exist or the update fails
    pub fn rename_device(&self, device_id: &str, name: &str) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE devices SET name = ?1 WHERE id = ?2",
            params![name, device_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("device '{device_id}'")));
        }
        Ok(())
    }

    /// Move a device to a new attachment point
    ///
    /// # Errors
    ///
    /// Returns error if the device does not exist or the update fails
    pub fn reattach_device(&self, device_id: &str, attachment: &Attachment) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE devices SET unit_id = ?1, property_id = ?2 WHERE id = ?3",
            params![attachment.unit_id(), attachment.property_id(), device_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("device '{device_id}'")));
        }
        Ok(())
    }

    /// Remove a device
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails
    pub fn delete_device(&self, device_id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM devices WHERE id = ?1", [device_id])?;
        Ok(())
    }

    /// Update the online flag reported by discovery
    ///
    /// # Errors
    ///
    /// Returns error if the update fails
    pub fn set_device_online(&self, device_id: &str, is_online: bool) -> Result<()> {
        self.conn()?.execute(
            "UPDATE devices SET is_online = ?1 WHERE id = ?2",
            params![is_online, device_id],
        )?;
        Ok(())
    }

    /// Enable or disable remote operation on a device
    ///
    /// # Errors
    ///
    /// Returns error if the update fails
    pub fn set_remote_operation_enabled(&self, device_id: &str, enabled: bool) -> Result<()> {
        self.conn()?.execute(
            "UPDATE devices SET remote_operation_enabled = ?1 WHERE id = ?2",
            params![enabled, device_id],
        )?;
        Ok(())
    }

    /// Delete a unit, reattaching its devices to the housing property
    ///
    /// Devices are never left orphaned: they become common-area devices of
    /// the property the unit belonged to.
    ///
    /// # Errors
    ///
    /// Returns error if the unit does not exist or the cascade fails
    pub fn delete_unit(&self, unit_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let property_id: Option<String> = tx
            .query_row(
                "SELECT property_id FROM units WHERE id = ?1",
                [unit_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(property_id) = property_id else {
            return Err(Error::NotFound(format!("unit '{unit_id}'")));
        };

        tx.execute(
            "UPDATE devices SET unit_id = NULL, property_id = ?1 WHERE unit_id = ?2",
            params![property_id, unit_id],
        )?;
        tx.execute("DELETE FROM units WHERE id = ?1", [unit_id])?;

        tx.commit()?;
        Ok(())
    }

    /// Delete a property and everything contained in it
    ///
    /// Units and devices under the property are cascade-deleted; there is
    /// nothing left to reattach them to.
    ///
    /// # Errors
    ///
    /// Returns error if the property does not exist or the cascade fails
    pub fn delete_property(&self, property_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM properties WHERE id = ?1",
                [property_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("property '{property_id}'")));
        }

        tx.execute(
            "DELETE FROM devices WHERE property_id = ?1
                OR unit_id IN (SELECT id FROM units WHERE property_id = ?1)",
            [property_id],
        )?;
        tx.execute("DELETE FROM units WHERE property_id = ?1", [property_id])?;
        tx.execute("DELETE FROM properties WHERE id = ?1", [property_id])?;

        tx.commit()?;
        Ok(())
    }

    /// All devices registered for a vendor
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn devices_for_vendor(&self, vendor: &str) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, vendor, kind, unit_id, property_id,
                    is_online, remote_operation_enabled
             FROM devices WHERE vendor = ?1 ORDER BY id",
        )?;
        let devices = stmt
            .query_map([vendor], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// All registered devices
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, vendor, kind, unit_id, property_id,
                    is_online, remote_operation_enabled
             FROM devices ORDER BY id",
        )?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }
}

impl EntityDirectory for EntityRepo {
    fn device(&self, id: &str) -> Result<Option<Device>> {
        let conn = self.conn()?;
        let device = conn
            .query_row(
                "SELECT id, name, vendor, kind, unit_id, property_id,
                        is_online, remote_operation_enabled
                 FROM devices WHERE id = ?1",
                [id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn unit(&self, id: &str) -> Result<Option<Unit>> {
        let conn = self.conn()?;
        let unit = conn
            .query_row(
                "SELECT id, name, property_id FROM units WHERE id = ?1",
                [id],
                |row| {
                    Ok(Unit {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        property_id: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(unit)
    }

    fn property(&self, id: &str) -> Result<Option<Property>> {
        let conn = self.conn()?;
        let property = conn
            .query_row(
                "SELECT id, name, portfolio_id FROM properties WHERE id = ?1",
                [id],
                |row| {
                    Ok(Property {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        portfolio_id: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(property)
    }

    fn portfolio_for_property(&self, property_id: &str) -> Result<Option<Portfolio>> {
        let conn = self.conn()?;
        let portfolio = conn
            .query_row(
                "SELECT pf.id, pf.name FROM portfolios pf
                 JOIN properties p ON p.portfolio_id = pf.id
                 WHERE p.id = ?1",
                [property_id],
                |row| {
                    Ok(Portfolio {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(portfolio)
    }
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let kind_str: String = row.get(3)?;
    let unit_id: Option<String> = row.get(4)?;
    let property_id: Option<String> = row.get(5)?;

    // The schema CHECK guarantees exactly one attachment column is set
    let attachment = match (unit_id, property_id) {
        (Some(u), _) => Attachment::Unit(u),
        (None, Some(p)) => Attachment::Property(p),
        (None, None) => {
            return Err(rusqlite::Error::InvalidColumnType(
                4,
                "unit_id/property_id".into(),
                rusqlite::types::Type::Null,
            ));
        }
    };

    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        vendor: row.get(2)?,
        kind: DeviceKind::parse(&kind_str).unwrap_or(DeviceKind::Sensor),
        attachment,
        is_online: row.get(6)?,
        remote_operation_enabled: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> EntityRepo {
        EntityRepo::new(init_memory().unwrap())
    }

    fn seed(repo: &EntityRepo) {
        repo.create_portfolio(&Portfolio {
            id: "pf1".into(),
            name: "North".into(),
        })
        .unwrap();
        repo.create_property(&Property {
            id: "p1".into(),
            name: "Birch Street".into(),
            portfolio_id: "pf1".into(),
        })
        .unwrap();
        repo.create_unit(&Unit {
            id: "u1".into(),
            name: "Unit 1".into(),
            property_id: "p1".into(),
        })
        .unwrap();
        repo.create_device(&Device {
            id: "d1".into(),
            name: "Front Door".into(),
            vendor: "sim".into(),
            kind: DeviceKind::Lock,
            attachment: Attachment::Unit("u1".into()),
            is_online: true,
            remote_operation_enabled: true,
        })
        .unwrap();
    }

    #[test]
    fn device_round_trip() {
        let repo = setup();
        seed(&repo);

        let d = repo.device("d1").unwrap().unwrap();
        assert_eq!(d.name, "Front Door");
        assert_eq!(d.kind, DeviceKind::Lock);
        assert_eq!(d.attachment, Attachment::Unit("u1".into()));
        assert!(d.is_online);

        assert!(repo.device("d404").unwrap().is_none());
    }

    #[test]
    fn portfolio_resolves_through_property() {
        let repo = setup();
        seed(&repo);

        let pf = repo.portfolio_for_property("p1").unwrap().unwrap();
        assert_eq!(pf.id, "pf1");
        assert!(repo.portfolio_for_property("p404").unwrap().is_none());
    }

    #[test]
    fn deleting_unit_reattaches_devices_to_property() {
        let repo = setup();
        seed(&repo);

        repo.delete_unit("u1").unwrap();
        assert!(repo.unit("u1").unwrap().is_none());

        let d = repo.device("d1").unwrap().unwrap();
        assert_eq!(d.attachment, Attachment::Property("p1".into()));
    }

    #[test]
    fn deleting_property_cascades() {
        let repo = setup();
        seed(&repo);

        repo.delete_property("p1").unwrap();
        assert!(repo.property("p1").unwrap().is_none());
        assert!(repo.unit("u1").unwrap().is_none());
        assert!(repo.device("d1").unwrap().is_none());
    }

    #[test]
    fn online_flag_updates() {
        let repo = setup();
        seed(&repo);

        repo.set_device_online("d1", false).unwrap();
        assert!(!repo.device("d1").unwrap().unwrap().is_online);
    }

    #[test]
    fn vendor_listing() {
        let repo = setup();
        seed(&repo);

        assert_eq!(repo.devices_for_vendor("sim").unwrap().len(), 1);
        assert!(repo.devices_for_vendor("acme").unwrap().is_empty());
    }

    #[test]
    fn rename_missing_device_errors() {
        let repo = setup();
        assert!(matches!(
            repo.rename_device("nope", "x"),
            Err(Error::NotFound(_))
        ));
    }
}
