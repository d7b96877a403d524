//! Append-only audit log of access attempts
//!
//! Rows are written once and never updated or deleted; the repository
//! deliberately exposes no mutation beyond `append`.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::DbPool;
use crate::model::{AccessRecord, Operation, Outcome};
use crate::{Error, Result};

/// Filter for audit queries
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub device_id: Option<String>,
    pub actor_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Cap on returned rows; unset means no cap
    pub limit: Option<usize>,
}

impl AuditQuery {
    /// Records for one device
    #[must_use]
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::default()
        }
    }

    /// Records for one actor
    #[must_use]
    pub fn for_actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            ..Self::default()
        }
    }
}

/// Repository over the access log
#[derive(Clone)]
pub struct AuditRepo {
    pool: DbPool,
}

impl AuditRepo {
    /// Create a new audit repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Append one access record
    ///
    /// The write is synchronous and on the dispatch critical path; callers
    /// must not treat it as fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails
    pub fn append(&self, record: &AccessRecord) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO access_log
                (id, device_id, actor_id, operation, requested_at, outcome, denial_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.device_id,
                record.actor_id,
                record.operation.as_str(),
                record.requested_at.to_rfc3339(),
                record.outcome.as_str(),
                record.denial_reason,
            ],
        )?;
        Ok(())
    }

    /// Query records, ordered by request time
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn query(&self, filter: &AuditQuery) -> Result<Vec<AccessRecord>> {
        let mut sql = String::from(
            "SELECT id, device_id, actor_id, operation, requested_at, outcome, denial_reason
             FROM access_log WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(device_id) = &filter.device_id {
            sql.push_str(" AND device_id = ?");
            args.push(Box::new(device_id.clone()));
        }
        if let Some(actor_id) = &filter.actor_id {
            sql.push_str(" AND actor_id = ?");
            args.push(Box::new(actor_id.clone()));
        }
        if let Some(from) = filter.from {
            sql.push_str(" AND requested_at >= ?");
            args.push(Box::new(from.to_rfc3339()));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND requested_at <= ?");
            args.push(Box::new(until.to_rfc3339()));
        }
        sql.push_str(" ORDER BY requested_at");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(AsRef::as_ref));
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, device_id, actor_id, operation, requested_at, outcome, denial_reason) = row?;
            out.push(AccessRecord {
                id,
                device_id,
                actor_id,
                operation: Operation::parse(&operation)
                    .ok_or_else(|| Error::Database(format!("bad operation '{operation}'")))?,
                requested_at: DateTime::parse_from_rfc3339(&requested_at)
                    .map_err(|e| Error::Database(format!("bad timestamp: {e}")))?
                    .with_timezone(&Utc),
                outcome: Outcome::parse(&outcome)
                    .ok_or_else(|| Error::Database(format!("bad outcome '{outcome}'")))?,
                denial_reason,
            });
        }
        Ok(out)
    }

    /// Total record count (test and operator convenience)
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM access_log", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}
