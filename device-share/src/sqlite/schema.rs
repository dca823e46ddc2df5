//! Share table definition and lazy, single-flight provisioning.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::Result;

/// Current schema version, stamped into `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS device_shares (
    id TEXT PRIMARY KEY NOT NULL,
    share TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS device_share_versions (
    id TEXT PRIMARY KEY NOT NULL,
    version INTEGER NOT NULL
);
";

const TEARDOWN_SQL: &str = "
DROP TABLE IF EXISTS device_share_versions;
DROP TABLE IF EXISTS device_shares;
PRAGMA user_version = 0;
";

/// Records whether the share tables were created in this process.
///
/// The check-and-create sequence runs with the lock held, so operations
/// racing on first use create the tables once. The lock is only taken on
/// blocking workers and never across an `.await`.
#[derive(Debug, Default)]
pub(crate) struct ProvisionGate {
    provisioned: Mutex<bool>,
}

impl ProvisionGate {
    fn lock(&self) -> MutexGuard<'_, bool> {
        // A panic mid-provisioning leaves `false`, which just re-runs the
        // idempotent DDL.
        self.provisioned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_provisioned(&self) -> bool {
        *self.lock()
    }

    /// Create the share tables unless this process already did.
    pub(crate) fn ensure(&self, conn: &Connection) -> Result<()> {
        let mut provisioned = self.lock();
        if *provisioned {
            return Ok(());
        }

        provision(conn)?;
        *provisioned = true;
        Ok(())
    }

    /// Forget that the tables exist, e.g. after they vanished underneath us.
    pub(crate) fn reset(&self) {
        *self.lock() = false;
    }

    /// Drop every share table and require provisioning before the next write.
    pub(crate) fn teardown(&self, conn: &Connection) -> Result<()> {
        let mut provisioned = self.lock();
        conn.execute_batch(TEARDOWN_SQL)?;
        *provisioned = false;
        info!("Dropped device share tables");
        Ok(())
    }
}

/// Idempotently create the share tables and stamp the schema version.
fn provision(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version == 0 {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if version > SCHEMA_VERSION {
        warn!(
            "Share database schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        );
    }

    info!("Provisioned device share tables (schema v{})", SCHEMA_VERSION);
    Ok(())
}

/// Whether a statement failed because a share table no longer exists.
pub(crate) fn is_missing_table(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.starts_with("no such table"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'device_share%'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let gate = ProvisionGate::default();

        gate.ensure(&conn).unwrap();
        gate.reset();
        gate.ensure(&conn).unwrap();

        assert!(gate.is_provisioned());
        assert_eq!(table_count(&conn), 2);
    }

    #[test]
    fn test_schema_version_stamped() {
        let conn = Connection::open_in_memory().unwrap();
        ProvisionGate::default().ensure(&conn).unwrap();

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_teardown_resets_gate() {
        let conn = Connection::open_in_memory().unwrap();
        let gate = ProvisionGate::default();
        gate.ensure(&conn).unwrap();

        gate.teardown(&conn).unwrap();

        assert!(!gate.is_provisioned());
        assert_eq!(table_count(&conn), 0);
    }

    #[test]
    fn test_missing_table_detection() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn
            .execute("DELETE FROM device_shares WHERE id = ?1", ["a"])
            .unwrap_err();
        assert!(is_missing_table(&err));
    }
}
