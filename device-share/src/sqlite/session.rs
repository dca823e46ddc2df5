//! Per-operation database connections.
//!
//! A [`DbSession`] owns one connection for the duration of a single share
//! operation and closes it when dropped, whichever way the operation exits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Where the share database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseSource {
    /// SQLite database file. The parent directory must already exist; the
    /// host app owns it.
    File(PathBuf),
    /// No database on this host. Writes no-op and reads report absence.
    Unavailable,
}

impl DatabaseSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        DatabaseSource::File(path.into())
    }

    /// Check that a connection can be attempted at all.
    fn path(&self) -> Result<&Path> {
        match self {
            DatabaseSource::Unavailable => {
                Err(Error::NotAvailable("no share database on this host".into()))
            }
            DatabaseSource::File(path) => {
                let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
                if let Some(dir) = parent {
                    if !dir.is_dir() {
                        return Err(Error::NotAvailable(format!(
                            "database directory {} does not exist",
                            dir.display()
                        )));
                    }
                }
                Ok(path.as_path())
            }
        }
    }
}

/// A connection scoped to one operation.
pub(crate) struct DbSession {
    conn: Option<Connection>,
}

impl DbSession {
    pub(crate) fn open(source: &DatabaseSource, busy_timeout: Duration) -> Result<Self> {
        let path = source.path()?;
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        debug!("Opened share database {}", path.display());
        Ok(Self { conn: Some(conn) })
    }

    /// The open connection. It is only taken out in `Drop`.
    pub(crate) fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Database("share database session already closed".into()))
    }
}

impl Drop for DbSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_conn, e)) = conn.close() {
                warn!("Failed to close share database: {}", e);
            }
        }
    }
}
