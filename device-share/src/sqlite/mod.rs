//! SQLite-backed share storage for native mobile runtimes.
//!
//! Every operation runs on a blocking worker as
//! open → provision-if-needed → execute → close. The connection never
//! outlives the operation; the only state kept between calls is the
//! [`ProvisionGate`](schema::ProvisionGate).

mod schema;
mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{types::Value, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{resolve_id, BackendKind, DeviceShareEntry, FailurePolicy};
use crate::ShareStore;

use schema::{is_missing_table, ProvisionGate};
use session::DbSession;

pub use schema::SCHEMA_VERSION;
pub use session::DatabaseSource;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    source: DatabaseSource,
    gate: ProvisionGate,
}

/// [`ShareStore`] over a table in an embedded SQLite database.
#[derive(Clone)]
pub struct SqliteShareStore {
    inner: Arc<Inner>,
    policy: FailurePolicy,
    busy_timeout: Duration,
}

impl std::fmt::Debug for SqliteShareStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteShareStore")
            .field("source", &self.inner.source)
            .field("policy", &self.policy)
            .finish()
    }
}

impl SqliteShareStore {
    /// Create a store over `source`. Nothing touches the database until the
    /// first operation.
    pub fn new(source: DatabaseSource) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                gate: ProvisionGate::default(),
            }),
            policy: FailurePolicy::default(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// A store with no database behind it.
    pub fn unavailable() -> Self {
        Self::new(DatabaseSource::Unavailable)
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn source(&self) -> &DatabaseSource {
        &self.inner.source
    }

    /// Whether the share tables were provisioned by this process.
    pub fn is_provisioned(&self) -> bool {
        self.inner.gate.is_provisioned()
    }

    /// Run `f` on a blocking worker with a freshly opened connection.
    async fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner, &Connection) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let session = DbSession::open(&inner.source, busy_timeout)?;
            let conn = session.conn()?;
            f(&inner, conn)
        })
        .await?
    }
}

/// Execute a write, re-provisioning once if the tables were removed
/// behind our back.
fn write_with_repair<T>(
    gate: &ProvisionGate,
    conn: &Connection,
    write: impl Fn(&Connection) -> rusqlite::Result<T>,
) -> Result<T> {
    gate.ensure(conn)?;
    match write(conn) {
        Err(e) if is_missing_table(&e) => {
            warn!("Share table missing after provisioning, re-creating");
            gate.reset();
            gate.ensure(conn)?;
            Ok(write(conn)?)
        }
        other => Ok(other?),
    }
}

/// Read with a missing table treated as an empty one.
fn read_or_absent<T: Default>(
    gate: &ProvisionGate,
    conn: &Connection,
    read: impl FnOnce(&Connection) -> rusqlite::Result<T>,
) -> Result<T> {
    gate.ensure(conn)?;
    match read(conn) {
        Err(e) if is_missing_table(&e) => {
            gate.reset();
            Ok(T::default())
        }
        other => Ok(other?),
    }
}

/// Only a non-empty text value counts as a share.
fn share_from_value(value: Value) -> Option<String> {
    match value {
        Value::Text(share) if !share.is_empty() => Some(share),
        _ => None,
    }
}

fn version_from_value(id: &str, value: i64) -> Option<u32> {
    match u32::try_from(value) {
        Ok(version) => Some(version),
        Err(_) => {
            warn!(id, "Ignoring out-of-range share version {}", value);
            None
        }
    }
}

fn delete_share_rows(conn: &Connection, id: &str) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM device_shares WHERE id = ?1", [id])?;
    tx.execute("DELETE FROM device_share_versions WHERE id = ?1", [id])?;
    tx.commit()
}

#[async_trait]
impl ShareStore for SqliteShareStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn store_device_share(&self, share: &str, id: Option<&str>) -> Result<()> {
        let id = resolve_id(id).to_string();
        let share = share.to_string();
        debug!(id = %id, "Storing device share ({} chars)", share.len());

        let key = id.clone();
        let outcome = self
            .with_session(move |inner, conn| {
                write_with_repair(&inner.gate, conn, |conn| {
                    conn.execute(
                        "INSERT INTO device_shares (id, share) VALUES (?1, ?2)
                         ON CONFLICT(id) DO UPDATE SET share = excluded.share",
                        [key.as_str(), share.as_str()],
                    )
                })
                .map(|_| ())
            })
            .await;

        self.policy.settle("store", &id, outcome)
    }

    async fn get_device_share(&self, id: Option<&str>) -> Result<Option<String>> {
        let id = resolve_id(id).to_string();

        let key = id.clone();
        let outcome = self
            .with_session(move |inner, conn| {
                read_or_absent(&inner.gate, conn, |conn| {
                    let value = conn
                        .query_row(
                            "SELECT share FROM device_shares WHERE id = ?1",
                            [key.as_str()],
                            |row| row.get::<_, Value>(0),
                        )
                        .optional()?;
                    Ok(value.and_then(share_from_value))
                })
            })
            .await;

        self.policy.settle("get", &id, outcome)
    }

    async fn clear_all_shares(&self, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) => {
                let id = id.to_string();
                let key = id.clone();
                let outcome = self
                    .with_session(move |inner, conn| {
                        read_or_absent(&inner.gate, conn, |conn| delete_share_rows(conn, &key))
                    })
                    .await;
                self.policy.settle("clear", &id, outcome)
            }
            None => {
                let outcome = self.with_session(|inner, conn| inner.gate.teardown(conn)).await;
                self.policy.settle("clear", "*", outcome)
            }
        }
    }

    async fn store_share_version(&self, version: u32, id: Option<&str>) -> Result<()> {
        let id = resolve_id(id).to_string();

        let key = id.clone();
        let outcome = self
            .with_session(move |inner, conn| {
                write_with_repair(&inner.gate, conn, |conn| {
                    conn.execute(
                        "INSERT INTO device_share_versions (id, version) VALUES (?1, ?2)
                         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
                        rusqlite::params![key, version],
                    )
                })
                .map(|_| ())
            })
            .await;

        self.policy.settle("store_version", &id, outcome)
    }

    async fn get_share_version(&self, id: Option<&str>) -> Result<Option<u32>> {
        let id = resolve_id(id).to_string();

        let key = id.clone();
        let outcome = self
            .with_session(move |inner, conn| {
                read_or_absent(&inner.gate, conn, |conn| {
                    let version = conn
                        .query_row(
                            "SELECT version FROM device_share_versions WHERE id = ?1",
                            [key.as_str()],
                            |row| row.get::<_, i64>(0),
                        )
                        .optional()?;
                    Ok(version.and_then(|v| version_from_value(&key, v)))
                })
            })
            .await;

        self.policy.settle("get_version", &id, outcome)
    }

    async fn list_device_shares(&self) -> Result<Vec<DeviceShareEntry>> {
        let outcome = self
            .with_session(|inner, conn| {
                read_or_absent(&inner.gate, conn, |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT s.id, s.share, v.version
                         FROM device_shares s
                         LEFT JOIN device_share_versions v ON v.id = s.id
                         ORDER BY s.id",
                    )?;
                    let rows = stmt
                        .query_map([], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, Value>(1)?,
                                row.get::<_, Option<i64>>(2)?,
                            ))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;

                    let mut entries = Vec::with_capacity(rows.len());
                    for (id, value, version) in rows {
                        match share_from_value(value) {
                            Some(share) => {
                                let version = version.and_then(|v| version_from_value(&id, v));
                                entries.push(DeviceShareEntry::new(id, &share, version));
                            }
                            None => {
                                warn!(id = %id, "Removing orphaned device share entry");
                                delete_share_rows(conn, &id)?;
                            }
                        }
                    }
                    Ok(entries)
                })
            })
            .await;

        self.policy.settle("list", "*", outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn store_in(dir: &tempfile::TempDir) -> (SqliteShareStore, std::path::PathBuf) {
        let path = dir.path().join("shares.db");
        (SqliteShareStore::new(DatabaseSource::file(&path)), path)
    }

    fn row_count(path: &std::path::Path, id: &str) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM device_shares WHERE id = ?1", [id], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_in(&dir);

        store.store_device_share("share-payload", Some("a")).await.unwrap();
        assert_eq!(
            store.get_device_share(Some("a")).await.unwrap().as_deref(),
            Some("share-payload")
        );
    }

    #[tokio::test]
    async fn test_default_id() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_in(&dir);

        store.store_device_share("default-share", None).await.unwrap();
        assert_eq!(
            store.get_device_share(Some(crate::DEFAULT_DEVICE_SHARE_ID)).await.unwrap().as_deref(),
            Some("default-share")
        );
    }

    #[tokio::test]
    async fn test_replace_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = store_in(&dir);

        store.store_device_share("first", Some("a")).await.unwrap();
        store.store_device_share("second", Some("a")).await.unwrap();

        assert_eq!(store.get_device_share(Some("a")).await.unwrap().as_deref(), Some("second"));
        assert_eq!(row_count(&path, "a"), 1);
    }

    #[tokio::test]
    async fn test_provisioning_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = store_in(&dir);

        assert!(!store.is_provisioned());
        assert!(!path.exists());

        assert!(!store.has_device_share(Some("a")).await.unwrap());
        assert!(store.is_provisioned());
    }

    #[tokio::test]
    async fn test_non_text_value_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = store_in(&dir);
        store.store_device_share("placeholder", Some("blob")).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE device_shares SET share = ?1 WHERE id = 'blob'",
            [rusqlite::types::Value::Blob(vec![1, 2, 3])],
        )
        .unwrap();
        drop(conn);

        assert_eq!(store.get_device_share(Some("blob")).await.unwrap(), None);
        assert!(!store.has_device_share(Some("blob")).await.unwrap());
    }

    #[tokio::test]
    async fn test_scoped_clear_removes_version() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_in(&dir);

        store.store_device_share("share-a", Some("a")).await.unwrap();
        store.store_share_version(3, Some("a")).await.unwrap();
        store.clear_all_shares(Some("a")).await.unwrap();

        assert!(!store.has_device_share(Some("a")).await.unwrap());
        assert_eq!(store.get_share_version(Some("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_full_clear_resets_gate() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_in(&dir);

        store.store_device_share("share-a", Some("a")).await.unwrap();
        store.clear_all_shares(None).await.unwrap();
        assert!(!store.is_provisioned());

        store.store_device_share("share-a2", Some("a")).await.unwrap();
        assert!(store.is_provisioned());
        assert_eq!(store.get_device_share(Some("a")).await.unwrap().as_deref(), Some("share-a2"));
    }

    #[tokio::test]
    async fn test_write_repairs_externally_dropped_table() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = store_in(&dir);
        store.store_device_share("share-a", Some("a")).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("DROP TABLE device_shares").unwrap();
        drop(conn);

        let strict = store.clone().with_policy(FailurePolicy::Strict);
        assert_eq!(strict.get_device_share(Some("a")).await.unwrap(), None);

        strict.store_device_share("share-b", Some("b")).await.unwrap();
        assert_eq!(strict.get_device_share(Some("b")).await.unwrap().as_deref(), Some("share-b"));
    }

    #[tokio::test]
    async fn test_unavailable_is_silent_under_strict() {
        let store = SqliteShareStore::unavailable().with_policy(FailurePolicy::Strict);

        store.store_device_share("share", None).await.unwrap();
        assert_eq!(store.get_device_share(None).await.unwrap(), None);
        assert!(!store.has_device_share(None).await.unwrap());
        store.clear_all_shares(None).await.unwrap();
        assert!(store.list_device_shares().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_strict_policy_surfaces_database_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the database file should be cannot be opened.
        let path = dir.path().join("shares.db");
        std::fs::create_dir(&path).unwrap();

        let lenient = SqliteShareStore::new(DatabaseSource::file(&path));
        lenient.store_device_share("share", Some("a")).await.unwrap();
        assert_eq!(lenient.get_device_share(Some("a")).await.unwrap(), None);

        let strict = lenient.clone().with_policy(FailurePolicy::Strict);
        let err = strict.store_device_share("share", Some("a")).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }

    #[tokio::test]
    async fn test_list_orders_and_drops_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = store_in(&dir);

        store.store_device_share("bbbbbbbb-long-share-payload-22222222", Some("b")).await.unwrap();
        store.store_device_share("aaaaaaaa-long-share-payload-11111111", Some("a")).await.unwrap();
        store.store_share_version(2, Some("a")).await.unwrap();
        store.store_device_share("", Some("empty")).await.unwrap();

        let entries = store.list_device_shares().await.unwrap();
        assert_eq!(
            entries,
            vec![
                DeviceShareEntry {
                    id: "a".into(),
                    preview: "aaaaaaaa...11111111".into(),
                    share_version: Some(2),
                },
                DeviceShareEntry {
                    id: "b".into(),
                    preview: "bbbbbbbb...22222222".into(),
                    share_version: None,
                },
            ]
        );
        assert_eq!(row_count(&path, "empty"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let (store, path) = store_in(&dir);
        let store = store.with_policy(FailurePolicy::Strict);

        let (stored, read) = futures::join!(
            store.store_device_share("share-a", Some("a")),
            store.get_device_share(Some("a")),
        );
        stored.unwrap();
        let read = read.unwrap();
        assert!(read.is_none() || read.as_deref() == Some("share-a"));

        let conn = Connection::open(&path).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                ["device_shares"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
        assert_eq!(row_count(&path, "a"), 1);
    }
}
