//! Encrypted directory store used on general runtimes.
//!
//! Layout inside the store directory:
//! - `shares.json`: sealed shares keyed by id, plus share versions
//! - `master.key`: the AES-256 key the shares are sealed with, when no OS
//!   keyring is available (see [`keys`])
//!
//! Every operation reads and rewrites `shares.json` under one lock, and each
//! rewrite goes to a temp file that is renamed over the original, so a crash
//! mid-write leaves the previous contents intact.

mod crypto;
mod keys;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{resolve_id, BackendKind, DeviceShareEntry, FailurePolicy};
use crate::ShareStore;

use crypto::{open_share, seal_share, EncryptedPayload};
use keys::{KeyStore, MasterKey};

/// Share records file name
pub const RECORDS_FILE_NAME: &str = "shares.json";

/// Contents of `shares.json`.
///
/// Shares are kept as raw JSON so one malformed entry doesn't make the
/// whole file unreadable.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ShareRecords {
    #[serde(default)]
    shares: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    versions: BTreeMap<String, u32>,
}

/// Write `bytes` to a temp file, restrict its permissions, then rename it
/// over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&temp_path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&temp_path, perms)?;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

struct Inner {
    dir: PathBuf,
    keys: KeyStore,
    lock: Mutex<()>,
}

impl Inner {
    fn records_path(&self) -> PathBuf {
        self.dir.join(RECORDS_FILE_NAME)
    }

    fn check_available(&self) -> Result<()> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(Error::NotAvailable(format!(
                "share directory {} does not exist",
                self.dir.display()
            )))
        }
    }

    fn read_records(&self) -> Result<ShareRecords> {
        let path = self.records_path();
        if !path.exists() {
            return Ok(ShareRecords::default());
        }

        let content = std::fs::read(&path)?;
        serde_json::from_slice(&content)
            .map_err(|e| Error::Corrupted(format!("Share records unreadable: {}", e)))
    }

    /// Records to modify on a write. An unreadable file is replaced rather
    /// than blocking every future write.
    fn read_records_for_write(&self) -> Result<ShareRecords> {
        match self.read_records() {
            Err(Error::Corrupted(reason)) => {
                warn!("Discarding unreadable share records: {}", reason);
                Ok(ShareRecords::default())
            }
            other => other,
        }
    }

    fn write_records(&self, records: &ShareRecords) -> Result<()> {
        let content = serde_json::to_vec(records)?;
        write_atomic(&self.records_path(), &content)
    }
}

/// Open one stored entry, `None` if it is missing, malformed or undecryptable.
fn read_entry(records: &ShareRecords, id: &str, key: Option<&MasterKey>) -> Option<String> {
    let raw = records.shares.get(id)?;

    let payload: EncryptedPayload = match serde_json::from_value(raw.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(id, "Stored share entry is not a sealed payload: {}", e);
            return None;
        }
    };

    let Some(key) = key else {
        warn!(id, "Stored share has no master key to open it");
        return None;
    };

    match open_share(&payload, id, key) {
        Ok(share) if !share.is_empty() => Some(share),
        Ok(_) => None,
        Err(e) => {
            warn!(id, "Failed to open stored share: {}", e);
            None
        }
    }
}

/// [`ShareStore`] over an encrypted directory.
#[derive(Clone)]
pub struct LocalShareStore {
    inner: Arc<Inner>,
    policy: FailurePolicy,
}

impl std::fmt::Debug for LocalShareStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalShareStore")
            .field("dir", &self.inner.dir)
            .field("policy", &self.policy)
            .finish()
    }
}

impl LocalShareStore {
    /// Create a store in `dir`. The directory is owned by the host; while it
    /// doesn't exist the store behaves as unavailable.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            inner: Arc::new(Inner {
                keys: KeyStore::new(dir.clone()),
                dir,
                lock: Mutex::new(()),
            }),
            policy: FailurePolicy::default(),
        }
    }

    /// A store that keeps its master key in the directory, never the keyring.
    #[cfg(test)]
    fn with_file_key(dir: &Path) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                keys: KeyStore::file_only(dir.to_path_buf()),
                lock: Mutex::new(()),
            }),
            policy: FailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Run `f` on a blocking worker with the store directory locked.
    async fn locked<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner.check_available()?;
            let _guard = inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
            f(&inner)
        })
        .await?
    }
}

#[async_trait]
impl ShareStore for LocalShareStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn store_device_share(&self, share: &str, id: Option<&str>) -> Result<()> {
        let id = resolve_id(id).to_string();
        let share = share.to_string();
        debug!(id = %id, "Storing device share ({} chars)", share.len());

        let key_id = id.clone();
        let outcome = self
            .locked(move |inner| {
                let (key, created) = inner.keys.get_or_create()?;
                let payload = seal_share(&share, &key_id, &key)?;

                let mut records = inner.read_records_for_write()?;
                if created && !records.shares.is_empty() {
                    warn!(
                        "Discarding {} share(s) sealed under a previous master key",
                        records.shares.len()
                    );
                    for id in std::mem::take(&mut records.shares).into_keys() {
                        records.versions.remove(&id);
                    }
                }
                records.shares.insert(key_id, serde_json::to_value(payload)?);
                inner.write_records(&records)
            })
            .await;

        self.policy.settle("store", &id, outcome)
    }

    async fn get_device_share(&self, id: Option<&str>) -> Result<Option<String>> {
        let id = resolve_id(id).to_string();

        let key_id = id.clone();
        let outcome = self
            .locked(move |inner| {
                let records = inner.read_records()?;
                if !records.shares.contains_key(&key_id) {
                    return Ok(None);
                }
                let key = inner.keys.load()?;
                Ok(read_entry(&records, &key_id, key.as_ref()))
            })
            .await;

        self.policy.settle("get", &id, outcome)
    }

    async fn clear_all_shares(&self, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) => {
                let id = id.to_string();
                let key_id = id.clone();
                let outcome = self
                    .locked(move |inner| {
                        let mut records = inner.read_records_for_write()?;
                        let removed = records.shares.remove(&key_id).is_some();
                        let removed_version = records.versions.remove(&key_id).is_some();
                        if removed || removed_version {
                            inner.write_records(&records)?;
                        }
                        Ok(())
                    })
                    .await;
                self.policy.settle("clear", &id, outcome)
            }
            None => {
                let outcome = self
                    .locked(|inner| {
                        let path = inner.records_path();
                        if path.exists() {
                            std::fs::remove_file(&path)?;
                        }
                        inner.keys.delete()?;
                        info!("Cleared all device shares and master key");
                        Ok(())
                    })
                    .await;
                self.policy.settle("clear", "*", outcome)
            }
        }
    }

    async fn store_share_version(&self, version: u32, id: Option<&str>) -> Result<()> {
        let id = resolve_id(id).to_string();

        let key_id = id.clone();
        let outcome = self
            .locked(move |inner| {
                let mut records = inner.read_records_for_write()?;
                records.versions.insert(key_id, version);
                inner.write_records(&records)
            })
            .await;

        self.policy.settle("store_version", &id, outcome)
    }

    async fn get_share_version(&self, id: Option<&str>) -> Result<Option<u32>> {
        let id = resolve_id(id).to_string();

        let key_id = id.clone();
        let outcome = self
            .locked(move |inner| Ok(inner.read_records()?.versions.get(&key_id).copied()))
            .await;

        self.policy.settle("get_version", &id, outcome)
    }

    async fn list_device_shares(&self) -> Result<Vec<DeviceShareEntry>> {
        let outcome = self
            .locked(|inner| {
                let mut records = inner.read_records()?;
                let key = inner.keys.load()?;

                let mut entries = Vec::with_capacity(records.shares.len());
                let mut orphans = Vec::new();
                for id in records.shares.keys() {
                    match read_entry(&records, id, key.as_ref()) {
                        Some(share) => {
                            let version = records.versions.get(id).copied();
                            entries.push(DeviceShareEntry::new(id.clone(), &share, version));
                        }
                        None => orphans.push(id.clone()),
                    }
                }

                if !orphans.is_empty() {
                    for id in &orphans {
                        warn!(id = %id, "Removing orphaned device share entry");
                        records.shares.remove(id);
                        records.versions.remove(id);
                    }
                    inner.write_records(&records)?;
                }

                Ok(entries)
            })
            .await;

        self.policy.settle("list", "*", outcome)
    }
}
