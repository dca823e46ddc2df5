//! Device-side persistence for SSS recovery shares.
//!
//! A recovery flow keeps one share of the user's key on the device. This crate
//! stores that opaque share behind the [`ShareStore`] contract, with two
//! interchangeable backends:
//!
//! - [`LocalShareStore`]: encrypted directory store for general runtimes
//! - [`SqliteShareStore`]: embedded SQLite table for native mobile runtimes,
//!   where the general-purpose store may be evicted
//!
//! Callers obtain an `Arc<dyn ShareStore>` from [`open_store`] and never
//! branch on which backend is active.

use async_trait::async_trait;

mod backend;
mod config;
mod error;
mod local;
mod models;
mod sqlite;

pub use backend::open_store;
pub use config::{load_config, StoreConfig};
pub use error::{Error, Result};
pub use local::LocalShareStore;
pub use models::*;
pub use sqlite::{DatabaseSource, SqliteShareStore, SCHEMA_VERSION};

/// The storage contract every share backend satisfies.
///
/// Ids are optional; `None` means [`DEFAULT_DEVICE_SHARE_ID`]. With the
/// default [`FailurePolicy::Lenient`] no method returns `Err`: failed writes
/// are no-ops and failed reads report absence. Call
/// [`has_device_share`](ShareStore::has_device_share) after a write to confirm
/// persistence, or construct the backend with [`FailurePolicy::Strict`].
#[async_trait]
pub trait ShareStore: Send + Sync {
    /// Which backend this is. For logs only.
    fn kind(&self) -> BackendKind;

    /// Persist `share` under `id`, replacing any previous share.
    async fn store_device_share(&self, share: &str, id: Option<&str>) -> Result<()>;

    /// The most recently stored share for `id`.
    ///
    /// Returns `None` when nothing is stored or the stored value is empty or
    /// unreadable.
    async fn get_device_share(&self, id: Option<&str>) -> Result<Option<String>>;

    /// Whether [`get_device_share`](ShareStore::get_device_share) would return a share.
    async fn has_device_share(&self, id: Option<&str>) -> Result<bool> {
        Ok(self.get_device_share(id).await?.is_some())
    }

    /// Delete the share for `id`, or every share when `id` is `None`.
    async fn clear_all_shares(&self, id: Option<&str>) -> Result<()>;

    /// Record the version of the share stored under `id`.
    async fn store_share_version(&self, version: u32, id: Option<&str>) -> Result<()>;

    /// The recorded share version, `None` for legacy shares.
    async fn get_share_version(&self, id: Option<&str>) -> Result<Option<u32>>;

    /// Every readable share, sorted by id. Unreadable entries are removed.
    async fn list_device_shares(&self) -> Result<Vec<DeviceShareEntry>>;
}
