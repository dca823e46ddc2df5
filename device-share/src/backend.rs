//! Backend selection.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::local::LocalShareStore;
use crate::models::BackendKind;
use crate::sqlite::{DatabaseSource, SqliteShareStore};
use crate::ShareStore;

/// Build the configured backend. Callers keep the returned trait object and
/// never need to know which backend is behind it.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ShareStore>> {
    let kind = config.backend_kind();
    info!(
        "Opening {} share store at {} ({:?} policy)",
        kind,
        config.path.display(),
        config.policy
    );

    let store: Arc<dyn ShareStore> = match kind {
        BackendKind::Local => {
            Arc::new(LocalShareStore::new(&config.path).with_policy(config.policy))
        }
        BackendKind::Sqlite => Arc::new(
            SqliteShareStore::new(DatabaseSource::file(&config.path))
                .with_policy(config.policy)
                .with_busy_timeout(Duration::from_millis(config.busy_timeout_ms)),
        ),
    };

    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_store_honours_backend() {
        let dir = tempfile::tempdir().unwrap();

        let local = StoreConfig {
            backend: Some(BackendKind::Local),
            path: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert_eq!(open_store(&local).unwrap().kind(), BackendKind::Local);

        let sqlite = StoreConfig {
            backend: Some(BackendKind::Sqlite),
            path: dir.path().join("shares.db"),
            ..Default::default()
        };
        assert_eq!(open_store(&sqlite).unwrap().kind(), BackendKind::Sqlite);
    }

    #[test]
    fn test_platform_default() {
        let config = StoreConfig::default();
        assert_eq!(open_store(&config).unwrap().kind(), BackendKind::for_platform());
    }
}
