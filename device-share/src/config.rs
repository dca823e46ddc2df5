//! Store configuration loaded from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::{BackendKind, FailurePolicy};

/// Default database/directory location, relative to the working directory.
const DEFAULT_STORE_PATH: &str = "sss-device-share";

/// Default SQLite busy timeout.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Backend to use. `None` picks the platform default.
    pub backend: Option<BackendKind>,
    /// Directory for the local backend, database file for SQLite.
    pub path: PathBuf,
    pub policy: FailurePolicy,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: None,
            path: PathBuf::from(DEFAULT_STORE_PATH),
            policy: FailurePolicy::default(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.unwrap_or_else(BackendKind::for_platform)
    }
}

/// Load a config file, falling back to defaults when it doesn't exist.
pub fn load_config(path: &Path) -> Result<StoreConfig> {
    if !path.exists() {
        return Ok(StoreConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}
