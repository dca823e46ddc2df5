//! Data types shared by every share storage backend.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Id used when callers don't name a share.
pub const DEFAULT_DEVICE_SHARE_ID: &str = "sss-device-share";

/// Number of characters kept from each end of a payload in a preview.
const PREVIEW_EDGE: usize = 8;

/// Resolve an optional caller id to the id actually stored.
pub fn resolve_id(id: Option<&str>) -> &str {
    id.unwrap_or(DEFAULT_DEVICE_SHARE_ID)
}

/// Which storage backend holds the shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    /// Encrypted directory store used on general runtimes.
    Local,
    /// Embedded SQLite database used on native mobile runtimes.
    Sqlite,
}

impl BackendKind {
    /// The backend a host on this target should use.
    ///
    /// Mobile platforms may evict the general-purpose store under storage
    /// pressure, so they keep shares in the app's SQLite database instead.
    pub fn for_platform() -> Self {
        #[cfg(any(target_os = "android", target_os = "ios"))]
        {
            BackendKind::Sqlite
        }
        #[cfg(not(any(target_os = "android", target_os = "ios")))]
        {
            BackendKind::Local
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(Error::Config(format!("Unknown backend: {}", other))),
        }
    }
}

/// How a backend reacts when the underlying storage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Log and absorb: writes become no-ops, reads report absence.
    #[default]
    Lenient,
    /// Return the error so the caller can tell a failed write from "no share".
    Strict,
}

impl FailurePolicy {
    /// Apply the policy to the outcome of one storage operation.
    ///
    /// `Error::NotAvailable` is the expected degraded state and is absorbed
    /// under both policies.
    pub fn settle<T: Default>(self, op: &str, id: &str, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(Error::NotAvailable(reason)) => {
                tracing::debug!(op, id, "Share storage unavailable: {}", reason);
                Ok(T::default())
            }
            Err(e) => match self {
                FailurePolicy::Lenient => {
                    warn!(op, id, code = e.code(), "Share storage failure absorbed: {}", e);
                    Ok(T::default())
                }
                FailurePolicy::Strict => Err(e),
            },
        }
    }
}

/// A stored share as shown by
/// [`ShareStore::list_device_shares`](crate::ShareStore::list_device_shares).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceShareEntry {
    /// Storage key of the share.
    pub id: String,
    /// Truncated view of the payload, never the full share.
    pub preview: String,
    /// Share version, when one was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_version: Option<u32>,
}

impl DeviceShareEntry {
    pub fn new(id: impl Into<String>, share: &str, share_version: Option<u32>) -> Self {
        Self {
            id: id.into(),
            preview: preview(share),
            share_version,
        }
    }
}

/// First and last few characters of a payload.
pub fn preview(share: &str) -> String {
    let chars: Vec<char> = share.chars().collect();
    if chars.len() <= PREVIEW_EDGE * 2 {
        return "...".to_string();
    }

    let head: String = chars[..PREVIEW_EDGE].iter().collect();
    let tail: String = chars[chars.len() - PREVIEW_EDGE..].iter().collect();
    format!("{}...{}", head, tail)
}
