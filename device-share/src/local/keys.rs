//! Device master key for the local share store.
//!
//! A random 256-bit key is generated on the first write. On desktop targets
//! it is kept in the OS keyring:
//! - **macOS**: Keychain Access
//! - **Windows**: Credential Manager
//! - **Linux**: Secret Service API (GNOME Keyring, KWallet)
//!
//! When no keyring is reachable, or on other targets, the key is kept in
//! `master.key` inside the store directory instead. Clearing every share
//! deletes the key, so the next write starts under a fresh one.

use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::write_atomic;
use crate::error::{Error, Result};

/// Key size in bytes (256 bits)
pub(crate) const KEY_SIZE: usize = 32;

pub(crate) const KEY_FILE_NAME: &str = "master.key";

/// Service name used for keyring entries.
#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
const SERVICE_NAME: &str = "sss.device-share";

/// AES-256 key that is wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MasterKey {
    key: [u8; KEY_SIZE],
}

impl MasterKey {
    pub(crate) fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Take ownership of raw key bytes, wiping the source buffer.
    fn from_bytes(mut bytes: Vec<u8>, source: &str) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            let len = bytes.len();
            bytes.zeroize();
            return Err(Error::Corrupted(format!(
                "Invalid master key size in {}: expected {} bytes, got {}",
                source, KEY_SIZE, len
            )));
        }

        let mut key = MasterKey { key: [0u8; KEY_SIZE] };
        key.key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(key)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Where the master key lives.
enum Custody {
    #[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
    Keyring(keyring::Entry),
    File(PathBuf),
}

impl std::fmt::Debug for Custody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
            Custody::Keyring(_) => f.write_str("Keyring"),
            Custody::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
impl Custody {
    /// Use the keyring if it answers, otherwise fall back to the key file.
    fn detect(dir: &Path) -> Self {
        // One keyring entry per store directory.
        let account = format!("master-key:{}", dir.display());
        match keyring::Entry::new(SERVICE_NAME, &account) {
            Ok(entry) => Self::try_keyring(entry, dir),
            Err(e) => {
                warn!("Keyring not available, keeping master key in a file: {}", e);
                Custody::File(dir.join(KEY_FILE_NAME))
            }
        }
    }

    fn try_keyring(entry: keyring::Entry, dir: &Path) -> Self {
        match entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => {
                debug!("Keeping master key in the OS keyring");
                Custody::Keyring(entry)
            }
            Err(e) => {
                warn!("Keyring not accessible, keeping master key in a file: {:?}", e);
                Custody::File(dir.join(KEY_FILE_NAME))
            }
        }
    }
}

#[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
impl Custody {
    fn detect(dir: &Path) -> Self {
        Custody::File(dir.join(KEY_FILE_NAME))
    }
}

#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
fn map_keyring_error(err: keyring::Error) -> Error {
    match err {
        keyring::Error::NoStorageAccess(e) => {
            Error::Keyring(format!("Keyring access denied: {:?}", e))
        }
        keyring::Error::PlatformFailure(e) => Error::Keyring(format!("Keyring failure: {:?}", e)),
        keyring::Error::BadEncoding(_) => {
            Error::Corrupted("Keyring entry is not valid UTF-8".into())
        }
        _ => Error::Keyring(err.to_string()),
    }
}

/// Loads, creates and deletes the master key of one store directory.
///
/// Custody is decided on first use, not at construction. Callers serialize
/// access, so two first writers cannot each generate a different key.
#[derive(Debug)]
pub(crate) struct KeyStore {
    dir: PathBuf,
    custody: OnceLock<Custody>,
}

impl KeyStore {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            custody: OnceLock::new(),
        }
    }

    /// A key store that only ever uses the key file.
    #[cfg(test)]
    pub(crate) fn file_only(dir: PathBuf) -> Self {
        let custody = OnceLock::new();
        let _ = custody.set(Custody::File(dir.join(KEY_FILE_NAME)));
        Self { dir, custody }
    }

    fn custody(&self) -> &Custody {
        self.custody.get_or_init(|| Custody::detect(&self.dir))
    }

    /// Load the master key, `None` if none was created yet.
    pub(crate) fn load(&self) -> Result<Option<MasterKey>> {
        match self.custody() {
            #[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
            Custody::Keyring(entry) => {
                use base64::Engine;

                let mut encoded = match entry.get_password() {
                    Ok(encoded) => encoded,
                    Err(keyring::Error::NoEntry) => return Ok(None),
                    Err(e) => return Err(map_keyring_error(e)),
                };
                let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes());
                encoded.zeroize();

                let bytes = decoded.map_err(|e| {
                    Error::Corrupted(format!("Keyring master key is not base64: {}", e))
                })?;
                MasterKey::from_bytes(bytes, "keyring").map(Some)
            }
            Custody::File(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                MasterKey::from_bytes(std::fs::read(path)?, KEY_FILE_NAME).map(Some)
            }
        }
    }

    fn save(&self, key: &MasterKey) -> Result<()> {
        match self.custody() {
            #[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
            Custody::Keyring(entry) => {
                use base64::Engine;

                let mut encoded = base64::engine::general_purpose::STANDARD.encode(key.as_bytes());
                let stored = entry.set_password(&encoded).map_err(map_keyring_error);
                encoded.zeroize();
                stored
            }
            Custody::File(path) => write_atomic(path, key.as_bytes()),
        }
    }

    /// Load the master key or create and persist a new one.
    ///
    /// A key that exists but cannot be read is replaced. The returned flag
    /// is `true` when a new key was generated; anything sealed before that
    /// can no longer be opened.
    pub(crate) fn get_or_create(&self) -> Result<(MasterKey, bool)> {
        match self.load() {
            Ok(Some(key)) => return Ok((key, false)),
            Ok(None) => {}
            Err(Error::Corrupted(reason)) => {
                warn!("Replacing unreadable master key: {}", reason);
            }
            Err(e) => return Err(e),
        }

        let key = MasterKey::generate();
        self.save(&key)?;
        info!("Created device share master key");
        Ok((key, true))
    }

    /// Delete the master key. Missing key is fine.
    pub(crate) fn delete(&self) -> Result<()> {
        match self.custody() {
            #[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
            Custody::Keyring(entry) => match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(map_keyring_error(e)),
            },
            Custody::File(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(())
            }
        }
    }
}

/// Route keyring entries created by tests to in-memory mock credentials.
#[cfg(all(test, any(target_os = "macos", target_os = "windows", target_os = "linux")))]
pub(crate) fn use_mock_keyring() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder())
    });
}

#[cfg(all(test, not(any(target_os = "macos", target_os = "windows", target_os = "linux"))))]
pub(crate) fn use_mock_keyring() {}
