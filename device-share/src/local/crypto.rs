//! AES-256-GCM sealing of individual shares.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::keys::MasterKey;
use crate::error::{Error, Result};

/// Nonce size for AES-GCM (96 bits = 12 bytes)
const NONCE_SIZE: usize = 12;

const PAYLOAD_VERSION: u8 = 1;
const KEY_VERSION: u32 = 1;

/// A sealed share as written to `shares.json`.
///
/// The record id is bound in as associated data, so a payload copied under
/// another id fails to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EncryptedPayload {
    pub version: u8,
    pub iv: String,
    pub cipher: String,
    pub key_version: u32,
}

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

pub(crate) fn seal_share(share: &str, id: &str, key: &MasterKey) -> Result<EncryptedPayload> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::Encryption(format!("Invalid key: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: share.as_bytes(),
                aad: id.as_bytes(),
            },
        )
        .map_err(|e| Error::Encryption(format!("Encryption failed: {}", e)))?;

    Ok(EncryptedPayload {
        version: PAYLOAD_VERSION,
        iv: b64().encode(nonce_bytes),
        cipher: b64().encode(ciphertext),
        key_version: KEY_VERSION,
    })
}

pub(crate) fn open_share(payload: &EncryptedPayload, id: &str, key: &MasterKey) -> Result<String> {
    if payload.version != PAYLOAD_VERSION {
        return Err(Error::Corrupted(format!("Unsupported payload version {}", payload.version)));
    }

    let nonce_bytes = b64()
        .decode(&payload.iv)
        .map_err(|e| Error::Corrupted(format!("Bad nonce encoding: {}", e)))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(Error::Corrupted("Nonce has wrong length".into()));
    }
    let ciphertext = b64()
        .decode(&payload.cipher)
        .map_err(|e| Error::Corrupted(format!("Bad ciphertext encoding: {}", e)))?;

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::Encryption(format!("Invalid key: {}", e)))?;

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: id.as_bytes(),
            },
        )
        // Wrong key, wrong id or tampered data
        .map_err(|_| Error::Encryption("Decryption failed".into()))?;

    String::from_utf8(plaintext).map_err(|_| Error::Corrupted("Share is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_uses_fresh_nonce() {
        let key = MasterKey::generate();

        let a = seal_share("share", "id", &key).unwrap();
        let b = seal_share("share", "id", &key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.cipher, b.cipher);
    }

    #[test]
    fn test_payload_bound_to_id() {
        let key = MasterKey::generate();

        let sealed = seal_share("share", "user-a", &key).unwrap();
        assert_eq!(open_share(&sealed, "user-a", &key).unwrap(), "share");
        assert!(matches!(open_share(&sealed, "user-b", &key), Err(Error::Encryption(_))));
    }

    #[test]
    fn test_unknown_payload_version_rejected() {
        let key = MasterKey::generate();

        let mut sealed = seal_share("share", "id", &key).unwrap();
        sealed.version = 9;
        assert!(matches!(open_share(&sealed, "id", &key), Err(Error::Corrupted(_))));
    }
}
