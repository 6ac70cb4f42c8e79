//! Per-user encryption of third-party API keys.
//!
//! Each user gets their own AES-256-GCM key, derived as
//! `SHA-256(master_key || user_id)`. Ciphertexts are stored as base64 of
//! `nonce || ciphertext+tag` with a fresh random 96-bit nonce per encryption.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("master key must be {} hex characters", MASTER_KEY_LEN * 2)]
    InvalidMasterKey,

    #[error("ciphertext is not valid base64")]
    Encoding,

    #[error("ciphertext is shorter than its nonce")]
    TooShort,

    #[error("ciphertext failed authentication")]
    Authentication,

    #[error("encryption failed")]
    Encryption,

    #[error("decrypted credential is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Clone)]
pub struct CredentialVault {
    master: [u8; MASTER_KEY_LEN],
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Parse a 64-character hex master key.
    pub fn new(master_hex: &str) -> Result<Self, VaultError> {
        let bytes = hex::decode(master_hex.trim()).map_err(|_| VaultError::InvalidMasterKey)?;
        let master = bytes
            .try_into()
            .map_err(|_| VaultError::InvalidMasterKey)?;
        Ok(Self { master })
    }

    /// Read `ENCRYPTION_MASTER_KEY`. A missing or malformed key disables
    /// credential storage rather than failing startup.
    pub fn from_env() -> Option<Self> {
        let Ok(raw) = std::env::var("ENCRYPTION_MASTER_KEY") else {
            tracing::warn!("ENCRYPTION_MASTER_KEY not set, credential storage disabled");
            return None;
        };
        match Self::new(&raw) {
            Ok(vault) => Some(vault),
            Err(e) => {
                tracing::warn!(error = %e, "ENCRYPTION_MASTER_KEY rejected, credential storage disabled");
                None
            }
        }
    }

    fn cipher(&self, user_id: Uuid) -> Aes256Gcm {
        let key = Sha256::new()
            .chain_update(self.master)
            .chain_update(user_id.to_string().as_bytes())
            .finalize();
        Aes256Gcm::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str, user_id: Uuid) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher(user_id)
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str, user_id: Uuid) -> Result<String, VaultError> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::Encoding)?;
        if data.len() < NONCE_LEN {
            return Err(VaultError::TooShort);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher(user_id)
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::Authentication)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::InvalidUtf8)
    }
}
