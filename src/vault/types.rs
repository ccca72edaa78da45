//! Vault payload types and error definitions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the GCM nonce (IV) in bytes.
pub const IV_LEN: usize = 16;

/// Length of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Length of a generated PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 16;

/// Errors raised by vault operations.
///
/// Every variant means the input is untrusted and the caller must fail
/// closed. Variants exist so logs can tell corruption from a wrong key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    /// Payload fields were missing, not hex, or the wrong length.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The authentication tag did not verify (wrong key or tampered data).
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Key material could not be used.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A stored password hash is not in `salt$hash` form.
    #[error("malformed password hash")]
    MalformedHash,

    /// A MAC did not match.
    #[error("verification failed")]
    VerificationFailed,

    /// `seal`/`open` were called on a vault with no master key.
    #[error("no master key configured")]
    MissingMasterKey,
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Key material accepted by `encrypt` and `decrypt`.
#[derive(Clone, Copy)]
pub enum KeyMaterial<'a> {
    /// A raw 256-bit key; no salt is produced.
    Raw(&'a [u8; KEY_LEN]),
    /// A password; a key is derived with PBKDF2 and the salt travels with the payload.
    Password(&'a str),
}

impl std::fmt::Debug for KeyMaterial<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Raw(_) => f.write_str("KeyMaterial::Raw(..)"),
            KeyMaterial::Password(_) => f.write_str("KeyMaterial::Password(..)"),
        }
    }
}

/// A derived key and the salt that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey {
    pub key: [u8; KEY_LEN],
    pub salt: Vec<u8>,
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("salt", &hex::encode(&self.salt))
            .finish_non_exhaustive()
    }
}

/// Output of `encrypt`. All fields are lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub iv: String,
    pub ciphertext: String,
    pub auth_tag: String,
    /// Empty when a raw key was used.
    #[serde(default)]
    pub salt: String,
}

impl EncryptedPayload {
    /// Encode as `iv:tag:ciphertext` or `iv:tag:ciphertext:salt`.
    pub fn to_compact(&self) -> String {
        if self.salt.is_empty() {
            format!("{}:{}:{}", self.iv, self.auth_tag, self.ciphertext)
        } else {
            format!(
                "{}:{}:{}:{}",
                self.iv, self.auth_tag, self.ciphertext, self.salt
            )
        }
    }

    /// Parse the compact form produced by [`EncryptedPayload::to_compact`].
    pub fn from_compact(value: &str) -> VaultResult<Self> {
        let parts: Vec<&str> = value.split(':').collect();
        let (iv, auth_tag, ciphertext, salt) = match parts.as_slice() {
            [iv, tag, ct] => (*iv, *tag, *ct, ""),
            [iv, tag, ct, salt] => (*iv, *tag, *ct, *salt),
            _ => {
                return Err(VaultError::MalformedPayload(format!(
                    "expected 3 or 4 segments, got {}",
                    parts.len()
                )))
            }
        };
        Ok(Self {
            iv: iv.to_string(),
            ciphertext: ciphertext.to_string(),
            auth_tag: auth_tag.to_string(),
            salt: salt.to_string(),
        })
    }
}
