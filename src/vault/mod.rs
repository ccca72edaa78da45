//! Cryptographic vault.
//!
//! # Data Flow
//! ```text
//! Sensitive field write:
//!     → CryptoVault::encrypt / seal (AES-256-GCM, fresh 128-bit IV)
//!     → EncryptedPayload (hex fields or compact string) stored by the host
//!
//! Sensitive field read:
//!     → CryptoVault::decrypt / open (tag verified before any output)
//!
//! Passwords:      hash_password → "salt$hash" → verify_password
//! Integrity:      generate_hmac → verify_hmac (audit signatures)
//! ```
//!
//! # Security Constraints
//! - IVs are always generated internally; no API accepts a caller IV
//! - Every verification failure fails closed with a typed `VaultError`
//! - MAC and hash comparisons are constant time
//! - Key material is never logged

pub mod cipher;
pub mod kdf;
pub mod mac;
pub mod token;
pub mod types;

pub use types::{DerivedKey, EncryptedPayload, KeyMaterial, VaultError, VaultResult, KEY_LEN};

use crate::config::schema::VaultSettings;

/// Entry point for the vault primitives.
///
/// Holds the PBKDF2 work factor and an optional host master key used by
/// [`CryptoVault::seal`] and [`CryptoVault::open`].
#[derive(Clone)]
pub struct CryptoVault {
    iterations: u32,
    master_key: Option<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for CryptoVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoVault")
            .field("iterations", &self.iterations)
            .field("has_master_key", &self.master_key.is_some())
            .finish()
    }
}

impl Default for CryptoVault {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoVault {
    /// Vault with the default 100 000 PBKDF2 iterations and no master key.
    pub fn new() -> Self {
        Self::with_iterations(kdf::DEFAULT_ITERATIONS)
    }

    /// Vault with a custom PBKDF2 work factor.
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
            master_key: None,
        }
    }

    /// Build from the `[vault]` config section.
    pub fn from_settings(settings: &VaultSettings, master_key: Option<[u8; KEY_LEN]>) -> Self {
        let vault = Self::with_iterations(settings.pbkdf2_iterations);
        match master_key {
            Some(key) => vault.with_master_key(key),
            None => vault,
        }
    }

    /// Attach the host master key.
    pub fn with_master_key(mut self, key: [u8; KEY_LEN]) -> Self {
        self.master_key = Some(key);
        self
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn has_master_key(&self) -> bool {
        self.master_key.is_some()
    }

    pub fn derive_key(&self, password: &str, salt: Option<&[u8]>) -> DerivedKey {
        kdf::derive_key(password, salt, self.iterations)
    }

    pub fn encrypt(&self, plaintext: &[u8], key: KeyMaterial<'_>) -> VaultResult<EncryptedPayload> {
        cipher::encrypt(plaintext, key, self.iterations)
    }

    pub fn decrypt(&self, payload: &EncryptedPayload, key: KeyMaterial<'_>) -> VaultResult<Vec<u8>> {
        let result = cipher::decrypt(payload, key, self.iterations);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Decryption rejected");
        }
        result
    }

    /// Encrypt a UTF-8 string with the master key into compact form.
    pub fn seal(&self, plaintext: &str) -> VaultResult<String> {
        let key = self.master_key.as_ref().ok_or(VaultError::MissingMasterKey)?;
        Ok(self
            .encrypt(plaintext.as_bytes(), KeyMaterial::Raw(key))?
            .to_compact())
    }

    /// Reverse of [`CryptoVault::seal`].
    pub fn open(&self, sealed: &str) -> VaultResult<String> {
        let key = self.master_key.as_ref().ok_or(VaultError::MissingMasterKey)?;
        let payload = EncryptedPayload::from_compact(sealed)?;
        let plain = self.decrypt(&payload, KeyMaterial::Raw(key))?;
        String::from_utf8(plain)
            .map_err(|_| VaultError::MalformedPayload("plaintext is not UTF-8".into()))
    }

    pub fn hash_password(&self, password: &str) -> String {
        kdf::hash_password(password, self.iterations)
    }

    pub fn verify_password(&self, password: &str, stored: &str) -> VaultResult<bool> {
        kdf::verify_password(password, stored, self.iterations)
    }

    pub fn generate_hmac(&self, data: &[u8], key: &[u8]) -> String {
        mac::generate_hmac(data, key)
    }

    pub fn verify_hmac(&self, data: &[u8], mac_hex: &str, key: &[u8]) -> VaultResult<()> {
        mac::verify_hmac(data, mac_hex, key)
    }

    pub fn generate_secure_token(&self, bytes: usize) -> String {
        token::generate_secure_token(bytes)
    }

    pub fn random_bytes(&self, len: usize) -> Vec<u8> {
        token::random_bytes(len)
    }

    pub fn sha256_hex(&self, data: &[u8]) -> String {
        token::sha256_hex(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CryptoVault {
        CryptoVault::with_iterations(1_000)
    }

    #[test]
    fn test_seal_requires_master_key() {
        assert_eq!(vault().seal("x"), Err(VaultError::MissingMasterKey));
        assert_eq!(vault().open("a:b:c"), Err(VaultError::MissingMasterKey));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let vault = vault().with_master_key([9u8; KEY_LEN]);
        let sealed = vault.seal("rcon-password").unwrap();
        assert_eq!(sealed.split(':').count(), 3);
        assert_eq!(vault.open(&sealed).unwrap(), "rcon-password");
    }

    #[test]
    fn test_open_with_other_master_key_fails() {
        let sealed = vault().with_master_key([9u8; KEY_LEN]).seal("x").unwrap();
        let other = vault().with_master_key([8u8; KEY_LEN]);
        assert_eq!(other.open(&sealed), Err(VaultError::AuthenticationFailed));
    }

    #[test]
    fn test_default_iterations() {
        assert_eq!(CryptoVault::new().iterations(), 100_000);
        assert!(!CryptoVault::new().has_master_key());
    }

    #[test]
    fn test_debug_hides_master_key() {
        let vault = vault().with_master_key([0xAB; KEY_LEN]);
        let debug = format!("{:?}", vault);
        assert!(debug.contains("has_master_key: true"));
        assert!(!debug.contains("171"));
    }
}
