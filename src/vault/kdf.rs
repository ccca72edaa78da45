//! PBKDF2 key derivation and password hashing.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::vault::token::random_bytes;
use crate::vault::types::{DerivedKey, VaultError, VaultResult, KEY_LEN, SALT_LEN};

/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Derive a 256-bit key from a password.
///
/// A fresh 128-bit salt is generated when `salt` is `None`.
pub fn derive_key(password: &str, salt: Option<&[u8]>, iterations: u32) -> DerivedKey {
    let salt = match salt {
        Some(s) => s.to_vec(),
        None => random_bytes(SALT_LEN),
    };
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut key);
    DerivedKey { key, salt }
}

/// Hash a password as `salt_hex$hash_hex`.
pub fn hash_password(password: &str, iterations: u32) -> String {
    let derived = derive_key(password, None, iterations);
    format!("{}${}", hex::encode(&derived.salt), hex::encode(derived.key))
}

/// Check a password against a stored `salt$hash` value.
///
/// Returns `Ok(false)` on mismatch and `Err` when the stored value is not
/// a hash this module produced.
pub fn verify_password(password: &str, stored: &str, iterations: u32) -> VaultResult<bool> {
    let (salt_hex, hash_hex) = stored.split_once('$').ok_or(VaultError::MalformedHash)?;
    let salt = hex::decode(salt_hex).map_err(|_| VaultError::MalformedHash)?;
    let expected = hex::decode(hash_hex).map_err(|_| VaultError::MalformedHash)?;
    if salt.is_empty() || expected.len() != KEY_LEN {
        return Err(VaultError::MalformedHash);
    }

    let derived = derive_key(password, Some(&salt), iterations);
    Ok(bool::from(derived.key.as_slice().ct_eq(expected.as_slice())))
}
