//! AES-256-GCM with 128-bit nonces and detached tags.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};

use crate::vault::kdf::derive_key;
use crate::vault::token::random_bytes;
use crate::vault::types::{
    EncryptedPayload, KeyMaterial, VaultError, VaultResult, IV_LEN, KEY_LEN, SALT_LEN, TAG_LEN,
};

type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Encrypt `plaintext`. A new random IV is drawn on every call.
pub fn encrypt(
    plaintext: &[u8],
    key: KeyMaterial<'_>,
    iterations: u32,
) -> VaultResult<EncryptedPayload> {
    let (key_bytes, salt) = match key {
        KeyMaterial::Raw(raw) => (*raw, Vec::new()),
        KeyMaterial::Password(password) => {
            let derived = derive_key(password, None, iterations);
            (derived.key, derived.salt)
        }
    };

    let cipher = Aes256Gcm16::new_from_slice(&key_bytes)
        .map_err(|e| VaultError::InvalidKey(e.to_string()))?;

    let iv = random_bytes(IV_LEN);
    let nonce = Nonce::<U16>::from_slice(&iv);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(nonce, b"", &mut buffer)
        .map_err(|_| VaultError::InvalidKey("encryption failure".into()))?;

    Ok(EncryptedPayload {
        iv: hex::encode(&iv),
        ciphertext: hex::encode(&buffer),
        auth_tag: hex::encode(tag),
        salt: hex::encode(&salt),
    })
}

/// Decrypt and authenticate a payload.
///
/// Nothing is returned unless the tag verifies.
pub fn decrypt(
    payload: &EncryptedPayload,
    key: KeyMaterial<'_>,
    iterations: u32,
) -> VaultResult<Vec<u8>> {
    let iv = decode_field("iv", &payload.iv, Some(IV_LEN))?;
    let tag = decode_field("authTag", &payload.auth_tag, Some(TAG_LEN))?;
    let mut buffer = decode_field("ciphertext", &payload.ciphertext, None)?;

    let key_bytes: [u8; KEY_LEN] = match key {
        KeyMaterial::Raw(raw) => *raw,
        KeyMaterial::Password(password) => {
            let salt = decode_field("salt", &payload.salt, Some(SALT_LEN))?;
            derive_key(password, Some(&salt), iterations).key
        }
    };

    let cipher = Aes256Gcm16::new_from_slice(&key_bytes)
        .map_err(|e| VaultError::InvalidKey(e.to_string()))?;

    cipher
        .decrypt_in_place_detached(
            Nonce::<U16>::from_slice(&iv),
            b"",
            &mut buffer,
            Tag::<U16>::from_slice(&tag),
        )
        .map_err(|_| VaultError::AuthenticationFailed)?;

    Ok(buffer)
}

fn decode_field(name: &str, value: &str, expected_len: Option<usize>) -> VaultResult<Vec<u8>> {
    let bytes = hex::decode(value)
        .map_err(|e| VaultError::MalformedPayload(format!("{name} is not hex: {e}")))?;
    if let Some(len) = expected_len {
        if bytes.len() != len {
            return Err(VaultError::MalformedPayload(format!(
                "{name} must be {len} bytes, got {}",
                bytes.len()
            )));
        }
    }
    Ok(bytes)
}
