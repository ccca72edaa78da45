//! RFC 6238 code engine (HMAC-SHA1, 30 s step, 6 digits).

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::{Choice, ConstantTimeEq};

use crate::totp::types::{TotpError, TotpResult};

pub const TIME_STEP_SECS: u64 = 30;
pub const CODE_DIGITS: usize = 6;
/// 160-bit secrets, 32 base32 characters.
pub const SECRET_BYTES: usize = 20;

const BASE32: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

pub fn encode_secret(bytes: &[u8]) -> String {
    base32::encode(BASE32, bytes)
}

/// Decode a base32 secret, tolerating lowercase, spaces and padding.
pub fn decode_secret(secret: &str) -> TotpResult<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    base32::decode(BASE32, &normalized)
        .filter(|bytes| !bytes.is_empty())
        .ok_or(TotpError::InvalidSecret)
}

fn hotp(key: &[u8], counter: u64) -> TotpResult<u32> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| TotpError::InvalidSecret)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    Ok(binary % 1_000_000)
}

/// The code for the step containing `unix_secs`.
pub fn generate_code(secret: &str, unix_secs: u64) -> TotpResult<String> {
    let key = decode_secret(secret)?;
    let value = hotp(&key, unix_secs / TIME_STEP_SECS)?;
    Ok(format!("{value:06}"))
}

/// Check `code` against every step in `[t - window, t + window]`.
///
/// All steps are compared even after a match.
pub fn verify_code(secret: &str, code: &str, window: u8, unix_secs: u64) -> bool {
    let code = code.trim();
    if code.len() != CODE_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let Ok(key) = decode_secret(secret) else {
        tracing::warn!("TOTP verification against undecodable secret");
        return false;
    };

    let current = unix_secs / TIME_STEP_SECS;
    let window = u64::from(window);
    let mut matched = Choice::from(0u8);
    for step in current.saturating_sub(window)..=current.saturating_add(window) {
        let Ok(value) = hotp(&key, step) else {
            return false;
        };
        let expected = format!("{value:06}");
        matched |= expected.as_bytes().ct_eq(code.as_bytes());
    }
    matched.into()
}
