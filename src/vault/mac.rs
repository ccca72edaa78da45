//! HMAC-SHA256 signing and verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::vault::types::{VaultError, VaultResult};

type HmacSha256 = Hmac<Sha256>;

/// Compute a hex HMAC-SHA256 of `data` under `key`.
pub fn generate_hmac(data: &[u8], key: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex MAC in constant time.
pub fn verify_hmac(data: &[u8], mac_hex: &str, key: &[u8]) -> VaultResult<()> {
    let expected = hex::decode(mac_hex)
        .map_err(|e| VaultError::MalformedPayload(format!("mac is not hex: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
    mac.update(data);
    mac.verify_slice(&expected)
        .map_err(|_| VaultError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4231_case_2() {
        let mac = generate_hmac(b"what do ya want for nothing?", b"Jefe");
        assert_eq!(
            mac,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_accepts_valid_and_rejects_altered() {
        let mac = generate_hmac(b"payload", b"key");
        assert!(verify_hmac(b"payload", &mac, b"key").is_ok());
        assert_eq!(
            verify_hmac(b"payload!", &mac, b"key"),
            Err(VaultError::VerificationFailed)
        );
        assert_eq!(
            verify_hmac(b"payload", &mac, b"other"),
            Err(VaultError::VerificationFailed)
        );
    }

    #[test]
    fn test_verify_rejects_non_hex_and_truncated() {
        assert!(matches!(
            verify_hmac(b"payload", "not-hex", b"key"),
            Err(VaultError::MalformedPayload(_))
        ));
        let mac = generate_hmac(b"payload", b"key");
        assert_eq!(
            verify_hmac(b"payload", &mac[..32], b"key"),
            Err(VaultError::VerificationFailed)
        );
    }
}
