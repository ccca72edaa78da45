//! Secret resolution from environment variables.
//!
//! # Security Constraints
//! - Secrets are read ONLY from environment variables named in config
//! - Secret values are never logged
//! - In production a missing secret is a configuration error; in
//!   development a placeholder is substituted with a warning

use crate::config::loader::ConfigError;
use crate::config::schema::{Environment, GuardConfig};
use crate::vault::KEY_LEN;

/// Development-only audit signing key. Rejected in production.
pub const DEV_AUDIT_SIGNING_KEY: &str = "DEVELOPMENT_ONLY_CHANGE_ME";

/// Resolve the audit signing key named by `audit.signing_key_env`.
pub fn audit_signing_key(config: &GuardConfig) -> Result<Vec<u8>, ConfigError> {
    let name = &config.audit.signing_key_env;
    let value = std::env::var(name).ok();
    resolve_signing_key(name, value.as_deref(), config.environment)
}

/// Resolve the vault master key named by `vault.master_key_env`.
///
/// Returns `Ok(None)` in development when the variable is unset.
pub fn vault_master_key(config: &GuardConfig) -> Result<Option<[u8; KEY_LEN]>, ConfigError> {
    let name = &config.vault.master_key_env;
    let value = std::env::var(name).ok();
    resolve_master_key(name, value.as_deref(), config.environment)
}

fn resolve_signing_key(
    name: &str,
    value: Option<&str>,
    environment: Environment,
) -> Result<Vec<u8>, ConfigError> {
    match (value.map(str::trim), environment) {
        (Some(v), Environment::Production) if v.is_empty() || v == DEV_AUDIT_SIGNING_KEY => {
            Err(ConfigError::InvalidSecret {
                name: name.to_string(),
                reason: "placeholder or empty value in production".into(),
            })
        }
        (None, Environment::Production) => Err(ConfigError::MissingSecret(name.to_string())),
        (Some(v), _) if !v.is_empty() => Ok(v.as_bytes().to_vec()),
        _ => {
            tracing::warn!(
                variable = %name,
                "Audit signing key not set; using development placeholder"
            );
            Ok(DEV_AUDIT_SIGNING_KEY.as_bytes().to_vec())
        }
    }
}

fn resolve_master_key(
    name: &str,
    value: Option<&str>,
    environment: Environment,
) -> Result<Option<[u8; KEY_LEN]>, ConfigError> {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        if environment == Environment::Production {
            return Err(ConfigError::MissingSecret(name.to_string()));
        }
        tracing::warn!(
            variable = %name,
            "Vault master key not set; seal/open are unavailable"
        );
        return Ok(None);
    };

    let bytes = hex::decode(raw).map_err(|_| ConfigError::InvalidSecret {
        name: name.to_string(),
        reason: "must be hex".into(),
    })?;
    let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| ConfigError::InvalidSecret {
        name: name.to_string(),
        reason: format!("must decode to {KEY_LEN} bytes"),
    })?;
    Ok(Some(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "TEST_KEY";

    #[test]
    fn test_signing_key_development_placeholder() {
        let key = resolve_signing_key(NAME, None, Environment::Development).unwrap();
        assert_eq!(key, DEV_AUDIT_SIGNING_KEY.as_bytes());
    }

    #[test]
    fn test_signing_key_production_rules() {
        assert!(matches!(
            resolve_signing_key(NAME, None, Environment::Production),
            Err(ConfigError::MissingSecret(_))
        ));
        assert!(matches!(
            resolve_signing_key(NAME, Some(DEV_AUDIT_SIGNING_KEY), Environment::Production),
            Err(ConfigError::InvalidSecret { .. })
        ));
        let key = resolve_signing_key(NAME, Some("s3cret"), Environment::Production).unwrap();
        assert_eq!(key, b"s3cret");
    }

    #[test]
    fn test_master_key_parsing() {
        assert_eq!(
            resolve_master_key(NAME, None, Environment::Development).unwrap(),
            None
        );
        assert!(matches!(
            resolve_master_key(NAME, None, Environment::Production),
            Err(ConfigError::MissingSecret(_))
        ));
        assert!(matches!(
            resolve_master_key(NAME, Some("xyz"), Environment::Development),
            Err(ConfigError::InvalidSecret { .. })
        ));
        assert!(matches!(
            resolve_master_key(NAME, Some("abcd"), Environment::Development),
            Err(ConfigError::InvalidSecret { .. })
        ));
        let key = resolve_master_key(NAME, Some(&"ab".repeat(32)), Environment::Production)
            .unwrap()
            .unwrap();
        assert_eq!(key, [0xAB; KEY_LEN]);
    }
}
