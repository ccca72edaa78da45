//! Configuration validation.
//!
//! Semantic checks that serde cannot express. Every problem is collected so
//! an operator sees the full list in one pass.

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::GuardConfig;

/// Lowest PBKDF2 work factor accepted from configuration.
pub const MIN_PBKDF2_ITERATIONS: u32 = 10_000;

/// A single semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let rl = &config.rate_limit;
    if rl.window_ms == 0 {
        errors.push(ValidationError::new("rate_limit.window_ms", "must be greater than 0"));
    }
    if rl.max_requests == 0 {
        errors.push(ValidationError::new("rate_limit.max_requests", "must be greater than 0"));
    }
    if !(0.0..=1.0).contains(&rl.base_threat_level) {
        errors.push(ValidationError::new(
            "rate_limit.base_threat_level",
            "must be within [0, 1]",
        ));
    }
    if rl.auto_block_score > 100 {
        errors.push(ValidationError::new("rate_limit.auto_block_score", "must be at most 100"));
    }
    for (field, value) in [
        ("rate_limit.cleanup_interval_secs", rl.cleanup_interval_secs),
        ("rate_limit.stats_window_secs", rl.stats_window_secs),
        ("audit.integrity_interval_secs", config.audit.integrity_interval_secs),
        ("audit.retention_interval_secs", config.audit.retention_interval_secs),
        ("audit.rotation_check_secs", config.audit.rotation_check_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    if config.totp.issuer.trim().is_empty() {
        errors.push(ValidationError::new("totp.issuer", "must not be empty"));
    }
    if config.totp.issuer.contains(':') {
        errors.push(ValidationError::new("totp.issuer", "must not contain ':'"));
    }
    if config.totp.window > 10 {
        errors.push(ValidationError::new("totp.window", "must be at most 10"));
    }
    if config.totp.backup_code_count == 0 {
        errors.push(ValidationError::new("totp.backup_code_count", "must be greater than 0"));
    }

    if config.vault.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
        errors.push(ValidationError::new(
            "vault.pbkdf2_iterations",
            format!("must be at least {MIN_PBKDF2_ITERATIONS}"),
        ));
    }

    if config.audit.max_file_bytes < 1024 {
        errors.push(ValidationError::new("audit.max_file_bytes", "must be at least 1024"));
    }
    if config.audit.retention_days == 0 {
        errors.push(ValidationError::new("audit.retention_days", "must be greater than 0"));
    }
    if config.audit.alert_channel_capacity == 0 {
        errors.push(ValidationError::new(
            "audit.alert_channel_capacity",
            "must be greater than 0",
        ));
    }
    if config.audit.log_dir.as_os_str().is_empty() {
        errors.push(ValidationError::new("audit.log_dir", "must not be empty"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GuardConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = GuardConfig::default();
        config.rate_limit.window_ms = 0;
        config.rate_limit.max_requests = 0;
        config.vault.pbkdf2_iterations = 10;
        config.totp.issuer = "Bad:Issuer".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "rate_limit.window_ms",
                "rate_limit.max_requests",
                "totp.issuer",
                "vault.pbkdf2_iterations",
            ]
        );
    }

    #[test]
    fn test_metrics_address_checked_only_when_enabled() {
        let mut config = GuardConfig::default();
        config.observability.metrics_address = "nope".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "observability.metrics_address");
        assert_eq!(
            errors[0].to_string(),
            "observability.metrics_address: must be a socket address"
        );
    }
}
