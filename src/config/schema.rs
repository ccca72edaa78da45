//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Deployment environment; `production` turns placeholder secrets into errors.
    pub environment: Environment,

    /// Admission control settings.
    pub rate_limit: RateLimitSettings,

    /// Two-factor authentication settings.
    pub totp: TotpSettings,

    /// Encryption settings.
    pub vault: VaultSettings,

    /// Audit ledger settings.
    pub audit: AuditSettings,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Enable admission control. When disabled every request is allowed.
    pub enabled: bool,

    /// Default refill window in milliseconds.
    pub window_ms: u64,

    /// Default bucket capacity (requests per window).
    pub max_requests: u32,

    /// Tighten the policy for clients with a high threat score.
    pub adaptive: bool,

    /// Threat level assumed for every client, in [0, 1].
    pub base_threat_level: f64,

    /// Block IPs whose risk score reaches `auto_block_score`.
    pub auto_block_enabled: bool,

    /// Risk score (0-100) at which an IP is blocked.
    pub auto_block_score: u8,

    /// Duration of an automatic block in seconds.
    pub auto_block_secs: u64,

    /// Interval of the bucket / blocklist cleanup task in seconds.
    pub cleanup_interval_secs: u64,

    /// Buckets untouched for this long are evicted by cleanup.
    pub idle_bucket_ttl_secs: u64,

    /// Length of the admission statistics window in seconds.
    pub stats_window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 900_000,
            max_requests: 100,
            adaptive: true,
            base_threat_level: 0.0,
            auto_block_enabled: true,
            auto_block_score: 75,
            auto_block_secs: 3600,
            cleanup_interval_secs: 3600,
            idle_bucket_ttl_secs: 3600,
            stats_window_secs: 60,
        }
    }
}

/// Two-factor configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TotpSettings {
    /// Issuer shown in authenticator apps.
    pub issuer: String,

    /// Number of 30 second steps accepted on each side of now.
    pub window: u8,

    /// Backup codes issued per enrollment.
    pub backup_code_count: usize,
}

impl Default for TotpSettings {
    fn default() -> Self {
        Self {
            issuer: "Game Panel".to_string(),
            window: 1,
            backup_code_count: 10,
        }
    }
}

/// Encryption configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VaultSettings {
    /// PBKDF2-HMAC-SHA256 iteration count.
    pub pbkdf2_iterations: u32,

    /// Environment variable holding the 64-hex-char master key.
    pub master_key_env: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 100_000,
            master_key_env: "PANEL_GUARD_MASTER_KEY".to_string(),
        }
    }
}

/// Audit ledger configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Directory holding one log file per day.
    pub log_dir: PathBuf,

    /// Rotate the active file once it would exceed this size.
    pub max_file_bytes: u64,

    /// Files older than this are removed by retention cleanup.
    pub retention_days: u32,

    /// Interval of the integrity sweep in seconds.
    pub integrity_interval_secs: u64,

    /// Interval of the retention cleanup in seconds.
    pub retention_interval_secs: u64,

    /// Interval of the size-based rotation check in seconds.
    pub rotation_check_secs: u64,

    /// Environment variable holding the event signing key.
    pub signing_key_env: String,

    /// Buffered high-severity alerts per subscriber.
    pub alert_channel_capacity: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs/audit"),
            max_file_bytes: 100 * 1024 * 1024, // 100MB
            retention_days: 90,
            integrity_interval_secs: 86_400,
            retention_interval_secs: 86_400,
            rotation_check_secs: 3600,
            signing_key_env: "PANEL_GUARD_AUDIT_KEY".to_string(),
            alert_channel_capacity: 64,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = GuardConfig::default();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.rate_limit.window_ms, 900_000);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.vault.pbkdf2_iterations, 100_000);
        assert_eq!(config.audit.max_file_bytes, 104_857_600);
        assert_eq!(config.audit.retention_days, 90);
        assert_eq!(config.totp.backup_code_count, 10);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: GuardConfig = toml::from_str(
            r#"
            environment = "production"

            [rate_limit]
            max_requests = 20

            [audit]
            log_dir = "/var/log/panel/audit"
            "#,
        )
        .unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.rate_limit.max_requests, 20);
        assert_eq!(config.rate_limit.window_ms, 900_000);
        assert_eq!(config.audit.log_dir, PathBuf::from("/var/log/panel/audit"));
        assert_eq!(config.audit.retention_days, 90);
    }
}
