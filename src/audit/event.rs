//! Audit event model and signing payload.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Every security-relevant action the panel records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // ── Authentication ──────────────────────────────────────
    LoginSuccess,
    LoginFailure,
    Logout,
    PasswordChanged,
    PasswordResetRequested,
    SessionCreated,
    SessionRevoked,

    // ── Two-factor ──────────────────────────────────────────
    TwoFactorEnabled,
    TwoFactorDisabled,
    TwoFactorVerified,
    TwoFactorFailed,
    BackupCodeUsed,
    BackupCodesRegenerated,

    // ── Accounts and access ─────────────────────────────────
    UserCreated,
    UserUpdated,
    UserDeleted,
    RoleChanged,
    PermissionChanged,

    // ── Game servers ────────────────────────────────────────
    ServerCreated,
    ServerStarted,
    ServerStopped,
    ServerDeleted,
    ConfigChanged,

    // ── Data ────────────────────────────────────────────────
    DataExport,
    DataDeletion,
    EncryptionKeyRotated,

    // ── Admission ───────────────────────────────────────────
    RateLimitExceeded,
    IpBlocked,
    IpUnblocked,
    SuspiciousActivity,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 30] = [
        AuditEventType::LoginSuccess,
        AuditEventType::LoginFailure,
        AuditEventType::Logout,
        AuditEventType::PasswordChanged,
        AuditEventType::PasswordResetRequested,
        AuditEventType::SessionCreated,
        AuditEventType::SessionRevoked,
        AuditEventType::TwoFactorEnabled,
        AuditEventType::TwoFactorDisabled,
        AuditEventType::TwoFactorVerified,
        AuditEventType::TwoFactorFailed,
        AuditEventType::BackupCodeUsed,
        AuditEventType::BackupCodesRegenerated,
        AuditEventType::UserCreated,
        AuditEventType::UserUpdated,
        AuditEventType::UserDeleted,
        AuditEventType::RoleChanged,
        AuditEventType::PermissionChanged,
        AuditEventType::ServerCreated,
        AuditEventType::ServerStarted,
        AuditEventType::ServerStopped,
        AuditEventType::ServerDeleted,
        AuditEventType::ConfigChanged,
        AuditEventType::DataExport,
        AuditEventType::DataDeletion,
        AuditEventType::EncryptionKeyRotated,
        AuditEventType::RateLimitExceeded,
        AuditEventType::IpBlocked,
        AuditEventType::IpUnblocked,
        AuditEventType::SuspiciousActivity,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoginSuccess => "login_success",
            AuditEventType::LoginFailure => "login_failure",
            AuditEventType::Logout => "logout",
            AuditEventType::PasswordChanged => "password_changed",
            AuditEventType::PasswordResetRequested => "password_reset_requested",
            AuditEventType::SessionCreated => "session_created",
            AuditEventType::SessionRevoked => "session_revoked",
            AuditEventType::TwoFactorEnabled => "two_factor_enabled",
            AuditEventType::TwoFactorDisabled => "two_factor_disabled",
            AuditEventType::TwoFactorVerified => "two_factor_verified",
            AuditEventType::TwoFactorFailed => "two_factor_failed",
            AuditEventType::BackupCodeUsed => "backup_code_used",
            AuditEventType::BackupCodesRegenerated => "backup_codes_regenerated",
            AuditEventType::UserCreated => "user_created",
            AuditEventType::UserUpdated => "user_updated",
            AuditEventType::UserDeleted => "user_deleted",
            AuditEventType::RoleChanged => "role_changed",
            AuditEventType::PermissionChanged => "permission_changed",
            AuditEventType::ServerCreated => "server_created",
            AuditEventType::ServerStarted => "server_started",
            AuditEventType::ServerStopped => "server_stopped",
            AuditEventType::ServerDeleted => "server_deleted",
            AuditEventType::ConfigChanged => "config_changed",
            AuditEventType::DataExport => "data_export",
            AuditEventType::DataDeletion => "data_deletion",
            AuditEventType::EncryptionKeyRotated => "encryption_key_rotated",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
            AuditEventType::IpBlocked => "ip_blocked",
            AuditEventType::IpUnblocked => "ip_unblocked",
            AuditEventType::SuspiciousActivity => "suspicious_activity",
        }
    }

    /// Severity assigned when the caller does not override it.
    pub const fn default_severity(&self) -> Severity {
        match self {
            AuditEventType::LoginFailure | AuditEventType::TwoFactorFailed => Severity::Medium,
            AuditEventType::PermissionChanged
            | AuditEventType::RoleChanged
            | AuditEventType::UserDeleted
            | AuditEventType::ServerDeleted
            | AuditEventType::DataDeletion
            | AuditEventType::SuspiciousActivity => Severity::High,
            _ => Severity::Low,
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown value: {0}")]
pub struct UnknownVariant(pub String);

impl std::str::FromStr for AuditEventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// High and critical events raise an alert.
    pub fn is_alert(&self) -> bool {
        *self >= Severity::High
    }
}

impl std::str::FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    #[default]
    Success,
    Failure,
}

impl AuditStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
        }
    }
}

/// Who performed the action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Request-side attributes supplied by the caller of `record`.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub actor: Option<Actor>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub status: AuditStatus,
    /// Overrides the event type's default severity.
    pub severity: Option<Severity>,
}

impl AuditContext {
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            ..Self::default()
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub action: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub status: AuditStatus,
    pub severity: Severity,
    #[serde(default)]
    pub signature: String,
}

impl AuditEvent {
    /// Build an unsigned event stamped with `now` (millisecond precision).
    pub fn new(
        event_type: AuditEventType,
        action: impl Into<String>,
        details: Map<String, Value>,
        context: AuditContext,
        now: DateTime<Utc>,
    ) -> Self {
        let timestamp = now
            .duration_trunc(TimeDelta::milliseconds(1))
            .unwrap_or(now);
        Self {
            id: Uuid::new_v4(),
            timestamp,
            event_type,
            actor: context.actor,
            ip_address: context.ip_address,
            user_agent: context.user_agent,
            action: action.into(),
            details,
            status: context.status,
            severity: context
                .severity
                .unwrap_or_else(|| event_type.default_severity()),
            signature: String::new(),
        }
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        signing_payload_of(serde_json::to_value(self)?)
    }
}

/// Canonical signing bytes of a serialized event: every field but `signature`,
/// keys in sorted order.
pub fn signing_payload_of(mut event: Value) -> Result<Vec<u8>, serde_json::Error> {
    if let Some(fields) = event.as_object_mut() {
        fields.remove("signature");
    }
    serde_json::to_vec(&event)
}
