//! Two-factor data types and errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::totp::backup::BackupCode;

/// Enrollment state of one principal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwoFactorState {
    #[default]
    Disabled,
    Pending,
    Enabled,
}

impl std::fmt::Display for TwoFactorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TwoFactorState::Disabled => "disabled",
            TwoFactorState::Pending => "pending",
            TwoFactorState::Enabled => "enabled",
        };
        f.write_str(s)
    }
}

/// Which factor satisfied a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Totp,
    BackupCode,
}

impl VerificationMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            VerificationMethod::Totp => "totp",
            VerificationMethod::BackupCode => "backup_code",
        }
    }
}

/// Freshly issued enrollment material. Shown to the user once.
#[derive(Clone, Serialize)]
pub struct TotpSecret {
    pub secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<BackupCode>,
}

impl std::fmt::Debug for TotpSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotpSecret")
            .field("secret", &"<redacted>")
            .field("backup_codes", &self.backup_codes.len())
            .finish()
    }
}

pub const MSG_TOTP_SUCCESS: &str = "TOTP success";
pub const MSG_BACKUP_CODE_USED: &str = "backup code used";
pub const MSG_INVALID: &str = "invalid";

/// Result of a second-factor attempt. Failure is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TwoFactorOutcome {
    pub success: bool,
    pub method: Option<VerificationMethod>,
    pub message: &'static str,
    /// Unused backup codes left after a backup-code redemption.
    pub remaining_backup_codes: Option<usize>,
}

impl TwoFactorOutcome {
    pub(crate) fn totp() -> Self {
        Self {
            success: true,
            method: Some(VerificationMethod::Totp),
            message: MSG_TOTP_SUCCESS,
            remaining_backup_codes: None,
        }
    }

    pub(crate) fn backup_code(remaining: usize) -> Self {
        Self {
            success: true,
            method: Some(VerificationMethod::BackupCode),
            message: MSG_BACKUP_CODE_USED,
            remaining_backup_codes: Some(remaining),
        }
    }

    pub(crate) fn invalid() -> Self {
        Self {
            success: false,
            method: None,
            message: MSG_INVALID,
            remaining_backup_codes: None,
        }
    }
}

/// Misuse of the enrollment state machine or bad inputs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TotpError {
    #[error("Invalid TOTP secret")]
    InvalidSecret,

    #[error("Invalid account label: {0}")]
    InvalidLabel(String),

    #[error("Principal {principal} is {actual}, expected {expected}")]
    InvalidState {
        principal: String,
        expected: TwoFactorState,
        actual: TwoFactorState,
    },

    #[error("Failed to build provisioning URI: {0}")]
    ProvisioningUri(#[from] url::ParseError),
}

pub type TotpResult<T> = Result<T, TotpError>;
