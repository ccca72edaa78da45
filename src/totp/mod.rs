//! Time-based one-time passwords and backup codes.
//!
//! # Data Flow
//! ```text
//! Enrollment:
//!     begin_enrollment → secret + otpauth URI + backup codes (Pending)
//!     confirm_enrollment(code) → Enabled
//!
//! Login:
//!     verify_attempt(token)
//!         → code.rs (6 digits, ±window steps)
//!         → backup.rs (≥ 8 chars, single use)
//! ```
//!
//! # Design Decisions
//! - Secrets are 160 bits, base32 without padding
//! - The whole window is scanned on every check
//! - Guess limiting is the rate limiter's job

pub mod authenticator;
pub mod backup;
pub mod code;
pub mod types;

pub use authenticator::{provisioning_uri, TotpAuthenticator};
pub use backup::{generate_backup_codes, BackupCode, BackupCodeOutcome, BackupCodes};
pub use code::{generate_code, verify_code};
pub use types::{
    TotpError, TotpResult, TotpSecret, TwoFactorOutcome, TwoFactorState, VerificationMethod,
};
