//! Per-principal enrollment state and second-factor verification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::config::TotpSettings;
use crate::observability::metrics;
use crate::totp::backup::{generate_backup_codes, BackupCode, BackupCodes};
use crate::totp::code::{encode_secret, verify_code, CODE_DIGITS, SECRET_BYTES, TIME_STEP_SECS};
use crate::totp::types::{TotpError, TotpResult, TotpSecret, TwoFactorOutcome, TwoFactorState};
use crate::vault::token::random_bytes;

/// Tokens at least this long are tried as backup codes.
const BACKUP_CODE_MIN_LEN: usize = 8;

struct Enrollment {
    state: TwoFactorState,
    secret: String,
    backup_codes: Arc<BackupCodes>,
}

impl std::fmt::Debug for Enrollment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enrollment")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Owns the 2FA state of every principal.
#[derive(Debug)]
pub struct TotpAuthenticator {
    enrollments: DashMap<String, Enrollment>,
    settings: TotpSettings,
    clock: Arc<dyn Clock>,
}

impl TotpAuthenticator {
    pub fn new(settings: TotpSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: TotpSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            enrollments: DashMap::new(),
            settings,
            clock,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.settings.issuer
    }

    /// Fresh secret, provisioning URI and backup codes. Stores nothing.
    pub fn generate_secret(&self, account: &str, issuer: &str) -> TotpResult<TotpSecret> {
        let secret = encode_secret(&random_bytes(SECRET_BYTES));
        let provisioning_uri = provisioning_uri(&secret, account, issuer)?;
        Ok(TotpSecret {
            secret,
            provisioning_uri,
            backup_codes: generate_backup_codes(self.settings.backup_code_count),
        })
    }

    /// Check a code against `secret` using the configured window.
    pub fn verify_code(&self, secret: &str, code: &str) -> bool {
        verify_code(secret, code, self.settings.window, self.clock.now_secs())
    }

    /// Disabled (or pending) → Pending with new material.
    pub fn begin_enrollment(&self, principal: &str, account: &str) -> TotpResult<TotpSecret> {
        let material = self.generate_secret(account, &self.settings.issuer)?;
        let mut entry = self
            .enrollments
            .entry(principal.to_string())
            .or_insert_with(|| Enrollment {
                state: TwoFactorState::Disabled,
                secret: String::new(),
                backup_codes: Arc::default(),
            });
        if entry.state == TwoFactorState::Enabled {
            return Err(TotpError::InvalidState {
                principal: principal.to_string(),
                expected: TwoFactorState::Disabled,
                actual: TwoFactorState::Enabled,
            });
        }
        entry.state = TwoFactorState::Pending;
        entry.secret = material.secret.clone();
        entry.backup_codes = Arc::new(BackupCodes::new(material.backup_codes.clone()));
        tracing::info!(principal = %principal, "Two-factor enrollment started");
        Ok(material)
    }

    /// Pending → Enabled when `code` is valid for the pending secret.
    pub fn confirm_enrollment(&self, principal: &str, code: &str) -> TotpResult<bool> {
        let secret = {
            let entry = self
                .enrollments
                .get(principal)
                .ok_or_else(|| state_error(principal, TwoFactorState::Pending, TwoFactorState::Disabled))?;
            if entry.state != TwoFactorState::Pending {
                return Err(state_error(principal, TwoFactorState::Pending, entry.state));
            }
            entry.secret.clone()
        };

        if !self.verify_code(&secret, code) {
            tracing::info!(principal = %principal, "Two-factor confirmation code rejected");
            return Ok(false);
        }

        let mut entry = self
            .enrollments
            .get_mut(principal)
            .ok_or_else(|| state_error(principal, TwoFactorState::Pending, TwoFactorState::Disabled))?;
        // A concurrent rotate or disable may have replaced the secret.
        if entry.state != TwoFactorState::Pending || entry.secret != secret {
            return Ok(false);
        }
        entry.state = TwoFactorState::Enabled;
        tracing::info!(principal = %principal, "Two-factor authentication enabled");
        Ok(true)
    }

    /// Any state → Disabled. Returns whether anything was enrolled.
    pub fn disable(&self, principal: &str) -> bool {
        let removed = self.enrollments.remove(principal).is_some();
        if removed {
            tracing::info!(principal = %principal, "Two-factor authentication disabled");
        }
        removed
    }

    /// Enabled → Pending with a fresh secret and codes. The old secret stops working.
    pub fn rotate(&self, principal: &str, account: &str) -> TotpResult<TotpSecret> {
        let material = self.generate_secret(account, &self.settings.issuer)?;
        let mut entry = self
            .enrollments
            .get_mut(principal)
            .ok_or_else(|| state_error(principal, TwoFactorState::Enabled, TwoFactorState::Disabled))?;
        if entry.state != TwoFactorState::Enabled {
            return Err(state_error(principal, TwoFactorState::Enabled, entry.state));
        }
        entry.state = TwoFactorState::Pending;
        entry.secret = material.secret.clone();
        entry.backup_codes = Arc::new(BackupCodes::new(material.backup_codes.clone()));
        tracing::info!(principal = %principal, "Two-factor secret rotated");
        Ok(material)
    }

    pub fn state(&self, principal: &str) -> TwoFactorState {
        self.enrollments
            .get(principal)
            .map_or(TwoFactorState::Disabled, |e| e.state)
    }

    pub fn remaining_backup_codes(&self, principal: &str) -> Option<usize> {
        self.enrollments
            .get(principal)
            .filter(|e| e.state == TwoFactorState::Enabled)
            .map(|e| e.backup_codes.remaining())
    }

    /// Replace an enabled principal's backup codes.
    pub fn regenerate_backup_codes(&self, principal: &str) -> TotpResult<Vec<BackupCode>> {
        let codes = {
            let entry = self
                .enrollments
                .get(principal)
                .ok_or_else(|| state_error(principal, TwoFactorState::Enabled, TwoFactorState::Disabled))?;
            if entry.state != TwoFactorState::Enabled {
                return Err(state_error(principal, TwoFactorState::Enabled, entry.state));
            }
            entry.backup_codes.clone()
        };
        let fresh = generate_backup_codes(self.settings.backup_code_count);
        codes.replace(fresh.clone());
        tracing::info!(principal = %principal, count = fresh.len(), "Backup codes regenerated");
        Ok(fresh)
    }

    /// Second-factor check at login: TOTP first, then backup codes.
    pub fn verify_attempt(&self, principal: &str, token: &str) -> TwoFactorOutcome {
        let enrolled = self
            .enrollments
            .get(principal)
            .filter(|e| e.state == TwoFactorState::Enabled)
            .map(|e| (e.secret.clone(), e.backup_codes.clone()));
        let Some((secret, backup_codes)) = enrolled else {
            tracing::debug!(principal = %principal, "Two-factor attempt for unenrolled principal");
            metrics::record_two_factor_attempt("none", false);
            return TwoFactorOutcome::invalid();
        };

        let token = token.trim();
        if token.len() == CODE_DIGITS && self.verify_code(&secret, token) {
            metrics::record_two_factor_attempt("totp", true);
            return TwoFactorOutcome::totp();
        }

        if token.len() >= BACKUP_CODE_MIN_LEN {
            let outcome = backup_codes.redeem(token, self.now());
            metrics::record_two_factor_attempt("backup_code", outcome.valid);
            if outcome.valid {
                tracing::info!(principal = %principal, remaining = outcome.remaining, "Backup code redeemed");
                return TwoFactorOutcome::backup_code(outcome.remaining);
            }
        } else {
            metrics::record_two_factor_attempt("totp", false);
        }
        TwoFactorOutcome::invalid()
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.clock.now_ms() as i64).unwrap_or_default()
    }
}

fn state_error(principal: &str, expected: TwoFactorState, actual: TwoFactorState) -> TotpError {
    TotpError::InvalidState {
        principal: principal.to_string(),
        expected,
        actual,
    }
}

/// `otpauth://totp/{issuer}:{account}?secret=…&issuer=…&algorithm=SHA1&digits=6&period=30`
pub fn provisioning_uri(secret: &str, account: &str, issuer: &str) -> TotpResult<String> {
    if account.trim().is_empty() || account.contains(':') {
        return Err(TotpError::InvalidLabel(account.to_string()));
    }
    if issuer.trim().is_empty() || issuer.contains(':') {
        return Err(TotpError::InvalidLabel(issuer.to_string()));
    }
    let mut uri = Url::parse("otpauth://totp/")?;
    uri.set_path(&format!("/{issuer}:{account}"));
    uri.query_pairs_mut()
        .append_pair("secret", secret)
        .append_pair("issuer", issuer)
        .append_pair("algorithm", "SHA1")
        .append_pair("digits", &CODE_DIGITS.to_string())
        .append_pair("period", &TIME_STEP_SECS.to_string());
    Ok(uri.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::totp::code::generate_code;
    use std::time::Duration;

    const START_MS: u64 = 1_700_000_000_000;

    fn authenticator() -> (TotpAuthenticator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        (
            TotpAuthenticator::with_clock(TotpSettings::default(), clock.clone()),
            clock,
        )
    }

    fn enable(auth: &TotpAuthenticator, clock: &ManualClock, principal: &str) -> TotpSecret {
        let material = auth.begin_enrollment(principal, principal).unwrap();
        let code = generate_code(&material.secret, clock.now_secs()).unwrap();
        assert!(auth.confirm_enrollment(principal, &code).unwrap());
        material
    }

    #[test]
    fn test_generate_secret_shape() {
        let (auth, _) = authenticator();
        let material = auth.generate_secret("alice", "Game Panel").unwrap();
        assert_eq!(material.secret.len(), 32);
        assert_eq!(material.backup_codes.len(), 10);

        let uri = Url::parse(&material.provisioning_uri).unwrap();
        assert_eq!(uri.scheme(), "otpauth");
        assert_eq!(uri.host_str(), Some("totp"));
        assert_eq!(uri.path(), "/Game%20Panel:alice");
        let pairs: Vec<(String, String)> = uri.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("secret".into(), material.secret.clone())));
        assert!(pairs.contains(&("issuer".into(), "Game Panel".into())));
        assert!(pairs.contains(&("digits".into(), "6".into())));
        assert!(pairs.contains(&("period".into(), "30".into())));
    }

    #[test]
    fn test_secrets_are_unique() {
        let (auth, _) = authenticator();
        let a = auth.generate_secret("a", "x").unwrap();
        let b = auth.generate_secret("a", "x").unwrap();
        assert_ne!(a.secret, b.secret);
    }

    #[test]
    fn test_label_validation() {
        assert!(matches!(
            provisioning_uri("AAAA", "bad:name", "x"),
            Err(TotpError::InvalidLabel(_))
        ));
        assert!(matches!(
            provisioning_uri("AAAA", "alice", ""),
            Err(TotpError::InvalidLabel(_))
        ));
    }

    #[test]
    fn test_enrollment_state_machine() {
        let (auth, clock) = authenticator();
        assert_eq!(auth.state("bob"), TwoFactorState::Disabled);

        let material = auth.begin_enrollment("bob", "bob").unwrap();
        assert_eq!(auth.state("bob"), TwoFactorState::Pending);
        assert_eq!(auth.remaining_backup_codes("bob"), None);

        assert!(!auth.confirm_enrollment("bob", "abcdef").unwrap());
        assert_eq!(auth.state("bob"), TwoFactorState::Pending);

        let code = generate_code(&material.secret, clock.now_secs()).unwrap();
        assert!(auth.confirm_enrollment("bob", &code).unwrap());
        assert_eq!(auth.state("bob"), TwoFactorState::Enabled);
        assert_eq!(auth.remaining_backup_codes("bob"), Some(10));

        assert!(matches!(
            auth.begin_enrollment("bob", "bob"),
            Err(TotpError::InvalidState { .. })
        ));
        assert!(matches!(
            auth.confirm_enrollment("bob", &code),
            Err(TotpError::InvalidState { .. })
        ));

        assert!(auth.disable("bob"));
        assert_eq!(auth.state("bob"), TwoFactorState::Disabled);
        assert!(!auth.disable("bob"));
    }

    #[test]
    fn test_confirm_without_enrollment_fails() {
        let (auth, _) = authenticator();
        assert_eq!(
            auth.confirm_enrollment("ghost", "123456"),
            Err(TotpError::InvalidState {
                principal: "ghost".into(),
                expected: TwoFactorState::Pending,
                actual: TwoFactorState::Disabled,
            })
        );
    }

    #[test]
    fn test_verify_attempt_totp_and_backup() {
        let (auth, clock) = authenticator();
        let material = enable(&auth, &clock, "carol");

        clock.advance(Duration::from_secs(30));
        let code = generate_code(&material.secret, clock.now_secs()).unwrap();
        assert_eq!(auth.verify_attempt("carol", &code), TwoFactorOutcome::totp());

        let backup = &material.backup_codes[0].code;
        assert_eq!(
            auth.verify_attempt("carol", backup),
            TwoFactorOutcome::backup_code(9)
        );
        assert_eq!(auth.verify_attempt("carol", backup), TwoFactorOutcome::invalid());
        assert_eq!(auth.remaining_backup_codes("carol"), Some(9));
    }

    #[test]
    fn test_short_tokens_never_consume_backup_codes() {
        let (auth, clock) = authenticator();
        enable(&auth, &clock, "dave");
        assert!(!auth.verify_attempt("dave", "1234567").success);
        assert_eq!(auth.remaining_backup_codes("dave"), Some(10));
    }

    #[test]
    fn test_unenrolled_attempt_is_invalid() {
        let (auth, _) = authenticator();
        assert_eq!(auth.verify_attempt("nobody", "123456"), TwoFactorOutcome::invalid());
    }

    #[test]
    fn test_rotate_discards_old_secret() {
        let (auth, clock) = authenticator();
        let old = enable(&auth, &clock, "erin");

        let fresh = auth.rotate("erin", "erin").unwrap();
        assert_ne!(old.secret, fresh.secret);
        assert_eq!(auth.state("erin"), TwoFactorState::Pending);

        let stale = generate_code(&old.secret, clock.now_secs()).unwrap();
        let current = generate_code(&fresh.secret, clock.now_secs()).unwrap();
        if stale != current {
            assert!(!auth.confirm_enrollment("erin", &stale).unwrap());
        }
        assert!(auth.confirm_enrollment("erin", &current).unwrap());
        assert!(!auth.verify_attempt("erin", &old.backup_codes[0].code).success);
    }

    #[test]
    fn test_rotate_requires_enabled() {
        let (auth, _) = authenticator();
        auth.begin_enrollment("frank", "frank").unwrap();
        assert!(matches!(
            auth.rotate("frank", "frank"),
            Err(TotpError::InvalidState {
                actual: TwoFactorState::Pending,
                ..
            })
        ));
    }

    #[test]
    fn test_regenerate_backup_codes() {
        let (auth, clock) = authenticator();
        let material = enable(&auth, &clock, "gina");
        auth.verify_attempt("gina", &material.backup_codes[0].code);
        assert_eq!(auth.remaining_backup_codes("gina"), Some(9));

        let fresh = auth.regenerate_backup_codes("gina").unwrap();
        assert_eq!(fresh.len(), 10);
        assert_eq!(auth.remaining_backup_codes("gina"), Some(10));
        assert!(!auth.verify_attempt("gina", &material.backup_codes[1].code).success);
        assert!(auth.verify_attempt("gina", &fresh[1].code).success);
    }
}
