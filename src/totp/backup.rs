//! Single-use backup codes.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::vault::token::random_bytes;

/// 4 random bytes, 8 lowercase hex characters.
pub const BACKUP_CODE_BYTES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCode {
    pub code: String,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
}

impl BackupCode {
    pub fn generate() -> Self {
        Self {
            code: hex::encode(random_bytes(BACKUP_CODE_BYTES)),
            used: false,
            used_at: None,
        }
    }
}

pub fn generate_backup_codes(count: usize) -> Vec<BackupCode> {
    (0..count).map(|_| BackupCode::generate()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackupCodeOutcome {
    pub valid: bool,
    pub remaining: usize,
}

/// A principal's backup codes. Redemption is atomic per code.
#[derive(Debug, Default)]
pub struct BackupCodes {
    codes: Mutex<Vec<BackupCode>>,
}

impl BackupCodes {
    pub fn new(codes: Vec<BackupCode>) -> Self {
        Self {
            codes: Mutex::new(codes),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BackupCode>> {
        self.codes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the first unused code matching `submitted` as used.
    pub fn redeem(&self, submitted: &str, now: DateTime<Utc>) -> BackupCodeOutcome {
        let submitted = submitted.trim().to_ascii_lowercase();
        let mut codes = self.lock();

        let hit = codes
            .iter()
            .position(|c| !c.used && bool::from(c.code.as_bytes().ct_eq(submitted.as_bytes())));
        if let Some(index) = hit {
            codes[index].used = true;
            codes[index].used_at = Some(now);
        }
        BackupCodeOutcome {
            valid: hit.is_some(),
            remaining: codes.iter().filter(|c| !c.used).count(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.lock().iter().filter(|c| !c.used).count()
    }

    pub fn snapshot(&self) -> Vec<BackupCode> {
        self.lock().clone()
    }

    /// Swap in a fresh set of codes.
    pub fn replace(&self, codes: Vec<BackupCode>) {
        *self.lock() = codes;
    }
}
