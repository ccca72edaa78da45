//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use panel_guard::audit::Actor;
use panel_guard::clock::ManualClock;
use panel_guard::config::GuardConfig;
use panel_guard::lifecycle::SecurityCore;
use tempfile::TempDir;

/// 2025-10-09T08:53:20Z
pub const START_MS: u64 = 1_760_000_000_000;

pub const AUDIT_KEY: &[u8] = b"integration-audit-key";

pub struct Harness {
    pub core: SecurityCore,
    pub clock: Arc<ManualClock>,
    pub dir: TempDir,
}

/// Build a core on a manual clock with its audit log in a temp dir.
pub fn harness(tweak: impl FnOnce(&mut GuardConfig)) -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let mut config = GuardConfig::default();
    config.audit.log_dir = dir.path().join("audit");
    config.vault.pbkdf2_iterations = 1_000;
    tweak(&mut config);

    let clock = Arc::new(ManualClock::new(START_MS));
    let core = SecurityCore::build(&config, AUDIT_KEY.to_vec(), None, clock.clone())
        .expect("security core");
    Harness { core, clock, dir }
}

pub fn actor(id: &str, username: &str) -> Actor {
    Actor {
        id: id.to_string(),
        username: username.to_string(),
        role: Some("admin".to_string()),
    }
}
