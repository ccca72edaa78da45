//! Security core for a game-server admin panel.
//!
//! Admission control, two-factor authentication, encryption helpers and a
//! tamper-evident audit ledger, wired together by [`SecurityCore`].

pub mod audit;
pub mod clock;
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod security;
pub mod totp;
pub mod vault;

pub use audit::AuditLedger;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GuardConfig;
pub use lifecycle::{BackgroundTasks, SecurityCore, Shutdown};
pub use security::RateLimiter;
pub use totp::TotpAuthenticator;
pub use vault::CryptoVault;
