//! Admission control.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → blocklist.rs (reject blocked IPs outright)
//!     → threat.rs (record user agent, score reported signals)
//!     → rate_limit.rs (pick policy tier, spend a token)
//!     → auto-block when the risk score crosses the threshold
//!     → middleware.rs (403 / 429 / pass through)
//! ```
//!
//! # Design Decisions
//! - Blocked IPs never touch a bucket
//! - Fail closed: a blocked or exhausted client is denied
//! - Host-reported signals (2FA failures) feed the same threat score

pub mod blocklist;
pub mod middleware;
pub mod rate_limit;
pub mod threat;

pub use blocklist::{BlockDuration, BlockedIp, IpBlocklist};
pub use middleware::{admission_middleware, Admission};
pub use rate_limit::{
    AdmissionDecision, AdmissionStats, CleanupSummary, DenialReason, RateLimitDecision,
    RateLimitPolicy, RateLimiter, RequestContext, TokenBucket,
};
pub use threat::{fingerprint, ThreatAssessment, ThreatPattern};
