//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! limiter decisions, 2FA attempts, audit writes, integrity sweeps
//!     → logging.rs (tracing subscriber: pretty or JSON lines)
//!     → metrics.rs (guard_* counters and gauges)
//!
//! Scraped by Prometheus when the daemon enables the exporter.
//! ```
//!
//! # Design Decisions
//! - Secrets, codes and passwords never appear in fields
//! - Audit write failures surface here, never to the caller

pub mod logging;
pub mod metrics;
