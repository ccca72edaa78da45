//! Tamper-evident audit ledger.
//!
//! # Data Flow
//! ```text
//! record(event_type, action, details, context)
//!     → event.rs (build, default severity, ms timestamp)
//!     → CryptoVault::generate_hmac over the canonical JSON
//!     → writer.rs (append one line to audit-YYYY-MM-DD.log, rotate by size)
//!     → alert channel for high/critical
//!
//! Readers:
//!     verify_integrity → recompute every signature, collect all issues
//!     query / export   → newest file first, newest line first
//!     cleanup          → drop files past retention
//! ```
//!
//! # Design Decisions
//! - A failed write never fails the caller
//! - Integrity problems are report data, not errors
//! - Single writer per directory; rotation holds the same lock as appends

pub mod event;
pub mod export;
pub mod ledger;
pub mod query;
pub mod writer;

use thiserror::Error;

pub use event::{Actor, AuditContext, AuditEvent, AuditEventType, AuditStatus, Severity};
pub use export::ExportFormat;
pub use ledger::{AuditLedger, IntegrityIssue, IntegrityReport, IssueKind};
pub use query::AuditQuery;
pub use writer::{file_name_for, list_log_files, LogFile, LogWriter};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
