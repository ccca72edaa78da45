//! Signed append-only audit ledger.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::audit::event::{signing_payload_of, AuditContext, AuditEvent, AuditEventType};
use crate::audit::export::{self, ExportFormat};
use crate::audit::query::AuditQuery;
use crate::audit::writer::{complete_lines, list_log_files, LogWriter};
use crate::audit::AuditError;
use crate::clock::{Clock, SystemClock};
use crate::config::AuditSettings;
use crate::observability::metrics;
use crate::vault::CryptoVault;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    SignatureMismatch,
    Unparsable { error: String },
    Unreadable { error: String },
}

/// One problem found by `verify_integrity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    pub file: PathBuf,
    /// 1-based line number, 0 for file-level issues.
    pub line: usize,
    pub event_id: Option<String>,
    #[serde(flatten)]
    pub kind: IssueKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub files_checked: usize,
    pub events_checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

/// Records, verifies and serves security events.
#[derive(Debug)]
pub struct AuditLedger {
    writer: LogWriter,
    signing_key: Vec<u8>,
    vault: Arc<CryptoVault>,
    alerts: broadcast::Sender<AuditEvent>,
    clock: Arc<dyn Clock>,
}

impl AuditLedger {
    pub fn new(settings: &AuditSettings, signing_key: impl Into<Vec<u8>>, vault: Arc<CryptoVault>) -> Self {
        let (alerts, _) = broadcast::channel(settings.alert_channel_capacity.max(1));
        Self {
            writer: LogWriter::new(&settings.log_dir, settings.max_file_bytes),
            signing_key: signing_key.into(),
            vault,
            alerts,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn log_dir(&self) -> &Path {
        self.writer.dir()
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.clock.now_ms() as i64).unwrap_or_default()
    }

    /// High and critical events recorded after subscribing.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AuditEvent> {
        self.alerts.subscribe()
    }

    /// Sign and append an event. I/O failures are logged and swallowed.
    pub fn record(
        &self,
        event_type: AuditEventType,
        action: &str,
        details: Map<String, Value>,
        context: AuditContext,
    ) -> AuditEvent {
        let mut event = AuditEvent::new(event_type, action, details, context, self.now());
        if let Err(e) = self.sign_and_append(&mut event) {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Failed to write audit event"
            );
            metrics::record_audit_write_failure();
        }
        metrics::record_audit_event(event.severity.as_str());

        if event.severity.is_alert() {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                severity = event.severity.as_str(),
                ip = %event.ip_address,
                action = %event.action,
                "Security alert"
            );
            // No subscribers is fine.
            let _ = self.alerts.send(event.clone());
        }
        event
    }

    fn sign_and_append(&self, event: &mut AuditEvent) -> Result<(), AuditError> {
        let payload = event.signing_payload()?;
        event.signature = self.vault.generate_hmac(&payload, &self.signing_key);
        let line = serde_json::to_string(event)?;
        self.writer.append(&line, event.timestamp)
    }

    /// Recompute every signature in every retained file.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let mut report = IntegrityReport {
            valid: true,
            files_checked: 0,
            events_checked: 0,
            issues: Vec::new(),
        };

        let files = match list_log_files(self.writer.dir()) {
            Ok(files) => files,
            Err(e) => {
                report.issues.push(IntegrityIssue {
                    file: self.writer.dir().to_path_buf(),
                    line: 0,
                    event_id: None,
                    kind: IssueKind::Unreadable {
                        error: e.to_string(),
                    },
                });
                Vec::new()
            }
        };

        for file in files {
            report.files_checked += 1;
            let content = match fs::read_to_string(&file.path) {
                Ok(content) => content,
                Err(e) => {
                    report.issues.push(IntegrityIssue {
                        file: file.path.clone(),
                        line: 0,
                        event_id: None,
                        kind: IssueKind::Unreadable {
                            error: e.to_string(),
                        },
                    });
                    continue;
                }
            };
            // An unterminated tail is an append in flight.
            let end = content.rfind('\n').map_or(0, |i| i + 1);
            for (index, line) in content[..end].lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                report.events_checked += 1;
                if let Some(kind) = self.check_line(line) {
                    report.issues.push(IntegrityIssue {
                        file: file.path.clone(),
                        line: index + 1,
                        event_id: event_id_of(line),
                        kind,
                    });
                }
            }
        }

        report.valid = report.issues.is_empty();
        metrics::record_integrity_issues(report.issues.len());
        if report.valid {
            tracing::info!(
                files = report.files_checked,
                events = report.events_checked,
                "Audit integrity check passed"
            );
        } else {
            tracing::warn!(
                files = report.files_checked,
                events = report.events_checked,
                issues = report.issues.len(),
                "Audit integrity check found issues"
            );
        }
        report
    }

    fn check_line(&self, line: &str) -> Option<IssueKind> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                return Some(IssueKind::Unparsable {
                    error: e.to_string(),
                })
            }
        };
        let Some(signature) = value.get("signature").and_then(Value::as_str).map(str::to_owned) else {
            return Some(IssueKind::SignatureMismatch);
        };
        let payload = match signing_payload_of(value) {
            Ok(payload) => payload,
            Err(e) => {
                return Some(IssueKind::Unparsable {
                    error: e.to_string(),
                })
            }
        };
        match self.vault.verify_hmac(&payload, &signature, &self.signing_key) {
            Ok(()) => None,
            Err(_) => Some(IssueKind::SignatureMismatch),
        }
    }

    /// Matching events, newest first.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        let mut events = Vec::new();
        if query.limit == 0 {
            return Ok(events);
        }
        let mut skipped = 0;
        for file in list_log_files(self.writer.dir())? {
            if query.is_after_range(file.date) {
                continue;
            }
            if query.is_before_range(file.date) {
                break;
            }
            let content = match fs::read_to_string(&file.path) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(file = %file.path.display(), error = %e, "Skipping unreadable audit file");
                    continue;
                }
            };
            for line in complete_lines(&content).rev() {
                let Ok(event) = serde_json::from_str::<AuditEvent>(line) else {
                    continue;
                };
                if !query.matches(&event) {
                    continue;
                }
                if skipped < query.offset {
                    skipped += 1;
                    continue;
                }
                events.push(event);
                if events.len() >= query.limit {
                    return Ok(events);
                }
            }
        }
        Ok(events)
    }

    pub fn export(&self, query: &AuditQuery, format: ExportFormat) -> Result<String, AuditError> {
        let events = self.query(query)?;
        let out = match format {
            ExportFormat::Json => export::to_json(&events)?,
            ExportFormat::Csv => export::to_csv(&events)?,
        };
        tracing::info!(events = events.len(), format = ?format, "Audit events exported");
        Ok(out)
    }

    /// Delete audit files last modified more than `retention_days` ago.
    /// Today's active file is kept regardless.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize, AuditError> {
        let now = self.now();
        let active = self.writer.active_path(now);
        let retention_ms = u64::from(retention_days) * 86_400_000;
        let cutoff = UNIX_EPOCH + Duration::from_millis(self.clock.now_ms().saturating_sub(retention_ms));

        let mut removed = 0;
        for file in list_log_files(self.writer.dir())? {
            if file.path == active {
                continue;
            }
            let modified = match fs::metadata(&file.path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    tracing::warn!(file = %file.path.display(), error = %e, "Cannot read audit file age");
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(file = %file.path.display(), "Expired audit file removed");
                }
                Err(e) => {
                    tracing::error!(file = %file.path.display(), error = %e, "Failed to remove audit file");
                }
            }
        }
        Ok(removed)
    }

    pub fn rotate_if_needed(&self) -> Result<Option<PathBuf>, AuditError> {
        self.writer.rotate_if_needed(self.now())
    }
}

fn event_id_of(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(str::to_owned)
}
