//! Query filters over recorded events.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::event::{AuditEvent, AuditEventType, Severity};

pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Filters and pagination for `AuditLedger::query`. Empty filters match all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event_type: Option<AuditEventType>,
    pub actor_id: Option<String>,
    pub ip_address: Option<String>,
    pub severity: Option<Severity>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            event_type: None,
            actor_id: None,
            ip_address: None,
            severity: None,
            offset: 0,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if self.start.is_some_and(|start| event.timestamp < start) {
            return false;
        }
        if self.end.is_some_and(|end| event.timestamp > end) {
            return false;
        }
        if self.event_type.is_some_and(|t| event.event_type != t) {
            return false;
        }
        if let Some(actor_id) = &self.actor_id {
            if event.actor.as_ref().map(|a| &a.id) != Some(actor_id) {
                return false;
            }
        }
        if let Some(ip) = &self.ip_address {
            if &event.ip_address != ip {
                return false;
            }
        }
        if self.severity.is_some_and(|s| event.severity != s) {
            return false;
        }
        true
    }

    /// Files dated after `end` cannot hold matches.
    pub fn is_after_range(&self, file_date: NaiveDate) -> bool {
        self.end.is_some_and(|end| file_date > end.date_naive())
    }

    /// Files dated before `start` cannot hold matches.
    pub fn is_before_range(&self, file_date: NaiveDate) -> bool {
        self.start.is_some_and(|start| file_date < start.date_naive())
    }
}
