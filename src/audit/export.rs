//! JSON and CSV export of query results.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::audit::event::{AuditEvent, UnknownVariant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

const CSV_HEADER: &str =
    "id,timestamp,eventType,actorId,actorUsername,ipAddress,userAgent,action,status,severity,details";

pub fn to_json(events: &[AuditEvent]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(events)
}

pub fn to_csv(events: &[AuditEvent]) -> Result<String, serde_json::Error> {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for event in events {
        let details = serde_json::to_string(&event.details)?;
        let timestamp = event.timestamp.to_rfc3339();
        let id = event.id.to_string();
        let fields = [
            id.as_str(),
            timestamp.as_str(),
            event.event_type.as_str(),
            event.actor.as_ref().map_or("", |a| a.id.as_str()),
            event.actor.as_ref().map_or("", |a| a.username.as_str()),
            event.ip_address.as_str(),
            event.user_agent.as_deref().unwrap_or(""),
            event.action.as_str(),
            event.status.as_str(),
            event.severity.as_str(),
            details.as_str(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    Ok(out)
}

/// RFC 4180 quoting.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{AuditContext, AuditEventType};
    use chrono::Utc;
    use serde_json::{json, Map};

    fn event() -> AuditEvent {
        let mut details = Map::new();
        details.insert("note".into(), json!("a,b \"c\""));
        AuditEvent::new(
            AuditEventType::ConfigChanged,
            "update, settings",
            details,
            AuditContext::new("10.0.0.9").with_user_agent("curl/8"),
            Utc::now(),
        )
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_csv_export_shape() {
        let csv = to_csv(&[event()]).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row = lines.next().unwrap();
        assert!(row.contains(",config_changed,,,10.0.0.9,curl/8,\"update, settings\",success,low,"));
        assert!(row.ends_with("\"{\"\"note\"\":\"\"a,b \\\"\"c\\\"\"\"\"}\""));
    }

    #[test]
    fn test_json_export_is_array() {
        let events = vec![event(), event()];
        let parsed: Vec<AuditEvent> = serde_json::from_str(&to_json(&events).unwrap()).unwrap();
        assert_eq!(parsed, events);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
