//! Append-only audit log.
//!
//! Records who called what. Sinks are fire-and-forget: recording failures
//! are logged and dropped, never propagated into the call path.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// One audit event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Event type (e.g. `tool_used`, `session_closed`, `config_applied`)
    pub event_type: String,
    /// Event payload
    pub payload: Value,
}

impl AuditEvent {
    /// Event stamped now.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Append-only audit sink.
pub trait AuditSink: Send + Sync {
    /// Record one event. Must not fail the caller.
    fn record(&self, event: AuditEvent);
}

/// Sink appending JSONL to a file.
pub struct JsonlAuditSink {
    file: Mutex<std::fs::File>,
}

impl JsonlAuditSink {
    /// Open (or create) the audit log at `path`.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) {
        let Ok(line) = serde_json::to_string(&event) else {
            warn!("failed to render audit event");
            return;
        };
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{line}") {
            warn!(error = %e, "failed to append audit event");
        }
    }
}

/// Sink that forwards events into the tracing log (ephemeral runs, tests).
#[derive(Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            event_type = event.event_type,
            payload = %event.payload,
            "audit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_append_as_one_json_line_each() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();

        sink.record(AuditEvent::new(
            "tool_used",
            serde_json::json!({"tool": "search", "server": "github"}),
        ));
        sink.record(AuditEvent::new(
            "session_closed",
            serde_json::json!({"sessionId": "s1", "reason": "shutdown"}),
        ));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["eventType"], "tool_used");
        assert_eq!(first["payload"]["tool"], "search");
    }
}
