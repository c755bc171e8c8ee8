use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// One security audit entry: a stable reason code plus structured context.
#[derive(Clone, Debug, Serialize)]
pub struct AuditRecord {
    pub ts: String,
    pub reason: String,
    #[serde(flatten)]
    pub fields: Value,
}

enum SinkInner {
    File(Mutex<BufWriter<File>>),
    Memory(Mutex<Vec<AuditRecord>>),
}

/// Append-only JSONL sink for security denials. Writes never fail the
/// request path; IO errors are logged and swallowed.
pub struct AuditSink {
    inner: SinkInner,
}

impl AuditSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: SinkInner::File(Mutex::new(BufWriter::new(file))),
        })
    }

    /// In-memory sink for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            inner: SinkInner::Memory(Mutex::new(Vec::new())),
        }
    }

    /// Record a denial with its stable reason code.
    pub fn record(&self, reason: &str, fields: Value) {
        let record = AuditRecord {
            ts: Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            fields,
        };
        tracing::info!(target: "glimpse::audit", reason = %record.reason, "security event");
        match &self.inner {
            SinkInner::File(writer) => {
                let mut writer = writer.lock();
                if let Ok(line) = serde_json::to_string(&record) {
                    if writeln!(writer, "{line}").and_then(|_| writer.flush()).is_err() {
                        tracing::warn!(reason = %record.reason, "failed to write audit record");
                    }
                }
            }
            SinkInner::Memory(records) => records.lock().push(record),
        }
    }

    /// Recorded entries (memory sink only; empty for file sinks).
    pub fn entries(&self) -> Vec<AuditRecord> {
        match &self.inner {
            SinkInner::File(_) => Vec::new(),
            SinkInner::Memory(records) => records.lock().clone(),
        }
    }

    /// Reason codes recorded so far, in order (memory sink only).
    pub fn reasons(&self) -> Vec<String> {
        self.entries().into_iter().map(|r| r.reason).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_sink_captures_records() {
        let sink = AuditSink::in_memory();
        sink.record("bad_nonce_sig", json!({"sid": "viewer-1"}));
        sink.record("rate_limited_event", json!({"sid": "viewer-2"}));

        let reasons = sink.reasons();
        assert_eq!(reasons, vec!["bad_nonce_sig", "rate_limited_event"]);
        assert_eq!(sink.entries()[0].fields["sid"], "viewer-1");
    }

    #[test]
    fn file_sink_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security.log");
        let sink = AuditSink::open(&path).unwrap();
        sink.record("origin_rejected", json!({"origin": "https://evil.example"}));

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["reason"], "origin_rejected");
        assert_eq!(parsed["origin"], "https://evil.example");
    }

    #[test]
    fn record_serializes_flattened_fields() {
        let record = AuditRecord {
            ts: "2024-01-01T00:00:00Z".into(),
            reason: "missing_auth".into(),
            fields: json!({"namespace": "/ctrl"}),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["reason"], "missing_auth");
        assert_eq!(value["namespace"], "/ctrl");
    }
}
