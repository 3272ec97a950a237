use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the service's `events.jsonl`.
///
/// - default fields are `event` and `ts`, plus `request_id` when recorded
///   through a [`RequestLog`]
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Scopes this log to one inbound request; every record carries the id.
    pub fn request(&self, request_id: impl Into<String>) -> RequestLog {
        RequestLog {
            log: self.clone(),
            request_id: request_id.into(),
        }
    }

    pub fn record(&self, event: &str, payload: EventPayload) -> anyhow::Result<Value> {
        self.append(event, None, payload)
    }

    fn append(
        &self,
        event: &str,
        request_id: Option<&str>,
        payload: EventPayload,
    ) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("event".to_string(), Value::String(event.to_string()));
        if let Some(request_id) = request_id {
            row.insert(
                "request_id".to_string(),
                Value::String(request_id.to_string()),
            );
        }
        row.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            row.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }
}

/// An [`EventLog`] bound to one request id.
#[derive(Debug, Clone)]
pub struct RequestLog {
    log: EventLog,
    request_id: String,
}

impl RequestLog {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn record(&self, event: &str, payload: EventPayload) -> anyhow::Result<Value> {
        self.log.append(event, Some(&self.request_id), payload)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn record_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path);

        let mut payload = EventPayload::new();
        payload.insert("call".to_string(), json!("image_generation"));
        let recorded = log.request("req-1").record("call_retry", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, recorded);
        assert_eq!(parsed["event"], json!("call_retry"));
        assert_eq!(parsed["request_id"], json!("req-1"));
        assert_eq!(parsed["call"], json!("image_generation"));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = EventLog::new(temp.path().join("events.jsonl"));

        let mut payload = EventPayload::new();
        payload.insert("event".to_string(), json!("override"));
        let recorded = log.record("original", payload)?;

        assert_eq!(recorded["event"], json!("override"));
        Ok(())
    }

    #[test]
    fn unscoped_records_have_no_request_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = EventLog::new(temp.path().join("events.jsonl"));

        let recorded = log.record("tls_verification_disabled", EventPayload::new())?;
        assert!(recorded.get("request_id").is_none());
        Ok(())
    }

    #[test]
    fn record_appends_lines_across_clones() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path);
        let scoped = log.request("req-2");

        log.record("one", EventPayload::new())?;
        scoped.record("two", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["event"], json!("one"));
        assert_eq!(second["event"], json!("two"));
        assert_eq!(second["request_id"], json!("req-2"));
        Ok(())
    }
}
