use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

const HEADER_KEYS: [&str; 3] = ["type", "session_id", "ts"];

/// Everything a studio session can write to its event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StudioEvent {
    SessionStarted,
    SourceLoaded,
    EditStarted,
    BackendAttempt,
    BackendFallback,
    EditSucceeded,
    EditFailed,
    EditDiscarded,
    Exported,
    CredentialSwitched,
}

impl StudioEvent {
    pub const ALL: [StudioEvent; 10] = [
        Self::SessionStarted,
        Self::SourceLoaded,
        Self::EditStarted,
        Self::BackendAttempt,
        Self::BackendFallback,
        Self::EditSucceeded,
        Self::EditFailed,
        Self::EditDiscarded,
        Self::Exported,
        Self::CredentialSwitched,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SourceLoaded => "source_loaded",
            Self::EditStarted => "edit_started",
            Self::BackendAttempt => "backend_attempt",
            Self::BackendFallback => "backend_fallback",
            Self::EditSucceeded => "edit_succeeded",
            Self::EditFailed => "edit_failed",
            Self::EditDiscarded => "edit_discarded",
            Self::Exported => "exported",
            Self::CredentialSwitched => "credential_switched",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == raw.trim())
    }
}

impl fmt::Display for StudioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSONL log for one studio session.
///
/// Every line starts with `type`, `session_id` and `ts`. Payload keys that
/// collide with those header fields are dropped. Clones append to the same
/// file under one lock.
#[derive(Debug, Clone)]
pub struct EventLog {
    target: Arc<LogTarget>,
}

#[derive(Debug)]
struct LogTarget {
    path: PathBuf,
    session_id: String,
    append: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            target: Arc::new(LogTarget {
                path: path.into(),
                session_id: session_id.into(),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn record(&self, event: StudioEvent, payload: EventPayload) -> anyhow::Result<Value> {
        let row = event_row(event, &self.target.session_id, payload);
        let line = serde_json::to_string(&row)?;

        let path = &self.target.path;
        let _guard = self
            .target
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        writeln!(file, "{line}")?;

        Ok(row)
    }
}

fn event_row(event: StudioEvent, session_id: &str, payload: EventPayload) -> Value {
    let mut row = Map::new();
    row.insert("type".to_string(), Value::from(event.as_str()));
    row.insert("session_id".to_string(), Value::from(session_id));
    row.insert(
        "ts".to_string(),
        Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
    );
    row.extend(
        payload
            .into_iter()
            .filter(|(key, _)| !HEADER_KEYS.contains(&key.as_str())),
    );
    Value::Object(row)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;

    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::{EventLog, EventPayload, StudioEvent};

    #[test]
    fn event_names_are_unique_and_parse_back() {
        let names: HashSet<&str> = StudioEvent::ALL.iter().map(|event| event.as_str()).collect();
        assert_eq!(names.len(), StudioEvent::ALL.len());
        for event in StudioEvent::ALL {
            assert_eq!(StudioEvent::parse(event.as_str()), Some(event));
        }
        assert_eq!(StudioEvent::parse("run_started"), None);
    }

    #[test]
    fn header_fields_cannot_be_overridden_by_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "session-7");

        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), json!("spoofed"));
        payload.insert("session_id".to_string(), json!("other"));
        payload.insert("model".to_string(), json!("gemini-2.5-flash-image"));
        let row = log.record(StudioEvent::BackendAttempt, payload)?;

        let written: Value = serde_json::from_str(fs::read_to_string(&path)?.trim_end())?;
        assert_eq!(written, row);
        assert_eq!(written["type"], json!("backend_attempt"));
        assert_eq!(written["session_id"], json!("session-7"));
        assert_eq!(written["model"], json!("gemini-2.5-flash-image"));
        DateTime::parse_from_rfc3339(written["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn clones_append_to_one_file_in_nested_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("out").join("events.jsonl");
        let log = EventLog::new(&path, "session-7");
        let shared = log.clone();

        log.record(StudioEvent::SourceLoaded, EventPayload::new())?;
        shared.record(StudioEvent::EditStarted, EventPayload::new())?;

        let types = fs::read_to_string(&path)?
            .lines()
            .map(|line| {
                serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|row| row["type"].as_str().and_then(StudioEvent::parse))
            })
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![Some(StudioEvent::SourceLoaded), Some(StudioEvent::EditStarted)]
        );
        Ok(())
    }

    #[test]
    fn record_fails_when_log_path_is_a_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = EventLog::new(temp.path(), "session-7");
        assert!(log
            .record(StudioEvent::Exported, EventPayload::new())
            .is_err());
        Ok(())
    }
}
