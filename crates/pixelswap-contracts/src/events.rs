use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type EventPayload = Map<String, Value>;

/// Session log shared by the page loop, the bus and the dispatcher thread.
///
/// Each line is one compact JSON object: `type`, `session_id`, `seq` and
/// `ts`, then the payload keys (which win on collision). `seq` counts from 0
/// and is assigned under the file lock, so line order and `seq` order agree
/// across every clone of the writer.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<SessionLog>,
}

#[derive(Debug)]
struct SessionLog {
    path: PathBuf,
    session_id: String,
    next_seq: Mutex<u64>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(SessionLog {
                path: path.into(),
                session_id: session_id.into(),
                next_seq: Mutex::new(0),
            }),
        }
    }

    /// Appends one event and returns the line as written.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let log = &self.shared;
        if let Some(parent) = log.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut next_seq = log
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("session log lock poisoned"))?;
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(log.session_id.clone()),
        );
        event.insert("seq".to_string(), Value::from(*next_seq));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        event.extend(payload);

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.path)?
            .write_all(line.as_bytes())?;
        *next_seq += 1;

        Ok(Value::Object(event))
    }
}

/// Emits on an optional writer. Logging must never fail the caller, so write
/// errors are reported on stderr and swallowed.
pub fn emit_quiet(events: Option<&EventWriter>, event_type: &str, payload: EventPayload) {
    let Some(writer) = events else {
        return;
    };
    if let Err(err) = writer.emit(event_type, payload) {
        eprintln!("pixelswap: failed to record {event_type} event: {err:#}");
    }
}

/// Reads every event type recorded in `path`, in order. Unparseable lines are skipped.
pub fn read_event_types(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
        .collect())
}

pub fn new_session_id() -> String {
    format!("session-{}", Uuid::new_v4())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
