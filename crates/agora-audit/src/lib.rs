//! Event log
//!
//! Every kernel decision lands in an append-only JSONL file under a
//! per-run directory, one JSON object per line with a monotonically
//! increasing `sequence`. A `latest` symlink always points at the most
//! recent run. The in-memory variant backs tests and the `events`
//! query without touching disk.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Periodic world snapshot appended to `summary.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct SummarySnapshot {
    pub timestamp: String,
    pub event_number: u64,
    pub action_count: u64,
    pub principal_count: usize,
    pub artifact_count: usize,
    pub total_scrip: i64,
}

/// Sink for kernel events. Logging never fails the caller; sinks
/// swallow and report their own I/O trouble.
pub trait EventLog: Send {
    /// Append one event; `fields` are merged beside the envelope.
    fn log(&mut self, event_type: &str, fields: Map<String, Value>);

    fn log_summary(&mut self, snapshot: &SummarySnapshot);

    /// Last `n` events, oldest first.
    fn read_recent(&self, n: usize) -> Vec<Value>;

    /// Events `[offset, offset + limit)` in append order.
    fn read_slice(&self, offset: usize, limit: usize) -> Vec<Value>;

    fn sequence(&self) -> u64;
}

fn envelope(sequence: u64, event_type: &str, fields: Map<String, Value>) -> Value {
    let mut payload = Map::new();
    payload.insert(
        "timestamp".to_string(),
        Value::from(Utc::now().to_rfc3339()),
    );
    payload.insert("sequence".to_string(), Value::from(sequence));
    payload.insert("event_type".to_string(), Value::from(event_type));
    for (key, value) in fields {
        payload.entry(key).or_insert(value);
    }
    Value::Object(payload)
}

/// JSONL log under `<logs_dir>/<run_id>/`.
pub struct FileEventLog {
    run_id: String,
    events_path: PathBuf,
    summary_path: PathBuf,
    sequence: u64,
}

impl FileEventLog {
    pub fn create(logs_dir: impl AsRef<Path>, run_id: &str) -> Result<Self, AuditError> {
        let logs_dir = logs_dir.as_ref();
        let run_dir = logs_dir.join(run_id);
        fs::create_dir_all(&run_dir)?;
        let events_path = run_dir.join("events.jsonl");
        let summary_path = run_dir.join("summary.jsonl");
        File::create(&events_path)?;
        File::create(&summary_path)?;

        let latest = logs_dir.join("latest");
        if latest.symlink_metadata().is_ok() {
            let _ = fs::remove_file(&latest);
        }
        #[cfg(unix)]
        if let Err(e) = std::os::unix::fs::symlink(run_id, &latest) {
            warn!(error = %e, "could not update latest symlink");
        }

        Ok(Self {
            run_id: run_id.to_string(),
            events_path,
            summary_path,
            sequence: 0,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn append_line(path: &Path, value: &Value) {
        let result = OpenOptions::new()
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{value}"));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "event append failed");
        }
    }

    fn read_lines(&self) -> Vec<Value> {
        let Ok(file) = File::open(&self.events_path) else {
            return Vec::new();
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect()
    }
}

impl EventLog for FileEventLog {
    fn log(&mut self, event_type: &str, fields: Map<String, Value>) {
        self.sequence += 1;
        let payload = envelope(self.sequence, event_type, fields);
        Self::append_line(&self.events_path, &payload);
    }

    fn log_summary(&mut self, snapshot: &SummarySnapshot) {
        match serde_json::to_value(snapshot) {
            Ok(value) => Self::append_line(&self.summary_path, &value),
            Err(e) => warn!(error = %e, "summary serialization failed"),
        }
    }

    fn read_recent(&self, n: usize) -> Vec<Value> {
        if n == 0 {
            return Vec::new();
        }
        let lines = self.read_lines();
        let skip = lines.len().saturating_sub(n);
        lines.into_iter().skip(skip).collect()
    }

    fn read_slice(&self, offset: usize, limit: usize) -> Vec<Value> {
        if limit == 0 {
            return Vec::new();
        }
        self.read_lines()
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect()
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Ring-buffered in-memory log.
pub struct MemoryEventLog {
    events: VecDeque<Value>,
    summaries: Vec<Value>,
    capacity: usize,
    sequence: u64,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            summaries: Vec::new(),
            capacity,
            sequence: 0,
        }
    }

    pub fn summaries(&self) -> &[Value] {
        &self.summaries
    }
}

impl EventLog for MemoryEventLog {
    fn log(&mut self, event_type: &str, fields: Map<String, Value>) {
        self.sequence += 1;
        self.events
            .push_back(envelope(self.sequence, event_type, fields));
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    fn log_summary(&mut self, snapshot: &SummarySnapshot) {
        if let Ok(value) = serde_json::to_value(snapshot) {
            self.summaries.push(value);
        }
    }

    fn read_recent(&self, n: usize) -> Vec<Value> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).cloned().collect()
    }

    fn read_slice(&self, offset: usize, limit: usize) -> Vec<Value> {
        self.events
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn file_log_appends_with_monotone_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = FileEventLog::create(dir.path(), "run_1").unwrap();

        log.log("action", fields(&[("principal_id", json!("alpha_1"))]));
        log.log("transfer", fields(&[("amount", json!(5))]));

        let events = log.read_recent(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["sequence"], 1);
        assert_eq!(events[1]["sequence"], 2);
        assert_eq!(events[0]["event_type"], "action");
        assert_eq!(events[0]["principal_id"], "alpha_1");
        assert!(events[0]["timestamp"].is_string());
    }

    #[test]
    fn latest_symlink_points_at_the_new_run() {
        let dir = tempfile::tempdir().unwrap();
        FileEventLog::create(dir.path(), "run_1").unwrap();
        FileEventLog::create(dir.path(), "run_2").unwrap();

        #[cfg(unix)]
        {
            let target = std::fs::read_link(dir.path().join("latest")).unwrap();
            assert_eq!(target, std::path::PathBuf::from("run_2"));
        }
    }

    #[test]
    fn read_slice_windows_in_append_order() {
        let mut log = MemoryEventLog::default();
        for i in 0..5 {
            log.log("tick", fields(&[("i", json!(i))]));
        }
        let slice = log.read_slice(1, 2);
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0]["i"], 1);
        assert_eq!(slice[1]["i"], 2);

        assert_eq!(log.read_recent(2)[0]["i"], 3);
        assert!(log.read_recent(0).is_empty());
    }

    #[test]
    fn envelope_fields_do_not_override_the_header() {
        let mut log = MemoryEventLog::default();
        log.log("tick", fields(&[("sequence", json!(999))]));
        assert_eq!(log.read_recent(1)[0]["sequence"], 1);
    }

    #[test]
    fn summary_snapshots_are_recorded() {
        let mut log = MemoryEventLog::default();
        log.log_summary(&SummarySnapshot {
            timestamp: "t".to_string(),
            event_number: 3,
            action_count: 2,
            principal_count: 3,
            artifact_count: 7,
            total_scrip: 300,
        });
        assert_eq!(log.summaries().len(), 1);
        assert_eq!(log.summaries()[0]["total_scrip"], 300);
    }
}
