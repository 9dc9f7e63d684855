//! Observability - append-only event log next to the state documents.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::{PassReport, Release, TriageOutcome};

pub const TRIAGED: &str = "triaged";
pub const ADMITTED: &str = "admitted";
pub const BLOCKED: &str = "blocked";
pub const RELEASED: &str = "released";
pub const PASS_COMPLETE: &str = "pass_complete";

/// One line of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub issue_id: Option<u64>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SchedulerEvent {
    pub fn new(event_type: &str, issue_id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            issue_id,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Writes scheduler events as JSON lines.
pub struct EventEmitter {
    events_path: PathBuf,
}

impl EventEmitter {
    pub fn new(events_path: impl Into<PathBuf>) -> Self {
        Self {
            events_path: events_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.events_path
    }

    /// Append an event.
    pub fn emit(&self, event: &SchedulerEvent) -> Result<()> {
        if let Some(parent) = self.events_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .with_context(|| format!("failed to open {}", self.events_path.display()))?;

        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;

        Ok(())
    }

    pub fn triaged(&self, outcome: &TriageOutcome) -> Result<()> {
        let entry = &outcome.entry;
        self.emit(
            &SchedulerEvent::new(
                TRIAGED,
                Some(entry.id),
                format!(
                    "{} {} as {}/{} at priority {}",
                    if outcome.created { "Queued" } else { "Re-triaged" },
                    entry.id,
                    entry.component,
                    entry.complexity,
                    entry.priority
                ),
            )
            .with_metadata(serde_json::json!({
                "files": entry.files,
                "labels": outcome.labels,
            })),
        )
    }

    /// One event per admitted and blocked entry, then a pass summary.
    pub fn pass(&self, report: &PassReport) -> Result<()> {
        for id in &report.admitted {
            self.emit(&SchedulerEvent::new(ADMITTED, Some(*id), format!("Admitted {id}")))?;
        }
        for blocked in &report.blocked {
            self.emit(
                &SchedulerEvent::new(
                    BLOCKED,
                    Some(blocked.id),
                    format!("Blocked {} by {:?}", blocked.id, blocked.owners),
                )
                .with_metadata(serde_json::json!({ "owners": blocked.owners })),
            )?;
        }
        self.emit(
            &SchedulerEvent::new(PASS_COMPLETE, None, report.summary())
                .with_metadata(serde_json::to_value(report)?),
        )
    }

    pub fn released(&self, release: &Release) -> Result<()> {
        self.emit(
            &SchedulerEvent::new(
                RELEASED,
                Some(release.id),
                format!(
                    "Released {} ({} -> {})",
                    release.id, release.previous, release.status
                ),
            )
            .with_metadata(serde_json::json!({ "locks_released": release.locks_released })),
        )
    }

    /// Read the last `limit` events. Unreadable lines are skipped.
    pub fn read_recent(&self, limit: usize) -> Vec<SchedulerEvent> {
        let file = match std::fs::File::open(&self.events_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let reader = BufReader::new(file);
        let mut events: Vec<SchedulerEvent> = reader
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        if events.len() > limit {
            events.drain(0..events.len() - limit);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::kernel::Blocked;

    #[test]
    fn pass_writes_one_line_per_decision() {
        let dir = TempDir::new().unwrap();
        let emitter = EventEmitter::new(dir.path().join("logs/events.jsonl"));
        let report = PassReport {
            capacity: 2,
            admitted: vec![10],
            blocked: vec![Blocked {
                id: 11,
                owners: vec![10],
            }],
            ..Default::default()
        };

        emitter.pass(&report).unwrap();

        let events = emitter.read_recent(10);
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec![ADMITTED, BLOCKED, PASS_COMPLETE]);
        assert_eq!(events[1].issue_id, Some(11));
        assert_eq!(events[2].metadata["capacity"], 2);
    }

    #[test]
    fn read_recent_keeps_the_tail_and_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let emitter = EventEmitter::new(dir.path().join("events.jsonl"));
        for id in 1..=4 {
            emitter
                .emit(&SchedulerEvent::new(ADMITTED, Some(id), "x"))
                .unwrap();
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(emitter.path())
            .and_then(|mut f| writeln!(f, "not json"))
            .unwrap();

        let ids: Vec<Option<u64>> = emitter.read_recent(2).iter().map(|e| e.issue_id).collect();
        assert_eq!(ids, vec![Some(3), Some(4)]);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(EventEmitter::new(dir.path().join("none.jsonl"))
            .read_recent(5)
            .is_empty());
    }
}
