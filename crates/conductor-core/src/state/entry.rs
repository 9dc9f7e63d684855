//! Queue entry model - one unit of pending or active work.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Component key used when a request names no configured component.
pub const UNKNOWN_COMPONENT: &str = "unknown";

/// A single unit of work in the queue, keyed by the originating issue number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Issue number of the originating request
    pub id: u64,

    /// Issue title (display only)
    #[serde(default)]
    pub title: String,

    /// Component key, or `unknown`
    #[serde(default = "default_component")]
    pub component: String,

    /// Glob patterns this work will touch, first-seen order
    #[serde(default)]
    pub files: Vec<String>,

    /// Labels applied by triage; only ever grows
    #[serde(default)]
    pub labels: BTreeSet<String>,

    /// Scheduling score, lower runs sooner
    pub priority: i64,

    /// Size estimate
    #[serde(default)]
    pub complexity: Complexity,

    /// Lifecycle state
    #[serde(default)]
    pub status: EntryStatus,

    /// When the entry was admitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the entry was marked done or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_component() -> String {
    UNKNOWN_COMPONENT.to_string()
}

impl QueueEntry {
    /// Create a queued entry with no files or labels.
    pub fn new(id: u64, title: impl Into<String>, priority: i64) -> Self {
        Self {
            id,
            title: title.into(),
            component: default_component(),
            files: Vec::new(),
            labels: BTreeSet::new(),
            priority,
            complexity: Complexity::default(),
            status: EntryStatus::Queued,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.status == EntryStatus::Queued
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == EntryStatus::InProgress
    }

    /// Store ordering key.
    pub fn sort_key(&self) -> (i64, u64) {
        (self.priority, self.id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStatus {
    #[default]
    Queued,
    #[serde(alias = "in_progress", alias = "inprogress")]
    InProgress,
    Done,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in-progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complexity estimate (S, M, L). Anything else normalizes to M.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Complexity {
    S,
    #[default]
    M,
    L,
}

impl Complexity {
    /// Parse a free-text value, falling back to `M`.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_uppercase()).as_deref() {
            Some("S") => Self::S,
            Some("L") => Self::L,
            _ => Self::M,
        }
    }

    /// Priority adjustment for this size.
    pub fn priority_delta(&self) -> i64 {
        match self {
            Self::S => -150,
            Self::M => 0,
            Self::L => 150,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S => "S",
            Self::M => "M",
            Self::L => "L",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
