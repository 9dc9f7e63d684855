//! Completion - close out admitted work and free its locks.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::{release_owner, Board, EntryStatus, StateStore};

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Done,
    Failed,
    /// Put the entry back in the queue
    Requeue,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Requeue => "requeue",
        }
    }

    fn status(&self) -> EntryStatus {
        match self {
            Self::Done => EntryStatus::Done,
            Self::Failed => EntryStatus::Failed,
            Self::Requeue => EntryStatus::Queued,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "requeue" => Ok(Self::Requeue),
            other => Err(Error::InvalidRequest(format!(
                "unknown outcome {other:?} (expected done, failed or requeue)"
            ))),
        }
    }
}

/// Result of releasing one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub id: u64,
    pub previous: EntryStatus,
    pub status: EntryStatus,
    /// Number of locks dropped
    pub locks_released: usize,
}

/// Apply `outcome` to entry `id` on a loaded board.
pub fn complete(board: &mut Board, id: u64, outcome: Outcome, at: DateTime<Utc>) -> Result<Release> {
    let entry = board
        .queue
        .get_mut(id)
        .ok_or_else(|| Error::InvalidRequest(format!("no queue entry with id {id}")))?;

    let previous = entry.status;
    entry.status = outcome.status();
    match outcome {
        Outcome::Done | Outcome::Failed => entry.finished_at = Some(at),
        Outcome::Requeue => {
            entry.started_at = None;
            entry.finished_at = None;
        }
    }
    let status = entry.status;

    let locks_released = release_owner(&mut board.locks, id);

    Ok(Release {
        id,
        previous,
        status,
        locks_released,
    })
}

/// Load, complete and persist in one step.
pub fn release(store: &dyn StateStore, id: u64, outcome: Outcome) -> Result<Release> {
    let mut board = Board::load(store)?;
    let release = complete(&mut board, id, outcome, Utc::now())?;
    board.save(store)?;

    tracing::info!(
        issue_id = id,
        outcome = %outcome,
        previous = %release.previous,
        locks_released = release.locks_released,
        "Released entry"
    );
    if release.locks_released == 0 {
        tracing::warn!(issue_id = id, "Entry held no lock");
    }

    Ok(release)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::{invariants, LockEntry, MemoryStore, QueueEntry};

    fn store_with_running(id: u64) -> MemoryStore {
        let now = Utc::now();
        let mut entry = QueueEntry::new(id, "running", 1000);
        entry.status = EntryStatus::InProgress;
        entry.started_at = Some(now);
        let lock = LockEntry::new(id, vec!["src/**".into()], now);
        let other = LockEntry::new(99, vec!["docs/**".into()], now);
        let mut other_entry = QueueEntry::new(99, "other", 1000);
        other_entry.status = EntryStatus::InProgress;
        other_entry.started_at = Some(now);
        MemoryStore::with_state(&[entry, other_entry], &[lock, other]).unwrap()
    }

    #[test]
    fn done_stamps_finish_and_drops_lock() {
        let store = store_with_running(5);

        let release = release(&store, 5, Outcome::Done).unwrap();
        assert_eq!(release.previous, EntryStatus::InProgress);
        assert_eq!(release.status, EntryStatus::Done);
        assert_eq!(release.locks_released, 1);

        let queue = store.load_queue().unwrap().value;
        let locks = store.load_locks().unwrap().value;
        let entry = queue.iter().find(|e| e.id == 5).unwrap();
        assert!(entry.finished_at.is_some());
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].owner, 99);
        assert!(invariants::check(&queue, &locks).is_empty());
    }

    #[test]
    fn requeue_clears_start() {
        let store = store_with_running(5);
        release(&store, 5, Outcome::Requeue).unwrap();

        let queue = store.load_queue().unwrap().value;
        let entry = queue.iter().find(|e| e.id == 5).unwrap();
        assert_eq!(entry.status, EntryStatus::Queued);
        assert!(entry.started_at.is_none());
    }

    #[test]
    fn unknown_id_is_rejected_without_writing() {
        let store = store_with_running(5);
        let before = store.load_queue().unwrap().revision;

        let err = release(&store, 42, Outcome::Failed).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(store.load_queue().unwrap().revision, before);
    }

    #[test]
    fn outcome_parses_case_insensitively() {
        assert_eq!("Done".parse::<Outcome>().unwrap(), Outcome::Done);
        assert_eq!("requeue".parse::<Outcome>().unwrap(), Outcome::Requeue);
        assert!("skip".parse::<Outcome>().is_err());
    }
}
