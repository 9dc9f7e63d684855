//! Work queue - entries kept in `(priority, id)` order.

use chrono::{DateTime, Utc};

use super::entry::{EntryStatus, QueueEntry};

/// The work queue. Always sorted ascending by `(priority, id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Queue {
    entries: Vec<QueueEntry>,
}

impl Queue {
    /// Build a queue from stored entries, restoring order if an external
    /// writer left the document unsorted.
    pub fn from_entries(entries: Vec<QueueEntry>) -> Self {
        let mut queue = Self { entries };
        queue.sort();
        queue
    }

    /// All entries in store order
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// Get an entry by id
    pub fn get(&self, id: u64) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Get a mutable entry by id. Callers that change `priority` must
    /// call [`Queue::sort`] afterwards.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Replace the entry with the same id, or append it, then re-sort.
    pub fn upsert(&mut self, entry: QueueEntry) {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self.sort();
    }

    /// Number of entries currently in progress
    pub fn in_progress_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_in_progress()).count()
    }

    /// Ids of queued entries, in scheduling order
    pub fn queued_ids(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|e| e.is_queued())
            .map(|e| e.id)
            .collect()
    }

    /// Mark an entry as in progress
    pub fn mark_in_progress(&mut self, id: u64, at: DateTime<Utc>) -> bool {
        match self.get_mut(id) {
            Some(entry) => {
                entry.status = EntryStatus::InProgress;
                entry.started_at = Some(at);
                entry.finished_at = None;
                true
            }
            None => false,
        }
    }

    pub fn sort(&mut self) {
        self.entries.sort_by_key(QueueEntry::sort_key);
    }
}
