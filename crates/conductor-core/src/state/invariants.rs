//! Consistency checks over the queue and lock documents.
//!
//! Other tooling may edit the documents directly; this reports anything that
//! breaks the pairing between in-progress entries and locks.

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::entry::QueueEntry;
use super::lock::LockEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    DuplicateId(u64),
    OutOfOrder { before: u64, after: u64 },
    MissingLock(u64),
    MultipleLocks { owner: u64, count: usize },
    OrphanLock(u64),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "entry #{id} appears more than once"),
            Self::OutOfOrder { before, after } => {
                write!(f, "entry #{before} is stored before #{after} out of priority order")
            }
            Self::MissingLock(id) => write!(f, "entry #{id} is in progress without a lock"),
            Self::MultipleLocks { owner, count } => {
                write!(f, "entry #{owner} holds {count} locks")
            }
            Self::OrphanLock(owner) => {
                write!(f, "lock held by #{owner} has no in-progress entry")
            }
        }
    }
}

/// Check entries (in stored order) against the lock table.
pub fn check(entries: &[QueueEntry], locks: &[LockEntry]) -> Vec<Violation> {
    let mut violations = Vec::new();

    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.id) {
            violations.push(Violation::DuplicateId(entry.id));
        }
    }

    for pair in entries.windows(2) {
        if pair[0].sort_key() > pair[1].sort_key() {
            violations.push(Violation::OutOfOrder {
                before: pair[0].id,
                after: pair[1].id,
            });
        }
    }

    let mut lock_counts: HashMap<u64, usize> = HashMap::new();
    for lock in locks {
        *lock_counts.entry(lock.owner).or_default() += 1;
    }

    for entry in entries.iter().filter(|e| e.is_in_progress()) {
        if !lock_counts.contains_key(&entry.id) {
            violations.push(Violation::MissingLock(entry.id));
        }
    }

    let mut owners: Vec<(u64, usize)> = lock_counts.into_iter().collect();
    owners.sort_unstable();
    for (owner, count) in owners {
        if count > 1 {
            violations.push(Violation::MultipleLocks { owner, count });
        }
        let active = entries.iter().any(|e| e.id == owner && e.is_in_progress());
        if !active {
            violations.push(Violation::OrphanLock(owner));
        }
    }

    violations
}
