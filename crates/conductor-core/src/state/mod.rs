//! State management - queue entries, locks, and their persistence.

mod entry;
pub mod invariants;
mod lock;
mod queue;
mod store;

pub use entry::{Complexity, EntryStatus, QueueEntry, UNKNOWN_COMPONENT};
pub use lock::{release_owner, LockEntry};
pub use queue::Queue;
pub use store::{Board, FileStore, MemoryStore, Revision, Snapshot, StateStore, StoreError};
