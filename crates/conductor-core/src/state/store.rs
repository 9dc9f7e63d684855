//! Persistence for the queue and lock documents.
//!
//! Both documents are JSON arrays. The queue document is order-significant
//! (store order is scheduling order); the lock document is not.
//!
//! Writes are compare-and-swap against the revision observed at load time,
//! so a concurrent writer produces [`StoreError::Conflict`] instead of a
//! silently lost update. This detects races; it does not prevent them.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::entry::QueueEntry;
use super::lock::LockEntry;
use super::queue::Queue;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {document}: {source}")]
    Serialize {
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{document} changed since it was read (expected {expected}, found {found})")]
    Conflict {
        document: &'static str,
        expected: Revision,
        found: Revision,
    },
}

/// Identity of a stored document's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    /// The document does not exist yet
    Absent,
    /// Digest of the stored bytes
    Digest(u64),
}

impl Revision {
    fn of(content: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        Self::Digest(hasher.finish())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::Digest(d) => write!(f, "{d:016x}"),
        }
    }
}

/// A loaded document together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub value: T,
    pub revision: Revision,
}

/// Storage backend for the two shared documents.
///
/// Implementations must treat a missing document as an empty collection.
pub trait StateStore: Send + Sync {
    fn load_queue(&self) -> Result<Snapshot<Vec<QueueEntry>>, StoreError>;

    /// Replace the queue document if it is still at `expected`.
    fn save_queue(&self, entries: &[QueueEntry], expected: Revision)
        -> Result<Revision, StoreError>;

    fn load_locks(&self) -> Result<Snapshot<Vec<LockEntry>>, StoreError>;

    /// Replace the lock document if it is still at `expected`.
    fn save_locks(&self, locks: &[LockEntry], expected: Revision) -> Result<Revision, StoreError>;

    /// Replace both documents together. Both revisions are checked before
    /// either document is written; on failure neither document changes.
    fn save_board(
        &self,
        entries: &[QueueEntry],
        queue_expected: Revision,
        locks: &[LockEntry],
        locks_expected: Revision,
    ) -> Result<(Revision, Revision), StoreError>;
}

const QUEUE_DOCUMENT: &str = "queue";
const LOCKS_DOCUMENT: &str = "locks";

fn encode<T: Serialize>(document: &'static str, value: &[T]) -> Result<String, StoreError> {
    let mut json = serde_json::to_string_pretty(value)
        .map_err(|source| StoreError::Serialize { document, source })?;
    json.push('\n');
    Ok(json)
}

fn verify(
    document: &'static str,
    current: Option<&str>,
    expected: Revision,
) -> Result<(), StoreError> {
    let found = current.map(Revision::of).unwrap_or(Revision::Absent);
    if found != expected {
        return Err(StoreError::Conflict {
            document,
            expected,
            found,
        });
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(path: &Path, content: &str) -> Result<Vec<T>, StoreError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// ── File store ──

/// JSON files on local disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    queue_path: PathBuf,
    locks_path: PathBuf,
}

impl FileStore {
    pub fn new(queue_path: impl Into<PathBuf>, locks_path: impl Into<PathBuf>) -> Self {
        Self {
            queue_path: queue_path.into(),
            locks_path: locks_path.into(),
        }
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    pub fn locks_path(&self) -> &Path {
        &self.locks_path
    }

    fn read_raw(path: &Path) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn load<T: DeserializeOwned>(path: &Path) -> Result<Snapshot<Vec<T>>, StoreError> {
        match Self::read_raw(path)? {
            Some(content) => Ok(Snapshot {
                value: decode(path, &content)?,
                revision: Revision::of(&content),
            }),
            None => Ok(Snapshot {
                value: Vec::new(),
                revision: Revision::Absent,
            }),
        }
    }

    fn save<T: Serialize>(
        document: &'static str,
        path: &Path,
        value: &[T],
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        verify(document, Self::read_raw(path)?.as_deref(), expected)?;

        let json = encode(document, value)?;
        Self::write(path, &json)?;
        Ok(Revision::of(&json))
    }

    fn write(path: &Path, json: &str) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        // Rename over the target so readers never see a half-written document.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    /// Put a document back to the text it had before a failed board save.
    fn restore(path: &Path, previous: Option<&str>) -> Result<(), StoreError> {
        match previous {
            Some(text) => Self::write(path, text),
            None => fs::remove_file(path).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl StateStore for FileStore {
    fn load_queue(&self) -> Result<Snapshot<Vec<QueueEntry>>, StoreError> {
        Self::load(&self.queue_path)
    }

    fn save_queue(
        &self,
        entries: &[QueueEntry],
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        Self::save(QUEUE_DOCUMENT, &self.queue_path, entries, expected)
    }

    fn load_locks(&self) -> Result<Snapshot<Vec<LockEntry>>, StoreError> {
        Self::load(&self.locks_path)
    }

    fn save_locks(&self, locks: &[LockEntry], expected: Revision) -> Result<Revision, StoreError> {
        Self::save(LOCKS_DOCUMENT, &self.locks_path, locks, expected)
    }

    fn save_board(
        &self,
        entries: &[QueueEntry],
        queue_expected: Revision,
        locks: &[LockEntry],
        locks_expected: Revision,
    ) -> Result<(Revision, Revision), StoreError> {
        let queue_before = Self::read_raw(&self.queue_path)?;
        verify(QUEUE_DOCUMENT, queue_before.as_deref(), queue_expected)?;
        let locks_before = Self::read_raw(&self.locks_path)?;
        verify(LOCKS_DOCUMENT, locks_before.as_deref(), locks_expected)?;

        let queue_json = encode(QUEUE_DOCUMENT, entries)?;
        let locks_json = encode(LOCKS_DOCUMENT, locks)?;

        Self::write(&self.queue_path, &queue_json)?;
        if let Err(e) = Self::write(&self.locks_path, &locks_json) {
            if let Err(restore) = Self::restore(&self.queue_path, queue_before.as_deref()) {
                tracing::error!(
                    path = %self.queue_path.display(),
                    error = %restore,
                    "Failed to restore queue after lock write failed; documents are out of sync"
                );
            }
            return Err(e);
        }

        Ok((Revision::of(&queue_json), Revision::of(&locks_json)))
    }
}

// ── In-memory store ──

/// In-process store with the same revision semantics as [`FileStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    queue: Mutex<Option<String>>,
    locks: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing documents.
    pub fn with_state(entries: &[QueueEntry], locks: &[LockEntry]) -> Result<Self, StoreError> {
        Ok(Self {
            queue: Mutex::new(Some(encode(QUEUE_DOCUMENT, entries)?)),
            locks: Mutex::new(Some(encode(LOCKS_DOCUMENT, locks)?)),
        })
    }

    fn load<T: DeserializeOwned>(
        slot: &Mutex<Option<String>>,
        document: &'static str,
    ) -> Result<Snapshot<Vec<T>>, StoreError> {
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_deref() {
            Some(content) => Ok(Snapshot {
                value: decode(Path::new(document), content)?,
                revision: Revision::of(content),
            }),
            None => Ok(Snapshot {
                value: Vec::new(),
                revision: Revision::Absent,
            }),
        }
    }

    fn save<T: Serialize>(
        slot: &Mutex<Option<String>>,
        document: &'static str,
        value: &[T],
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        verify(document, guard.as_deref(), expected)?;
        let json = encode(document, value)?;
        let revision = Revision::of(&json);
        *guard = Some(json);
        Ok(revision)
    }
}

impl StateStore for MemoryStore {
    fn load_queue(&self) -> Result<Snapshot<Vec<QueueEntry>>, StoreError> {
        Self::load(&self.queue, QUEUE_DOCUMENT)
    }

    fn save_queue(
        &self,
        entries: &[QueueEntry],
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        Self::save(&self.queue, QUEUE_DOCUMENT, entries, expected)
    }

    fn load_locks(&self) -> Result<Snapshot<Vec<LockEntry>>, StoreError> {
        Self::load(&self.locks, LOCKS_DOCUMENT)
    }

    fn save_locks(&self, locks: &[LockEntry], expected: Revision) -> Result<Revision, StoreError> {
        Self::save(&self.locks, LOCKS_DOCUMENT, locks, expected)
    }

    fn save_board(
        &self,
        entries: &[QueueEntry],
        queue_expected: Revision,
        locks: &[LockEntry],
        locks_expected: Revision,
    ) -> Result<(Revision, Revision), StoreError> {
        // Lock order: queue, then locks.
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let mut held = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        verify(QUEUE_DOCUMENT, queue.as_deref(), queue_expected)?;
        verify(LOCKS_DOCUMENT, held.as_deref(), locks_expected)?;

        let queue_json = encode(QUEUE_DOCUMENT, entries)?;
        let locks_json = encode(LOCKS_DOCUMENT, locks)?;
        let revisions = (Revision::of(&queue_json), Revision::of(&locks_json));
        *queue = Some(queue_json);
        *held = Some(locks_json);
        Ok(revisions)
    }
}

// ── Board ──

/// Queue and lock table as loaded from a store, plus the revisions needed
/// to write them back.
#[derive(Debug, Clone)]
pub struct Board {
    pub queue: Queue,
    pub locks: Vec<LockEntry>,
    queue_revision: Revision,
    locks_revision: Revision,
}

impl Board {
    pub fn load(store: &dyn StateStore) -> Result<Self, StoreError> {
        let queue = store.load_queue()?;
        let locks = store.load_locks()?;
        Ok(Self {
            queue: Queue::from_entries(queue.value),
            locks: locks.value,
            queue_revision: queue.revision,
            locks_revision: locks.revision,
        })
    }

    /// Persist only the queue document.
    pub fn save_queue(&mut self, store: &dyn StateStore) -> Result<(), StoreError> {
        self.queue_revision = store.save_queue(self.queue.entries(), self.queue_revision)?;
        Ok(())
    }

    /// Persist both documents as a pair. A conflict on either leaves both
    /// untouched, so an in-progress entry is never stored without its lock.
    pub fn save(&mut self, store: &dyn StateStore) -> Result<(), StoreError> {
        let (queue_revision, locks_revision) = store.save_board(
            self.queue.entries(),
            self.queue_revision,
            &self.locks,
            self.locks_revision,
        )?;
        self.queue_revision = queue_revision;
        self.locks_revision = locks_revision;
        Ok(())
    }
}
