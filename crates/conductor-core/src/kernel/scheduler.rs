//! Scheduler - bounded admission of queued work onto the agent pool.
//!
//! One pass walks the queue in store order and admits entries while free
//! capacity remains and their globs don't overlap a held lock. Locks taken
//! earlier in the same pass count.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::conflicts::conflicts_for;
use crate::adapters::{Dispatch, WorkDescriptor};
use crate::config::{CommitMode, ConductorConfig};
use crate::error::Result;
use crate::state::{Board, LockEntry, QueueEntry, StateStore};

/// An entry left queued because of held locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blocked {
    pub id: u64,
    /// Owners of the conflicting locks
    pub owners: Vec<u64>,
}

/// Result of one admission pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Free slots at the start of the pass
    pub capacity: usize,
    /// Entries moved to in-progress (or that would be, in a dry run)
    pub admitted: Vec<u64>,
    /// Entries skipped for a lock conflict
    pub blocked: Vec<Blocked>,
    /// Queued entries not considered because capacity ran out
    pub deferred: Vec<u64>,
    /// The pool was full before the pass started
    pub at_capacity: bool,
    pub dry_run: bool,
}

impl PassReport {
    pub fn summary(&self) -> String {
        format!(
            "Capacity: {}, Admitted: {}, Blocked: {}, Deferred: {}{}",
            self.capacity,
            self.admitted.len(),
            self.blocked.len(),
            self.deferred.len(),
            if self.dry_run { " (dry run)" } else { "" }
        )
    }
}

/// Admission control over the shared queue and lock table.
pub struct Scheduler {
    parallel_agents: usize,
    commit: CommitMode,
}

impl Scheduler {
    pub fn new(config: &ConductorConfig) -> Self {
        Self {
            parallel_agents: config.parallel_agents,
            commit: config.commit,
        }
    }

    /// Override the configured commit mode (e.g. for `--dry-run`).
    pub fn with_commit_mode(mut self, commit: CommitMode) -> Self {
        self.commit = commit;
        self
    }

    pub fn commit_mode(&self) -> CommitMode {
        self.commit
    }

    /// Run one admission pass.
    ///
    /// Under [`CommitMode::EndOfPass`] a dispatch error aborts the pass
    /// with nothing persisted; entries dispatched before it are logged as
    /// orphans. Under [`CommitMode::PerAdmission`] each claim is written
    /// before its dispatch call.
    pub async fn run_pass(
        &self,
        store: &dyn StateStore,
        dispatcher: &dyn Dispatch,
    ) -> Result<PassReport> {
        let mut board = Board::load(store)?;

        let in_progress = board.queue.in_progress_count();
        let capacity = self.parallel_agents.saturating_sub(in_progress);
        let mut report = PassReport {
            capacity,
            dry_run: self.commit == CommitMode::DryRun,
            ..Default::default()
        };

        if capacity == 0 {
            report.at_capacity = true;
            report.deferred = board.queue.queued_ids();
            tracing::info!(
                in_progress,
                parallel_agents = self.parallel_agents,
                deferred = ?report.deferred,
                "At capacity, nothing to admit"
            );
            return Ok(report);
        }

        let candidates: Vec<QueueEntry> = board
            .queue
            .entries()
            .iter()
            .filter(|e| e.is_queued())
            .cloned()
            .collect();

        let mut remaining = capacity;
        for entry in candidates {
            if remaining == 0 {
                tracing::info!(issue_id = entry.id, "Deferred: capacity exhausted");
                report.deferred.push(entry.id);
                continue;
            }

            let owners: Vec<u64> = conflicts_for(&entry.files, &board.locks)
                .iter()
                .map(|lock| lock.owner)
                .collect();
            if !owners.is_empty() {
                tracing::info!(
                    issue_id = entry.id,
                    blocking_owners = ?owners,
                    "Blocked: file lock conflict"
                );
                report.blocked.push(Blocked {
                    id: entry.id,
                    owners,
                });
                continue;
            }

            let work = WorkDescriptor {
                id: entry.id,
                component: entry.component.clone(),
                files: entry.files.clone(),
            };
            let started_at = Utc::now();

            match self.commit {
                CommitMode::DryRun => {
                    claim(&mut board, &entry, dispatcher.name(), started_at);
                    tracing::info!(issue_id = entry.id, "Would admit (dry run)");
                }
                CommitMode::PerAdmission => {
                    claim(&mut board, &entry, dispatcher.name(), started_at);
                    board.save(store)?;
                    if let Err(e) = dispatcher.dispatch(&work).await {
                        tracing::error!(
                            issue_id = entry.id,
                            error = %e,
                            "Dispatch failed after claim was recorded; release with --outcome requeue"
                        );
                        return Err(e);
                    }
                }
                CommitMode::EndOfPass => {
                    if let Err(e) = dispatcher.dispatch(&work).await {
                        if !report.admitted.is_empty() {
                            tracing::error!(
                                orphaned = ?report.admitted,
                                "Dispatch failed mid-pass; earlier dispatches are running but unrecorded"
                            );
                        }
                        return Err(e);
                    }
                    claim(&mut board, &entry, dispatcher.name(), started_at);
                }
            }

            tracing::info!(
                issue_id = entry.id,
                component = %entry.component,
                agent = dispatcher.name(),
                "Admitted"
            );
            report.admitted.push(entry.id);
            remaining -= 1;
        }

        if self.commit == CommitMode::EndOfPass && !report.admitted.is_empty() {
            board.save(store)?;
        }

        tracing::info!("{}", report.summary());
        Ok(report)
    }
}

/// Mark `entry` in progress and reserve its globs.
fn claim(board: &mut Board, entry: &QueueEntry, agent: &str, at: DateTime<Utc>) {
    board.queue.mark_in_progress(entry.id, at);
    board
        .locks
        .push(LockEntry::new(entry.id, entry.files.clone(), at).with_agent(agent));
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::Error;
    use crate::state::{invariants, EntryStatus, MemoryStore, Revision};

    #[derive(Default)]
    struct FakeDispatcher {
        sent: Mutex<Vec<WorkDescriptor>>,
        fail_on: Option<u64>,
    }

    impl FakeDispatcher {
        fn failing_on(id: u64) -> Self {
            Self {
                fail_on: Some(id),
                ..Default::default()
            }
        }

        fn sent_ids(&self) -> Vec<u64> {
            self.sent.lock().unwrap().iter().map(|w| w.id).collect()
        }
    }

    #[async_trait]
    impl Dispatch for FakeDispatcher {
        fn name(&self) -> &str {
            "fake"
        }

        async fn dispatch(&self, work: &WorkDescriptor) -> Result<()> {
            if self.fail_on == Some(work.id) {
                return Err(Error::Upstream {
                    service: "fake",
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            self.sent.lock().unwrap().push(work.clone());
            Ok(())
        }
    }

    /// Records whether the entry was already claimed in the store when
    /// its dispatch call arrived.
    struct ObservingDispatcher<'a> {
        store: &'a MemoryStore,
        claimed_at_dispatch: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl<'a> Dispatch for ObservingDispatcher<'a> {
        fn name(&self) -> &str {
            "observer"
        }

        async fn dispatch(&self, work: &WorkDescriptor) -> Result<()> {
            let queue = self.store.load_queue()?.value;
            let locks = self.store.load_locks()?.value;
            let claimed = queue
                .iter()
                .any(|e| e.id == work.id && e.status == EntryStatus::InProgress)
                && locks.iter().any(|l| l.owner == work.id);
            self.claimed_at_dispatch.lock().unwrap().push(claimed);
            Ok(())
        }
    }

    fn scheduler(parallel_agents: usize, commit: CommitMode) -> Scheduler {
        let config = ConductorConfig {
            parallel_agents,
            commit,
            ..Default::default()
        };
        Scheduler::new(&config)
    }

    fn queued(id: u64, priority: i64, files: &[&str]) -> QueueEntry {
        let mut entry = QueueEntry::new(id, format!("issue {id}"), priority);
        entry.files = files.iter().map(|f| f.to_string()).collect();
        entry
    }

    fn running(id: u64, priority: i64, files: &[&str]) -> (QueueEntry, LockEntry) {
        let mut entry = queued(id, priority, files);
        let now = Utc::now();
        entry.status = EntryStatus::InProgress;
        entry.started_at = Some(now);
        let lock = LockEntry::new(id, entry.files.clone(), now);
        (entry, lock)
    }

    #[test]
    fn admits_queued_entry_and_takes_lock() {
        let store = MemoryStore::with_state(&[queued(10, 450, &["connectors/jdbc/**"])], &[]).unwrap();
        let dispatcher = FakeDispatcher::default();

        let report = tokio_test::block_on(
            scheduler(1, CommitMode::EndOfPass).run_pass(&store, &dispatcher),
        )
        .unwrap();

        assert_eq!(report.admitted, vec![10]);
        assert_eq!(dispatcher.sent_ids(), vec![10]);

        let queue = store.load_queue().unwrap().value;
        assert_eq!(queue[0].status, EntryStatus::InProgress);
        assert!(queue[0].started_at.is_some());

        let locks = store.load_locks().unwrap().value;
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].owner, 10);
        assert_eq!(locks[0].files, vec!["connectors/jdbc/**"]);
        assert_eq!(locks[0].agent.as_deref(), Some("fake"));
        assert!(invariants::check(&queue, &locks).is_empty());
    }

    #[test]
    fn overlapping_entry_stays_queued() {
        let (held, lock) = running(10, 450, &["connectors/jdbc/**"]);
        let blocked = queued(11, 1000, &["connectors/jdbc/config.yaml"]);
        let store = MemoryStore::with_state(&[held, blocked], &[lock]).unwrap();
        let dispatcher = FakeDispatcher::default();

        let report = tokio_test::block_on(
            scheduler(2, CommitMode::EndOfPass).run_pass(&store, &dispatcher),
        )
        .unwrap();

        assert!(report.admitted.is_empty());
        assert_eq!(
            report.blocked,
            vec![Blocked {
                id: 11,
                owners: vec![10]
            }]
        );
        assert!(dispatcher.sent_ids().is_empty());

        let queue = store.load_queue().unwrap().value;
        assert_eq!(queue[1].id, 11);
        assert_eq!(queue[1].status, EntryStatus::Queued);
    }

    #[test]
    fn full_pool_defers_without_writing() {
        let (held, lock) = running(10, 450, &["connectors/jdbc/**"]);
        let waiting = queued(12, 1000, &["connectors/s3/**"]);
        let store = MemoryStore::with_state(&[held, waiting], &[lock]).unwrap();
        let before = store.load_queue().unwrap().revision;
        let dispatcher = FakeDispatcher::default();

        let report = tokio_test::block_on(
            scheduler(1, CommitMode::EndOfPass).run_pass(&store, &dispatcher),
        )
        .unwrap();

        assert!(report.at_capacity);
        assert_eq!(report.capacity, 0);
        assert_eq!(report.deferred, vec![12]);
        assert!(report.blocked.is_empty());
        assert!(dispatcher.sent_ids().is_empty());
        assert_eq!(store.load_queue().unwrap().revision, before);
    }

    #[test]
    fn admissions_never_exceed_capacity() {
        let entries = vec![
            queued(1, 1000, &["a/**"]),
            queued(2, 850, &["b/**"]),
            queued(3, 1150, &["c/**"]),
            queued(4, 600, &["d/**"]),
        ];
        let store = MemoryStore::with_state(&entries, &[]).unwrap();
        let dispatcher = FakeDispatcher::default();

        let report = tokio_test::block_on(
            scheduler(2, CommitMode::EndOfPass).run_pass(&store, &dispatcher),
        )
        .unwrap();

        assert_eq!(report.admitted, vec![4, 2]);
        assert_eq!(report.deferred, vec![1, 3]);

        let queue = store.load_queue().unwrap().value;
        let in_progress = queue.iter().filter(|e| e.is_in_progress()).count();
        assert_eq!(in_progress, 2);
    }

    #[test]
    fn locks_taken_in_the_same_pass_block_later_entries() {
        let entries = vec![
            queued(1, 450, &["connectors/jdbc/**"]),
            queued(2, 1000, &["connectors/jdbc/pool.rs"]),
            queued(3, 1000, &["docs/**"]),
        ];
        let store = MemoryStore::with_state(&entries, &[]).unwrap();
        let dispatcher = FakeDispatcher::default();

        let report = tokio_test::block_on(
            scheduler(3, CommitMode::EndOfPass).run_pass(&store, &dispatcher),
        )
        .unwrap();

        assert_eq!(report.admitted, vec![1, 3]);
        assert_eq!(report.blocked[0].id, 2);
        assert_eq!(report.blocked[0].owners, vec![1]);
    }

    #[test]
    fn end_of_pass_failure_persists_nothing() {
        let entries = vec![queued(1, 450, &["a/**"]), queued(2, 1000, &["b/**"])];
        let store = MemoryStore::with_state(&entries, &[]).unwrap();
        let queue_before = store.load_queue().unwrap().revision;
        let locks_before = store.load_locks().unwrap().revision;
        let dispatcher = FakeDispatcher::failing_on(2);

        let err = tokio_test::block_on(
            scheduler(2, CommitMode::EndOfPass).run_pass(&store, &dispatcher),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Upstream { status: 502, .. }));
        // Entry 1 was dispatched but never recorded.
        assert_eq!(dispatcher.sent_ids(), vec![1]);
        assert_eq!(store.load_queue().unwrap().revision, queue_before);
        assert_eq!(store.load_locks().unwrap().revision, locks_before);
    }

    #[test]
    fn per_admission_records_claim_before_dispatch() {
        let entries = vec![queued(1, 450, &["a/**"]), queued(2, 1000, &["b/**"])];
        let store = MemoryStore::with_state(&entries, &[]).unwrap();
        let dispatcher = ObservingDispatcher {
            store: &store,
            claimed_at_dispatch: Mutex::new(Vec::new()),
        };

        let report = tokio_test::block_on(
            scheduler(2, CommitMode::PerAdmission).run_pass(&store, &dispatcher),
        )
        .unwrap();

        assert_eq!(report.admitted, vec![1, 2]);
        assert_eq!(*dispatcher.claimed_at_dispatch.lock().unwrap(), vec![true, true]);
    }

    #[test]
    fn per_admission_failure_leaves_recorded_claim() {
        let store = MemoryStore::with_state(&[queued(7, 1000, &["a/**"])], &[]).unwrap();
        let dispatcher = FakeDispatcher::failing_on(7);

        let result = tokio_test::block_on(
            scheduler(1, CommitMode::PerAdmission).run_pass(&store, &dispatcher),
        );
        assert!(result.is_err());

        let queue = store.load_queue().unwrap().value;
        let locks = store.load_locks().unwrap().value;
        assert_eq!(queue[0].status, EntryStatus::InProgress);
        assert_eq!(locks[0].owner, 7);
    }

    /// Rewrites the lock table while the pass is dispatching, as a second
    /// writer would.
    struct ConcurrentLockWriter<'a> {
        store: &'a MemoryStore,
    }

    #[async_trait]
    impl<'a> Dispatch for ConcurrentLockWriter<'a> {
        fn name(&self) -> &str {
            "concurrent"
        }

        async fn dispatch(&self, _work: &WorkDescriptor) -> Result<()> {
            let snapshot = self.store.load_locks()?;
            let mut locks = snapshot.value;
            for lock in &mut locks {
                lock.pr = Some(7);
            }
            self.store.save_locks(&locks, snapshot.revision)?;
            Ok(())
        }
    }

    #[test]
    fn lock_table_change_mid_pass_keeps_documents_paired() {
        let (other, other_lock) = running(99, 1000, &["docs/**"]);
        let store = MemoryStore::with_state(
            &[queued(10, 450, &["connectors/jdbc/**"]), other],
            &[other_lock],
        )
        .unwrap();
        let dispatcher = ConcurrentLockWriter { store: &store };

        let err = tokio_test::block_on(
            scheduler(2, CommitMode::EndOfPass).run_pass(&store, &dispatcher),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(crate::state::StoreError::Conflict {
                document: "locks",
                ..
            })
        ));

        let queue = store.load_queue().unwrap().value;
        let locks = store.load_locks().unwrap().value;
        assert_eq!(queue[0].id, 10);
        assert_eq!(queue[0].status, EntryStatus::Queued);
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].pr, Some(7));
        assert!(invariants::check(&queue, &locks).is_empty());
    }

    #[test]
    fn dry_run_neither_dispatches_nor_writes() {
        let entries = vec![
            queued(1, 450, &["src/**"]),
            queued(2, 1000, &["src/main.rs"]),
        ];
        let store = MemoryStore::with_state(&entries, &[]).unwrap();
        let before = store.load_queue().unwrap().revision;
        let dispatcher = FakeDispatcher::default();

        let report = tokio_test::block_on(
            scheduler(2, CommitMode::EndOfPass)
                .with_commit_mode(CommitMode::DryRun)
                .run_pass(&store, &dispatcher),
        )
        .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.admitted, vec![1]);
        assert_eq!(report.blocked[0].id, 2);
        assert!(dispatcher.sent_ids().is_empty());
        assert_eq!(store.load_queue().unwrap().revision, before);
        assert_ne!(before, Revision::Absent);
    }
}
