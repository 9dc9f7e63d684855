//! Conductor Core - issue-driven work scheduler
//!
//! This crate turns inbound work requests (GitHub issues) into a
//! prioritized queue, admits queued work onto a bounded pool of agents,
//! and keeps two units of work from touching overlapping file regions.

pub mod adapters;
pub mod config;
pub mod error;
pub mod kernel;
pub mod observability;
pub mod state;

pub use adapters::{Dispatch, GitHubClient, IssueTracker, WorkDescriptor, WorkRequest};
pub use config::{CommitMode, ConductorConfig};
pub use error::{Error, Result};
pub use kernel::{Outcome, PassReport, Scheduler};
pub use state::{FileStore, LockEntry, MemoryStore, QueueEntry, StateStore};
