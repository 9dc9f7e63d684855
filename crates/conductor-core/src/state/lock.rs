//! Lock table entries - file-region reservations held by active work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A reservation of glob-described file regions for one active unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Id of the queue entry holding the lock
    pub owner: u64,

    /// Reserved glob patterns
    #[serde(default)]
    pub files: Vec<String>,

    /// Who is doing the work (advisory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Pull request opened by the work (advisory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,

    /// When the lock was taken
    pub started_at: DateTime<Utc>,
}

impl LockEntry {
    pub fn new(owner: u64, files: Vec<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            owner,
            files,
            agent: None,
            pr: None,
            started_at,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// How long the lock has been held as of `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.started_at
    }

    /// Locks never expire; this only flags old ones for an operator.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

/// Remove every lock owned by `owner`, returning how many were dropped.
pub fn release_owner(locks: &mut Vec<LockEntry>, owner: u64) -> usize {
    let before = locks.len();
    locks.retain(|l| l.owner != owner);
    before - locks.len()
}
