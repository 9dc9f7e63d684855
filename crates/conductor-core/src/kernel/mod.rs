//! Kernel - triage, conflict detection, admission, and completion.

pub mod completion;
pub mod conflicts;
mod scheduler;
pub mod triage;

pub use completion::{complete, release, Outcome, Release};
pub use conflicts::{conflicts_for, overlaps, GlobPattern};
pub use scheduler::{Blocked, PassReport, Scheduler};
pub use triage::{run_triage, TriageOutcome};
