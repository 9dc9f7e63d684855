//! Conflict detection between candidate file globs and held locks.
//!
//! Overlap is a single-level containment heuristic, not glob intersection:
//! two patterns overlap when they are textually equal or when one pattern
//! matches the other read as a literal path. `src/*.ts` and `src/sub/*.ts`
//! therefore do not overlap even though their expansions could. Callers rely
//! on this false-negative profile; widening it changes which work can run
//! side by side.

use globset::{GlobBuilder, GlobMatcher};

use crate::state::LockEntry;

/// A glob compiled once for repeated overlap checks.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    matcher: Option<GlobMatcher>,
}

impl GlobPattern {
    /// Compile with shell semantics: `*` and `?` stay within one path
    /// segment, `**` spans directories. A pattern that fails to compile
    /// only overlaps by textual equality.
    pub fn new(raw: &str) -> Self {
        let matcher = GlobBuilder::new(raw)
            .literal_separator(true)
            .build()
            .ok()
            .map(|g| g.compile_matcher());
        Self {
            raw: raw.to_string(),
            matcher,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn matches_literal(&self, text: &str) -> bool {
        self.matcher.as_ref().is_some_and(|m| m.is_match(text))
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.raw == other.raw
            || self.matches_literal(&other.raw)
            || other.matches_literal(&self.raw)
    }
}

/// Whether two glob patterns are judged to touch the same files.
pub fn overlaps(a: &str, b: &str) -> bool {
    GlobPattern::new(a).overlaps(&GlobPattern::new(b))
}

/// Locks whose reserved globs overlap any candidate glob.
///
/// Scanning a lock stops at its first overlapping glob, so each lock
/// appears at most once, in lock-table order.
pub fn conflicts_for<'a>(candidate: &[String], locks: &'a [LockEntry]) -> Vec<&'a LockEntry> {
    let candidate: Vec<GlobPattern> = candidate.iter().map(|c| GlobPattern::new(c)).collect();

    locks
        .iter()
        .filter(|lock| {
            lock.files.iter().any(|held| {
                let held = GlobPattern::new(held);
                candidate.iter().any(|c| held.overlaps(c))
            })
        })
        .collect()
}
