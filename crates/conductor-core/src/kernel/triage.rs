//! Triage - normalize an inbound work request into a queue entry.
//!
//! Reads the issue-form sections (component, complexity, file hints) from
//! the request body, scores a priority, and merges the result into any
//! existing entry for the same id. Running triage twice on the same request
//! leaves the queue unchanged.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::adapters::{IssueTracker, WorkRequest};
use crate::config::ConductorConfig;
use crate::error::Result;
use crate::state::{Board, Complexity, QueueEntry, StateStore, UNKNOWN_COMPONENT};

/// Starting score before adjustments.
pub const BASE_PRIORITY: i64 = 1000;

/// Adjustment applied when the request carries a bug label.
pub const BUG_PRIORITY_DELTA: i64 = -400;

/// Placeholder GitHub issue forms write into skipped optional fields.
const NO_RESPONSE: &str = "_No response_";

static HEADING_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn heading_re() -> Option<&'static Regex> {
    HEADING_RE
        .get_or_init(|| Regex::new(r"^ {0,3}#{1,6}\s+(.*?)\s*$").ok())
        .as_ref()
}

/// Text of the first markdown section titled `heading`, trimmed.
///
/// The heading comparison ignores case. The section runs until the next
/// heading of any level. An empty section or the issue-form placeholder
/// counts as absent.
pub fn extract_section(body: &str, heading: &str) -> Option<String> {
    let re = heading_re()?;
    let wanted = heading.trim().to_lowercase();

    let mut lines = body.lines();
    lines.find(|line| {
        re.captures(line)
            .and_then(|c| c.get(1))
            .is_some_and(|m| m.as_str().to_lowercase() == wanted)
    })?;

    let block: Vec<&str> = lines.take_while(|line| !re.is_match(line)).collect();
    let text = block.join("\n").trim().to_string();

    if text.is_empty() || text == NO_RESPONSE {
        None
    } else {
        Some(text)
    }
}

/// Lower-cased component key if configured, else `unknown`.
pub fn normalize_component(raw: Option<&str>, config: &ConductorConfig) -> String {
    raw.map(|s| s.trim().to_lowercase())
        .filter(|c| config.components.contains_key(c))
        .unwrap_or_else(|| UNKNOWN_COMPONENT.to_string())
}

/// Split a free-text hints field on newlines and commas.
pub fn parse_hints(raw: &str) -> Vec<String> {
    raw.split(['\n', ','])
        .map(|token| {
            let token = token.trim();
            let token = token
                .strip_prefix("- ")
                .or_else(|| token.strip_prefix("* "))
                .unwrap_or(token);
            token.trim().trim_matches('`').trim()
        })
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether any label marks the request as a bug.
pub fn is_bug(labels: &[String]) -> bool {
    labels
        .iter()
        .any(|l| l.eq_ignore_ascii_case("bug") || l.eq_ignore_ascii_case("type:bug"))
}

pub fn score_priority(bug: bool, complexity: Complexity) -> i64 {
    let bug_delta = if bug { BUG_PRIORITY_DELTA } else { 0 };
    BASE_PRIORITY + bug_delta + complexity.priority_delta()
}

/// Labels triage applies for a normalized request.
pub fn triage_labels(
    config: &ConductorConfig,
    component: &str,
    complexity: Complexity,
    bug: bool,
) -> BTreeSet<String> {
    let kind = if bug { "type:bug" } else { "type:feature" };
    BTreeSet::from([
        config.labels.triaged.clone(),
        format!("component:{component}"),
        format!("complexity:{complexity}"),
        kind.to_string(),
    ])
}

/// Append patterns not already present, keeping first-seen order.
fn extend_unique(files: &mut Vec<String>, more: impl IntoIterator<Item = String>) {
    for pattern in more {
        if !files.contains(&pattern) {
            files.push(pattern);
        }
    }
}

/// Build a fresh queued entry from a request, ignoring any existing state.
pub fn normalize(request: &WorkRequest, config: &ConductorConfig) -> QueueEntry {
    let sections = &config.sections;
    let component_raw = extract_section(&request.body, &sections.component);
    let complexity_raw = extract_section(&request.body, &sections.complexity);
    let hints = extract_section(&request.body, &sections.hints)
        .map(|h| parse_hints(&h))
        .unwrap_or_default();

    let component = normalize_component(component_raw.as_deref(), config);
    let complexity = Complexity::normalize(complexity_raw.as_deref());
    let bug = is_bug(&request.labels);

    let mut files = Vec::new();
    extend_unique(&mut files, config.component_globs(&component).iter().cloned());
    extend_unique(&mut files, hints);

    let mut entry = QueueEntry::new(request.id, request.title.clone(), score_priority(bug, complexity));
    entry.component = component.clone();
    entry.complexity = complexity;
    entry.files = files;
    entry.labels = triage_labels(config, &component, complexity, bug);
    entry
}

/// Fold a freshly normalized entry into the existing one.
///
/// Lifecycle fields come from `existing`; labels and files are unions;
/// everything else comes from `fresh`.
pub fn merge(existing: Option<&QueueEntry>, fresh: QueueEntry) -> QueueEntry {
    let Some(existing) = existing else {
        return fresh;
    };

    let mut files = existing.files.clone();
    extend_unique(&mut files, fresh.files);

    let mut labels = existing.labels.clone();
    labels.extend(fresh.labels);

    QueueEntry {
        files,
        labels,
        status: existing.status,
        started_at: existing.started_at,
        finished_at: existing.finished_at,
        ..fresh
    }
}

/// Human-readable summary posted back on the issue.
pub fn summary_comment(entry: &QueueEntry) -> String {
    let globs = if entry.files.is_empty() {
        "_none_".to_string()
    } else {
        entry
            .files
            .iter()
            .map(|f| format!("`{f}`"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "### Triage summary\n\n\
         - **Component:** {}\n\
         - **Complexity:** {}\n\
         - **Status:** {}\n\
         - **Target globs:** {}\n\
         - **Priority:** {}\n",
        entry.component, entry.complexity, entry.status, globs, entry.priority
    )
}

/// What a triage run did.
#[derive(Debug, Clone)]
pub struct TriageOutcome {
    /// The entry as stored after the merge
    pub entry: QueueEntry,
    /// Labels applied to the issue
    pub labels: Vec<String>,
    /// Whether the id was new to the queue
    pub created: bool,
}

/// Normalize `request`, upsert it, persist the queue, then label and
/// comment on the issue.
///
/// The queue is written before any tracker call, so an upstream failure
/// leaves the entry stored but unlabeled.
pub async fn run_triage(
    store: &dyn StateStore,
    tracker: &dyn IssueTracker,
    config: &ConductorConfig,
    request: &WorkRequest,
) -> Result<TriageOutcome> {
    let mut board = Board::load(store)?;

    let fresh = normalize(request, config);
    let labels: Vec<String> = fresh.labels.iter().cloned().collect();
    let existing = board.queue.get(request.id);
    let created = existing.is_none();
    let entry = merge(existing, fresh);

    board.queue.upsert(entry.clone());
    board.save_queue(store)?;

    tracing::info!(
        issue_id = entry.id,
        component = %entry.component,
        complexity = %entry.complexity,
        priority = entry.priority,
        status = %entry.status,
        created,
        "Triaged request"
    );

    tracker.add_labels(entry.id, &labels).await?;
    tracker.create_comment(entry.id, &summary_comment(&entry)).await?;

    Ok(TriageOutcome {
        entry,
        labels,
        created,
    })
}
