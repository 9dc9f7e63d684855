//! Adapters - collaborator integrations (issue tracker, dispatch target).
//!
//! The scheduler only sees the [`Dispatch`] and [`IssueTracker`] traits, so
//! the GitHub-backed implementation can be swapped for direct execution or a
//! test fake.

mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use github::{require_env, GitHubClient, GitHubSettings};

/// Payload handed to the dispatch target for one admitted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    pub id: u64,
    pub component: String,
    pub files: Vec<String>,
}

/// Starts a unit of work out of process.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Name recorded as the lock's agent
    fn name(&self) -> &str;

    /// Trigger the work. Returns once the target has accepted it.
    async fn dispatch(&self, work: &WorkDescriptor) -> Result<()>;
}

/// Accepts every dispatch without doing anything. Stands in for the real
/// target when a pass must not reach the network.
#[derive(Debug, Clone)]
pub struct NoopDispatch {
    name: String,
}

impl NoopDispatch {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Dispatch for NoopDispatch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, work: &WorkDescriptor) -> Result<()> {
        tracing::debug!(issue_id = work.id, "Skipping dispatch");
        Ok(())
    }
}

/// Issue-tracker operations used by triage.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch_issue(&self, id: u64) -> Result<WorkRequest>;

    async fn add_labels(&self, id: u64, labels: &[String]) -> Result<()>;

    async fn create_comment(&self, id: u64, body: &str) -> Result<()>;
}

/// A raw inbound work request (an issue).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkRequest {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Issue shape shared by webhook payloads and the REST API.
#[derive(Deserialize)]
pub(crate) struct GhIssue {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

/// Labels arrive as objects from the API and occasionally as bare strings
/// in hand-built payloads.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum GhLabel {
    Named { name: String },
    Bare(String),
}

impl GhIssue {
    pub(crate) fn into_request(self) -> WorkRequest {
        WorkRequest {
            id: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            labels: self
                .labels
                .into_iter()
                .map(|l| match l {
                    GhLabel::Named { name } => name,
                    GhLabel::Bare(name) => name,
                })
                .collect(),
        }
    }
}

impl WorkRequest {
    /// Extract the request from an issue event payload.
    ///
    /// A payload without an `issue` object carries no work request.
    pub fn from_event(payload: &serde_json::Value) -> Result<Self> {
        let issue = payload
            .get("issue")
            .filter(|v| v.is_object())
            .ok_or_else(|| Error::InvalidRequest("event payload has no issue".to_string()))?;

        let issue: GhIssue = serde_json::from_value(issue.clone())
            .map_err(|e| Error::InvalidRequest(format!("malformed issue in event: {e}")))?;

        Ok(issue.into_request())
    }

    /// Read and parse an event payload file.
    pub fn from_event_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidRequest(format!("failed to read event {}: {e}", path.display()))
        })?;
        let payload: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            Error::InvalidRequest(format!("failed to parse event {}: {e}", path.display()))
        })?;
        Self::from_event(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn from_event_reads_issue_fields() {
        let payload = json!({
            "action": "opened",
            "issue": {
                "number": 10,
                "title": "Pool leak",
                "body": "### Component\n\njdbc",
                "labels": [{"name": "bug"}, "ops"]
            }
        });

        let request = WorkRequest::from_event(&payload).unwrap();
        assert_eq!(request.id, 10);
        assert_eq!(request.title, "Pool leak");
        assert_eq!(request.labels, vec!["bug", "ops"]);
    }

    #[test]
    fn null_body_becomes_empty() {
        let payload = json!({"issue": {"number": 3, "title": "t", "body": null}});
        let request = WorkRequest::from_event(&payload).unwrap();
        assert_eq!(request.body, "");
        assert!(request.labels.is_empty());
    }

    #[test]
    fn payload_without_issue_is_invalid() {
        let err = WorkRequest::from_event(&json!({"action": "opened"})).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = WorkRequest::from_event(&json!({"issue": {"title": "no number"}})).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn work_descriptor_serializes_flat() {
        let work = WorkDescriptor {
            id: 10,
            component: "jdbc".into(),
            files: vec!["connectors/jdbc/**".into()],
        };
        assert_eq!(
            serde_json::to_value(&work).unwrap(),
            json!({"id": 10, "component": "jdbc", "files": ["connectors/jdbc/**"]})
        );
    }
}
