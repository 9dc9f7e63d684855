//! GitHub adapter - REST API client for issues and repository dispatch.

use async_trait::async_trait;
use serde::Serialize;

use super::{Dispatch, GhIssue, IssueTracker, WorkDescriptor, WorkRequest};
use crate::error::{Error, Result};

const DEFAULT_API_URL: &str = "https://api.github.com";

/// Connection settings, normally taken from the Actions environment.
#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub api_url: String,
}

impl GitHubSettings {
    /// Read `GITHUB_TOKEN`, `GITHUB_REPOSITORY` and optional `GITHUB_API_URL`.
    pub fn from_env() -> Result<Self> {
        let token = require_env("GITHUB_TOKEN")?;
        let repository = require_env("GITHUB_REPOSITORY")?;
        let api_url = std::env::var("GITHUB_API_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Self::new(token, &repository, api_url)
    }

    pub fn new(token: String, repository: &str, api_url: String) -> Result<Self> {
        let (owner, repo) = repository
            .split_once('/')
            .filter(|(o, r)| !o.is_empty() && !r.is_empty() && !r.contains('/'))
            .ok_or_else(|| {
                Error::Config(format!(
                    "repository must be owner/repo, got {repository:?}"
                ))
            })?;
        Ok(Self {
            token,
            owner: owner.to_string(),
            repo: repo.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Read a required, non-empty environment variable.
pub fn require_env(name: &'static str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(Error::MissingEnv(name))
}

/// GitHub REST client. Acts as both the issue tracker and the dispatch
/// target (a `repository_dispatch` event against the same repository).
pub struct GitHubClient {
    http: reqwest::Client,
    settings: GitHubSettings,
    event_type: String,
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    event_type: &'a str,
    client_payload: &'a WorkDescriptor,
}

#[derive(Serialize)]
struct LabelsRequest<'a> {
    labels: &'a [String],
}

#[derive(Serialize)]
struct CommentRequest<'a> {
    body: &'a str,
}

impl GitHubClient {
    pub fn new(settings: GitHubSettings, event_type: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("conductor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            settings,
            event_type: event_type.into(),
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.settings.api_url, self.settings.owner, self.settings.repo, path
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.settings.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Turn a non-2xx response into an upstream error carrying the body.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Upstream {
            service: "github",
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl IssueTracker for GitHubClient {
    async fn fetch_issue(&self, id: u64) -> Result<WorkRequest> {
        let url = self.repo_url(&format!("/issues/{id}"));
        let response = self.request(reqwest::Method::GET, url).send().await?;
        let issue: GhIssue = Self::check(response).await?.json().await?;
        Ok(issue.into_request())
    }

    async fn add_labels(&self, id: u64, labels: &[String]) -> Result<()> {
        let url = self.repo_url(&format!("/issues/{id}/labels"));
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&LabelsRequest { labels })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn create_comment(&self, id: u64, body: &str) -> Result<()> {
        let url = self.repo_url(&format!("/issues/{id}/comments"));
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&CommentRequest { body })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Dispatch for GitHubClient {
    fn name(&self) -> &str {
        &self.event_type
    }

    async fn dispatch(&self, work: &WorkDescriptor) -> Result<()> {
        tracing::info!(
            issue_id = work.id,
            event_type = %self.event_type,
            "Sending repository dispatch"
        );

        let url = self.repo_url("/dispatches");
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&DispatchRequest {
                event_type: &self.event_type,
                client_payload: work,
            })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_split_repository() {
        let settings =
            GitHubSettings::new("t".into(), "acme/connectors", "https://ghe.local/api/v3/".into())
                .unwrap();
        assert_eq!(settings.owner, "acme");
        assert_eq!(settings.repo, "connectors");
        assert_eq!(settings.api_url, "https://ghe.local/api/v3");
    }

    #[test]
    fn settings_reject_malformed_repository() {
        for bad in ["acme", "acme/", "/repo", "a/b/c"] {
            let err = GitHubSettings::new("t".into(), bad, DEFAULT_API_URL.into()).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{bad} should be rejected");
        }
    }

    #[test]
    fn repo_urls_are_scoped_to_repository() {
        let settings =
            GitHubSettings::new("t".into(), "acme/connectors", DEFAULT_API_URL.into()).unwrap();
        let client = GitHubClient::new(settings, "agent-task").unwrap();

        assert_eq!(
            client.repo_url("/issues/10/labels"),
            "https://api.github.com/repos/acme/connectors/issues/10/labels"
        );
        assert_eq!(client.name(), "agent-task");
    }
}
