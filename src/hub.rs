//! Review/tracking collaborator over the GitHub REST API.
//!
//! Merge proposals become pull requests; human escalation and coordination
//! locks both ride on labeled issues. The trait keeps the orchestrator and
//! the lock store testable without a network.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("mender/", env!("CARGO_PKG_VERSION"));

/// An open pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRef {
    pub number: u64,
    pub url: String,
}

/// An open issue. `created_at` feeds the coordination-lock expiry check.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueRef {
    pub number: u64,
    pub title: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Result of an idempotent tracking-issue request.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingOutcome {
    pub issue: IssueRef,
    pub already_existed: bool,
}

#[async_trait]
pub trait ReviewHub: Send + Sync {
    async fn open_change_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<ChangeRef>;

    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<IssueRef>;

    async fn list_open_issues(&self, label: &str) -> Result<Vec<IssueRef>>;

    async fn close_issue(&self, number: u64) -> Result<()>;

    async fn comment(&self, number: u64, body: &str) -> Result<()>;

    /// Open an issue unless one already carries the dedupe label. Calling
    /// this twice for the same label yields exactly one issue.
    async fn open_tracking_issue(
        &self,
        title: &str,
        body: &str,
        dedupe_label: &str,
    ) -> Result<TrackingOutcome> {
        if let Some(existing) = self.list_open_issues(dedupe_label).await?.into_iter().next() {
            return Ok(TrackingOutcome {
                issue: existing,
                already_existed: true,
            });
        }
        let issue = self
            .create_issue(title, body, &[dedupe_label.to_string()])
            .await?;
        Ok(TrackingOutcome {
            issue,
            already_existed: false,
        })
    }
}

/// A GitHub issue (subset of fields). Pull requests also come through the
/// issues endpoint; filter them out.
#[derive(Debug, Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    html_url: String,
    created_at: DateTime<Utc>,
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    number: u64,
    html_url: String,
}

/// `ReviewHub` against a real `owner/repo` on GitHub.
pub struct GitHubHub {
    client: reqwest::Client,
    token: String,
    repo: String,
    base_url: String,
}

impl GitHubHub {
    /// `repo` is the `owner/repo` slug, e.g. from `GITHUB_REPOSITORY`.
    pub fn new(token: String, repo: String) -> Result<Self> {
        if !repo.contains('/') {
            anyhow::bail!("Repository must be an owner/repo slug, got '{}'", repo);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            token,
            repo,
            base_url: GITHUB_API_URL.to_string(),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/repos/{}{}", self.base_url, self.repo, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }
}

#[async_trait]
impl ReviewHub for GitHubHub {
    async fn open_change_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<ChangeRef> {
        let resp = self
            .request(reqwest::Method::POST, "/pulls")
            .json(&json!({
                "title": title,
                "body": body,
                "head": head,
                "base": base,
            }))
            .send()
            .await
            .context("Failed to send pull request creation to GitHub")?
            .error_for_status()
            .context("GitHub rejected the pull request")?;
        let pull: ApiPull = resp
            .json()
            .await
            .context("Failed to parse pull request response")?;
        Ok(ChangeRef {
            number: pull.number,
            url: pull.html_url,
        })
    }

    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<IssueRef> {
        let resp = self
            .request(reqwest::Method::POST, "/issues")
            .json(&json!({
                "title": title,
                "body": body,
                "labels": labels,
            }))
            .send()
            .await
            .context("Failed to send issue creation to GitHub")?
            .error_for_status()
            .context("GitHub rejected the issue")?;
        let issue: ApiIssue = resp.json().await.context("Failed to parse issue response")?;
        Ok(IssueRef {
            number: issue.number,
            title: issue.title,
            url: issue.html_url,
            created_at: issue.created_at,
        })
    }

    async fn list_open_issues(&self, label: &str) -> Result<Vec<IssueRef>> {
        let resp = self
            .request(reqwest::Method::GET, "/issues")
            .query(&[("state", "open"), ("labels", label), ("per_page", "100")])
            .send()
            .await
            .context("Failed to list issues from GitHub")?
            .error_for_status()
            .context("GitHub rejected the issue listing")?;
        let issues: Vec<ApiIssue> = resp
            .json()
            .await
            .context("Failed to parse issue listing")?;
        Ok(issues
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(|i| IssueRef {
                number: i.number,
                title: i.title,
                url: i.html_url,
                created_at: i.created_at,
            })
            .collect())
    }

    async fn close_issue(&self, number: u64) -> Result<()> {
        self.request(reqwest::Method::PATCH, &format!("/issues/{}", number))
            .json(&json!({ "state": "closed" }))
            .send()
            .await
            .context("Failed to send issue close to GitHub")?
            .error_for_status()
            .context("GitHub rejected the issue close")?;
        Ok(())
    }

    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("/issues/{}/comments", number),
        )
        .json(&json!({ "body": body }))
        .send()
        .await
        .context("Failed to send issue comment to GitHub")?
        .error_for_status()
        .context("GitHub rejected the comment")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn rejects_bare_repo_name() {
        assert!(GitHubHub::new("t".into(), "no-owner".into()).is_err());
        assert!(GitHubHub::new("t".into(), "owner/repo".into()).is_ok());
    }

    #[test]
    fn base_url_is_overridable_for_tests() {
        let hub = GitHubHub::new("t".into(), "o/r".into())
            .unwrap()
            .with_base_url("http://127.0.0.1:9".into());
        assert_eq!(hub.base_url, "http://127.0.0.1:9");
    }

    // ── default open_tracking_issue over a mock hub ─────────────────────

    struct MockHub {
        open: Mutex<Vec<IssueRef>>,
        created: Mutex<u32>,
    }

    impl MockHub {
        fn new() -> Self {
            Self {
                open: Mutex::new(Vec::new()),
                created: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ReviewHub for MockHub {
        async fn open_change_request(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<ChangeRef> {
            unimplemented!()
        }

        async fn create_issue(
            &self,
            title: &str,
            _body: &str,
            _labels: &[String],
        ) -> Result<IssueRef> {
            *self.created.lock().unwrap() += 1;
            let issue = IssueRef {
                number: *self.created.lock().unwrap() as u64,
                title: title.to_string(),
                url: "http://example/1".into(),
                created_at: Utc::now(),
            };
            self.open.lock().unwrap().push(issue.clone());
            Ok(issue)
        }

        async fn list_open_issues(&self, _label: &str) -> Result<Vec<IssueRef>> {
            Ok(self.open.lock().unwrap().clone())
        }

        async fn close_issue(&self, _number: u64) -> Result<()> {
            Ok(())
        }

        async fn comment(&self, _number: u64, _body: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn tracking_issue_is_idempotent() {
        let hub = MockHub::new();
        let first = hub
            .open_tracking_issue("escalation", "body", "mender-escalation-f1")
            .await
            .unwrap();
        assert!(!first.already_existed);

        let second = hub
            .open_tracking_issue("escalation", "body", "mender-escalation-f1")
            .await
            .unwrap();
        assert!(second.already_existed);
        assert_eq!(second.issue.number, first.issue.number);
        assert_eq!(*hub.created.lock().unwrap(), 1);
    }
}
