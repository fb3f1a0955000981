//! GitHub REST client for opening pull requests.

use accessfix_core::{PullRequestDraft, PullRequestRef, RepoRef, VcsError};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::{forge_status_error, forge_transport_error, AdapterError, Result};

const DEFAULT_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("accessfix/", env!("CARGO_PKG_VERSION"));

/// GitHub API settings.
#[derive(Clone, PartialEq)]
pub struct GitHubConfig {
    pub token: String,
    pub api_url: String,
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &"<redacted>")
            .field("api_url", &self.api_url)
            .finish()
    }
}

impl GitHubConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    /// Read GITHUB_TOKEN (required) and GITHUB_API_URL.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let token = get("GITHUB_TOKEN").ok_or(AdapterError::MissingEnv("GITHUB_TOKEN"))?;
        let mut config = Self::new(token);
        if let Some(url) = get("GITHUB_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct CreatePull<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedPull {
    number: u64,
    html_url: String,
}

/// Thin wrapper over `POST /repos/{owner}/{repo}/pulls`.
pub struct GitHubClient {
    config: GitHubConfig,
    http: reqwest::Client,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(GitHubConfig::from_env()?)
    }

    #[instrument(skip(self, draft), fields(repo = %repo, branch = %draft.branch))]
    pub async fn create_pull_request(
        &self,
        repo: &RepoRef,
        draft: &PullRequestDraft,
    ) -> std::result::Result<PullRequestRef, VcsError> {
        let (owner, name) = repo.owner_and_repo().ok_or_else(|| {
            VcsError::Command(format!("repository name '{}' is not owner/repo", repo.name))
        })?;
        let url = format!("{}/repos/{owner}/{name}/pulls", self.config.api_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .json(&CreatePull {
                title: &draft.title,
                head: &draft.branch,
                base: &draft.base,
                body: &draft.body,
            })
            .send()
            .await
            .map_err(forge_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(forge_status_error(status.as_u16(), &body));
        }

        let created: CreatedPull = response
            .json()
            .await
            .map_err(|e| VcsError::Command(format!("unreadable pull request response: {e}")))?;

        info!(number = created.number, url = %created.html_url, "pull request opened");
        Ok(PullRequestRef {
            number: Some(created.number),
            url: created.html_url,
        })
    }
}
