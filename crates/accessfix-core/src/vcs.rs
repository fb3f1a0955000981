//! The version-control collaborator seam.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::VcsError;

/// Repository to remediate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub url: String,
    /// `owner/repo`.
    pub name: String,
}

impl RepoRef {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
        }
    }

    /// Build from a GitHub-style URL, deriving `owner/repo`.
    ///
    /// Accepts `https://github.com/owner/repo(.git)` and
    /// `git@github.com:owner/repo(.git)`.
    pub fn from_url(url: &str) -> Option<Self> {
        let trimmed = url.trim().trim_end_matches('/');
        let path = if let Some(rest) = trimmed.strip_prefix("git@") {
            rest.split_once(':')?.1
        } else {
            let without_scheme = trimmed.split_once("://").map_or(trimmed, |(_, r)| r);
            without_scheme.split_once('/')?.1
        };
        let path = path.trim_end_matches(".git");
        let mut parts = path.split('/');
        let owner = parts.next().filter(|s| !s.is_empty())?;
        let repo = parts.next().filter(|s| !s.is_empty())?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(url.trim(), format!("{owner}/{repo}")))
    }

    /// `(owner, repo)` when the name is in `owner/repo` form.
    pub fn owner_and_repo(&self) -> Option<(&str, &str)> {
        let (owner, repo) = self.name.split_once('/')?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some((owner, repo))
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Source content of a cloned repository, keyed by repo-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingCopy {
    /// On-disk checkout, when the client keeps one.
    pub root: Option<PathBuf>,
    pub files: BTreeMap<String, String>,
}

impl WorkingCopy {
    pub fn in_memory<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        Self {
            root: None,
            files: files
                .into_iter()
                .map(|(p, c)| (p.into(), c.into()))
                .collect(),
        }
    }

    pub fn file(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// New content for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

/// Everything committed by one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub files: Vec<FileChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// An opened pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: Option<u64>,
    pub url: String,
}

/// Contents of a pull request to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDraft {
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Version-control collaborator.
#[async_trait]
pub trait VersionControlClient: Send + Sync {
    /// Fetch the repository and return its source files.
    async fn clone_repository(&self, repo: &RepoRef) -> Result<WorkingCopy, VcsError>;

    async fn create_branch(&self, copy: &WorkingCopy, name: &str) -> Result<(), VcsError>;

    /// Write `changes` and commit them; returns the commit id.
    async fn commit(
        &self,
        copy: &WorkingCopy,
        changes: &ChangeSet,
        message: &str,
    ) -> Result<String, VcsError>;

    /// Push the branch and open a pull request against `draft.base`.
    async fn open_pull_request(
        &self,
        repo: &RepoRef,
        copy: &WorkingCopy,
        draft: &PullRequestDraft,
    ) -> Result<PullRequestRef, VcsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ref_from_https_url() {
        let repo = RepoRef::from_url("https://github.com/acme/site.git").unwrap();
        assert_eq!(repo.name, "acme/site");
        assert_eq!(repo.owner_and_repo(), Some(("acme", "site")));
    }

    #[test]
    fn repo_ref_from_ssh_url() {
        let repo = RepoRef::from_url("git@github.com:acme/site.git").unwrap();
        assert_eq!(repo.name, "acme/site");
    }

    #[test]
    fn repo_ref_rejects_non_repo_paths() {
        assert!(RepoRef::from_url("https://github.com/acme").is_none());
        assert!(RepoRef::from_url("https://github.com/acme/site/tree/main").is_none());
    }

    #[test]
    fn owner_and_repo_requires_slash_form() {
        assert!(RepoRef::new("u", "site").owner_and_repo().is_none());
    }
}
