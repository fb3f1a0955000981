//! [`VersionControlClient`] backed by the `git` CLI.
//!
//! Clones are shallow and live in temporary directories owned by the
//! client; they are removed when the client is dropped. Pull requests go
//! through [`GitHubClient`] after the branch is pushed.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use accessfix_core::{
    ChangeSet, PullRequestDraft, PullRequestRef, RepoRef, VcsError, VersionControlClient,
    WorkingCopy,
};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::error::git_error;
use crate::github::GitHubClient;

/// Source extensions collected from a clone.
pub const SOURCE_EXTENSIONS: &[&str] = &["html", "htm", "css", "js", "jsx", "tsx", "vue"];

/// Directories never descended into.
pub const SKIP_DIRS: &[&str] = &[".git", "node_modules", "__pycache__", "dist", "build"];

/// Author recorded on fix commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "accessfix".to_string(),
            email: "accessfix@users.noreply.github.com".to_string(),
        }
    }
}

pub struct GitCliClient {
    github: Option<GitHubClient>,
    identity: GitIdentity,
    workspaces: Mutex<Vec<TempDir>>,
}

impl GitCliClient {
    /// Without a [`GitHubClient`], `open_pull_request` fails before pushing.
    pub fn new(github: Option<GitHubClient>) -> Self {
        Self {
            github,
            identity: GitIdentity::default(),
            workspaces: Mutex::new(Vec::new()),
        }
    }

    pub fn with_identity(mut self, identity: GitIdentity) -> Self {
        self.identity = identity;
        self
    }

    fn keep(&self, dir: TempDir) {
        self.workspaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dir);
    }
}

/// Run git in `dir` and return trimmed stdout.
async fn git(dir: Option<&Path>, args: &[&str]) -> Result<String, VcsError> {
    let mut command = Command::new("git");
    command
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }

    let label = args.first().copied().unwrap_or("");
    debug!(command = %args.join(" "), "running git");
    let output = command
        .output()
        .await
        .map_err(|e| VcsError::Command(format!("failed to run git {label}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(git_error(label, &detail));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn checkout_root(copy: &WorkingCopy) -> Result<&Path, VcsError> {
    copy.root
        .as_deref()
        .ok_or_else(|| VcsError::Command("working copy has no checkout on disk".to_string()))
}

/// Resolve a repo-relative path, refusing anything that leaves the checkout.
fn resolve(root: &Path, relative: &str) -> Result<PathBuf, VcsError> {
    let path = Path::new(relative);
    let escapes = path.components().any(|c| {
        matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });
    if escapes || relative.is_empty() {
        return Err(VcsError::Command(format!(
            "refusing to write outside the checkout: {relative}"
        )));
    }
    Ok(root.join(path))
}

/// Collect source files under `root`, keyed by `/`-separated relative path.
pub fn collect_sources(root: &Path) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_str().unwrap_or("");
            !SKIP_DIRS.contains(&name)
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !SOURCE_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        match std::fs::read_to_string(path) {
            Ok(content) => {
                files.insert(key, content);
            }
            Err(e) => warn!(file = %key, error = %e, "skipping unreadable source file"),
        }
    }

    files
}

#[async_trait]
impl VersionControlClient for GitCliClient {
    #[instrument(skip(self), fields(repo = %repo))]
    async fn clone_repository(&self, repo: &RepoRef) -> Result<WorkingCopy, VcsError> {
        let workspace = tempfile::Builder::new()
            .prefix("accessfix-")
            .tempdir()
            .map_err(|e| VcsError::Command(format!("failed to create workspace: {e}")))?;
        let checkout = workspace.path().join("repo");
        let target = checkout.to_string_lossy().to_string();

        git(None, &["clone", "--depth", "1", &repo.url, &target]).await?;

        let root = checkout.clone();
        let files = tokio::task::spawn_blocking(move || collect_sources(&root))
            .await
            .map_err(|e| VcsError::Command(format!("source discovery failed: {e}")))?;

        info!(files = files.len(), "repository cloned");
        self.keep(workspace);
        Ok(WorkingCopy {
            root: Some(checkout),
            files,
        })
    }

    #[instrument(skip(self, copy))]
    async fn create_branch(&self, copy: &WorkingCopy, name: &str) -> Result<(), VcsError> {
        let root = checkout_root(copy)?;
        git(Some(root), &["checkout", "-b", name]).await?;
        Ok(())
    }

    #[instrument(skip(self, copy, changes, message), fields(files = changes.files.len()))]
    async fn commit(
        &self,
        copy: &WorkingCopy,
        changes: &ChangeSet,
        message: &str,
    ) -> Result<String, VcsError> {
        let root = checkout_root(copy)?;
        if changes.is_empty() {
            return Err(VcsError::Command("nothing to commit".to_string()));
        }

        for change in &changes.files {
            let path = resolve(root, &change.path)?;
            tokio::fs::write(&path, &change.content)
                .await
                .map_err(|e| VcsError::Command(format!("failed to write {}: {e}", change.path)))?;
        }

        let mut add = vec!["add", "--"];
        add.extend(changes.files.iter().map(|f| f.path.as_str()));
        git(Some(root), &add).await?;

        let name = format!("user.name={}", self.identity.name);
        let email = format!("user.email={}", self.identity.email);
        git(
            Some(root),
            &["-c", &name, "-c", &email, "commit", "--no-verify", "-m", message],
        )
        .await?;

        let sha = git(Some(root), &["rev-parse", "HEAD"]).await?;
        info!(commit = %sha, "fixes committed");
        Ok(sha)
    }

    #[instrument(skip(self, copy, draft), fields(repo = %repo, branch = %draft.branch))]
    async fn open_pull_request(
        &self,
        repo: &RepoRef,
        copy: &WorkingCopy,
        draft: &PullRequestDraft,
    ) -> Result<PullRequestRef, VcsError> {
        let github = self
            .github
            .as_ref()
            .ok_or_else(|| VcsError::Auth("no GitHub token configured".to_string()))?;
        let root = checkout_root(copy)?;

        git(Some(root), &["push", "-u", "origin", &draft.branch]).await?;
        github.create_pull_request(repo, draft).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_escapes() {
        let root = Path::new("/tmp/checkout");
        assert!(resolve(root, "../etc/passwd").is_err());
        assert!(resolve(root, "/etc/passwd").is_err());
        assert!(resolve(root, "").is_err());
        assert_eq!(
            resolve(root, "src/index.html").unwrap(),
            PathBuf::from("/tmp/checkout/src/index.html")
        );
    }

    #[test]
    fn collect_sources_filters_extensions_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/lib")).unwrap();
        std::fs::create_dir_all(root.join("dist")).unwrap();
        std::fs::write(root.join("index.html"), "<html></html>").unwrap();
        std::fs::write(root.join("src/App.VUE"), "<template/>").unwrap();
        std::fs::write(root.join("src/main.py"), "print()").unwrap();
        std::fs::write(root.join("node_modules/lib/x.js"), "x").unwrap();
        std::fs::write(root.join("dist/bundle.js"), "x").unwrap();
        std::fs::write(root.join("src/bad.js"), [0xff, 0xfe, 0x00]).unwrap();

        let files = collect_sources(root);
        let keys: Vec<&str> = files.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["index.html", "src/App.VUE"]);
    }

    #[tokio::test]
    async fn branch_without_checkout_is_a_command_error() {
        let client = GitCliClient::new(None);
        let err = client
            .create_branch(&WorkingCopy::default(), "a11y")
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::Command(_)));
    }
}
