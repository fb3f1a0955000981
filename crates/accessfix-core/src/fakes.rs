//! In-memory collaborator fakes (testing only)
//!
//! `ScriptedIntelligence` answers completions from a closure and
//! `MemoryVcs` serves a fixed file set while recording every branch, commit
//! and pull request. Neither touches the network or the filesystem.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::domain::{IntelligenceError, VcsError};
use crate::intelligence::{CompletionRequest, Intelligence, Purpose};
use crate::vcs::{ChangeSet, PullRequestDraft, PullRequestRef, RepoRef, VersionControlClient, WorkingCopy};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ScriptedIntelligence
// ---------------------------------------------------------------------------

type Script = dyn Fn(&CompletionRequest) -> Result<String, IntelligenceError> + Send + Sync;

/// Intelligence whose replies come from a closure over the request.
pub struct ScriptedIntelligence {
    script: Box<Script>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedIntelligence {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, IntelligenceError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every request seen so far, in call order.
    pub fn calls(&self) -> Vec<CompletionRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls_for(&self, purpose: Purpose) -> usize {
        lock(&self.calls).iter().filter(|c| c.purpose == purpose).count()
    }
}

#[async_trait]
impl Intelligence for ScriptedIntelligence {
    async fn complete(&self, request: CompletionRequest) -> Result<String, IntelligenceError> {
        lock(&self.calls).push(request.clone());
        (self.script)(&request)
    }
}

// ---------------------------------------------------------------------------
// MemoryVcs
// ---------------------------------------------------------------------------

/// A commit made through [`MemoryVcs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub id: String,
    pub message: String,
    pub changes: ChangeSet,
}

/// What [`MemoryVcs`] was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsRecord {
    pub clones: usize,
    pub branches: Vec<String>,
    pub commits: Vec<RecordedCommit>,
    pub pull_requests: Vec<PullRequestDraft>,
}

#[derive(Debug, Default)]
struct Failures {
    clone: Option<VcsError>,
    branch: Option<VcsError>,
    commit: Option<VcsError>,
    pull_request: Option<VcsError>,
}

/// Version-control fake over an in-memory file set. Injected failures apply
/// to every call of that step.
#[derive(Debug, Default)]
pub struct MemoryVcs {
    files: BTreeMap<String, String>,
    failures: Failures,
    record: Mutex<VcsRecord>,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn fail_clone(mut self, error: VcsError) -> Self {
        self.failures.clone = Some(error);
        self
    }

    pub fn fail_branch(mut self, error: VcsError) -> Self {
        self.failures.branch = Some(error);
        self
    }

    pub fn fail_commit(mut self, error: VcsError) -> Self {
        self.failures.commit = Some(error);
        self
    }

    pub fn fail_pull_request(mut self, error: VcsError) -> Self {
        self.failures.pull_request = Some(error);
        self
    }

    pub fn record(&self) -> VcsRecord {
        lock(&self.record).clone()
    }
}

fn injected(failure: &Option<VcsError>) -> Result<(), VcsError> {
    match failure {
        Some(e) => Err(e.clone()),
        None => Ok(()),
    }
}

#[async_trait]
impl VersionControlClient for MemoryVcs {
    async fn clone_repository(&self, _repo: &RepoRef) -> Result<WorkingCopy, VcsError> {
        lock(&self.record).clones += 1;
        injected(&self.failures.clone)?;
        Ok(WorkingCopy::in_memory(self.files.clone()))
    }

    async fn create_branch(&self, _copy: &WorkingCopy, name: &str) -> Result<(), VcsError> {
        injected(&self.failures.branch)?;
        lock(&self.record).branches.push(name.to_string());
        Ok(())
    }

    async fn commit(
        &self,
        _copy: &WorkingCopy,
        changes: &ChangeSet,
        message: &str,
    ) -> Result<String, VcsError> {
        injected(&self.failures.commit)?;
        let mut record = lock(&self.record);
        let id = format!("commit-{}", record.commits.len() + 1);
        record.commits.push(RecordedCommit {
            id: id.clone(),
            message: message.to_string(),
            changes: changes.clone(),
        });
        Ok(id)
    }

    async fn open_pull_request(
        &self,
        repo: &RepoRef,
        _copy: &WorkingCopy,
        draft: &PullRequestDraft,
    ) -> Result<PullRequestRef, VcsError> {
        injected(&self.failures.pull_request)?;
        let mut record = lock(&self.record);
        record.pull_requests.push(draft.clone());
        let number = record.pull_requests.len() as u64;
        Ok(PullRequestRef {
            number: Some(number),
            url: format!("https://example.test/{}/pull/{number}", repo.name),
        })
    }
}
