//! Publication of approved fixes.
//!
//! All approved locations go out as one branch, one commit and one pull
//! request. A failing step marks the publication failed; the run state is
//! never rolled back.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::RunConfig;
use crate::domain::{Issue, Location, LocationId, Severity};
use crate::obs;
use crate::run_state::{RunState, RunStateDelta, RunWarning};
use crate::stage::{RunStateView, Stage, StageKind, StageResult};
use crate::transport::call_with_retry;
use crate::vcs::{ChangeSet, FileChange, PullRequestDraft, PullRequestRef, RepoRef, VersionControlClient, WorkingCopy};

const COMMIT_LIST_LIMIT: usize = 5;
const COMMIT_LINE_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStep {
    Branch,
    Commit,
    PullRequest,
}

impl std::fmt::Display for PublishStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PublishStep::Branch => "branch",
            PublishStep::Commit => "commit",
            PublishStep::PullRequest => "pull_request",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishResult {
    Published {
        branch: String,
        commit: String,
        pull_request: PullRequestRef,
        files: Vec<String>,
        locations: Vec<LocationId>,
    },
    Failed {
        step: PublishStep,
        error: String,
    },
    NothingToPublish,
    Skipped {
        reason: String,
    },
}

impl PublishResult {
    pub fn label(&self) -> &'static str {
        match self {
            PublishResult::Published { .. } => "published",
            PublishResult::Failed { .. } => "failed",
            PublishResult::NothingToPublish => "nothing_to_publish",
            PublishResult::Skipped { .. } => "skipped",
        }
    }
}

/// Change set built from the approved locations.
#[derive(Debug, Clone, Default)]
pub struct PreparedChanges {
    pub change_set: ChangeSet,
    /// Locations whose patch made it into the change set.
    pub applied: Vec<(Issue, Location)>,
    pub warnings: Vec<RunWarning>,
}

/// Apply every approved location's current patch to its file.
///
/// Each patch replaces the first occurrence of the location's snippet;
/// patches to the same file accumulate in issue order. A snippet that is no
/// longer present yields a `PatchNotApplied` warning.
pub fn prepare_changes(state: &RunState, source: &WorkingCopy) -> PreparedChanges {
    let mut by_file: BTreeMap<&str, Vec<&Location>> = BTreeMap::new();
    for location in state.approved_locations() {
        by_file.entry(location.file_path.as_str()).or_default().push(location);
    }

    let mut prepared = PreparedChanges::default();
    for (path, locations) in by_file {
        let original = source.file(path);
        let mut content = original.unwrap_or_default().to_string();

        for location in locations {
            let fix = state.current_fix(&location.id);
            let issue = state.issue(&location.issue_id);
            match (original, fix, issue) {
                (Some(_), Some(fix), Some(issue)) if content.contains(&location.snippet) => {
                    content = content.replacen(&location.snippet, &fix.patch, 1);
                    prepared.applied.push((issue.clone(), location.clone()));
                }
                _ => {
                    warn!(location_id = %location.id, file = %path, "approved patch could not be applied");
                    prepared.warnings.push(RunWarning::PatchNotApplied {
                        location_id: location.id.clone(),
                        file_path: path.to_string(),
                    });
                }
            }
        }

        if original.is_some_and(|o| o != content) {
            prepared.change_set.files.push(FileChange {
                path: path.to_string(),
                content,
            });
        }
    }
    prepared
}

fn clip(text: &str, limit: usize) -> String {
    crate::intelligence::truncate_chars(text.trim(), limit).to_string()
}

pub fn commit_message(applied: &[(Issue, Location)]) -> String {
    let count = applied.len();
    let mut message = format!("fix: Apply {count} accessibility fixes\n\n");
    message.push_str("This commit addresses the following accessibility issues:\n\n");
    for (i, (issue, _)) in applied.iter().take(COMMIT_LIST_LIMIT).enumerate() {
        let _ = writeln!(message, "{}. {}", i + 1, clip(&issue.description, COMMIT_LINE_CHARS));
    }
    if count > COMMIT_LIST_LIMIT {
        let _ = writeln!(message, "\n... and {} more fixes", count - COMMIT_LIST_LIMIT);
    }
    message
}

pub fn pull_request_body(applied: &[(Issue, Location)]) -> String {
    let mut body = String::from("## Accessibility Fixes\n\n");
    let _ = writeln!(body, "This PR addresses **{}** accessibility issues.\n", applied.len());

    body.push_str("### Summary\n\n");
    for severity in Severity::ALL {
        let n = applied.iter().filter(|(i, _)| i.severity == severity).count();
        if n > 0 {
            let _ = writeln!(body, "- **{severity}**: {n}");
        }
    }

    body.push_str("\n### Changes\n\n");
    let mut by_file: BTreeMap<&str, Vec<&Issue>> = BTreeMap::new();
    for (issue, location) in applied {
        by_file.entry(location.file_path.as_str()).or_default().push(issue);
    }
    for (path, issues) in by_file {
        let _ = writeln!(body, "- `{path}`");
        for issue in issues {
            let _ = writeln!(
                body,
                "  - [{} / {}] {}",
                issue.criterion,
                issue.severity,
                clip(&issue.description, 120)
            );
        }
    }
    body
}

/// Turns approved fixes into version-control actions.
#[derive(Clone)]
pub struct PublishGateway {
    vcs: Arc<dyn VersionControlClient>,
}

impl PublishGateway {
    pub fn new(vcs: Arc<dyn VersionControlClient>) -> Self {
        Self { vcs }
    }

    /// Run the branch / commit / pull-request sequence for `state`.
    #[instrument(skip_all, fields(repo = %repo))]
    pub async fn publish(
        &self,
        repo: &RepoRef,
        copy: &WorkingCopy,
        state: &RunState,
        config: &RunConfig,
    ) -> (PublishResult, Vec<RunWarning>) {
        let prepared = prepare_changes(state, copy);
        let warnings = prepared.warnings.clone();
        if prepared.change_set.is_empty() {
            info!("no approved fixes to publish");
            return (PublishResult::NothingToPublish, warnings);
        }

        let branch = config.branch_name.as_str();
        let transport = &config.transport;

        if let Err(e) = call_with_retry(transport, "create_branch", || {
            self.vcs.create_branch(copy, branch)
        })
        .await
        {
            return (failed(PublishStep::Branch, e), warnings);
        }

        let message = commit_message(&prepared.applied);
        let commit = match call_with_retry(transport, "commit", || {
            self.vcs.commit(copy, &prepared.change_set, &message)
        })
        .await
        {
            Ok(commit) => commit,
            Err(e) => return (failed(PublishStep::Commit, e), warnings),
        };

        let draft = PullRequestDraft {
            branch: branch.to_string(),
            base: config.base_branch.clone(),
            title: config.pull_request_title.clone(),
            body: pull_request_body(&prepared.applied),
        };
        let pull_request = match call_with_retry(transport, "open_pull_request", || {
            self.vcs.open_pull_request(repo, copy, &draft)
        })
        .await
        {
            Ok(pr) => pr,
            Err(e) => return (failed(PublishStep::PullRequest, e), warnings),
        };

        info!(url = %pull_request.url, files = prepared.change_set.files.len(), "pull request opened");
        let result = PublishResult::Published {
            branch: branch.to_string(),
            commit,
            pull_request,
            files: prepared.change_set.paths(),
            locations: prepared.applied.iter().map(|(_, l)| l.id.clone()).collect(),
        };
        (result, warnings)
    }
}

fn failed(step: PublishStep, error: impl std::fmt::Display) -> PublishResult {
    warn!(step = %step, error = %error, "publish step failed");
    PublishResult::Failed {
        step,
        error: error.to_string(),
    }
}

/// `Publish` stage: one publication for the whole run.
pub struct PublishStage {
    gateway: PublishGateway,
    repo: RepoRef,
}

impl PublishStage {
    pub fn new(gateway: PublishGateway, repo: RepoRef) -> Self {
        Self { gateway, repo }
    }
}

#[async_trait]
impl Stage for PublishStage {
    fn kind(&self) -> StageKind {
        StageKind::Publish
    }

    async fn run(&self, view: &RunStateView) -> StageResult {
        if view.state().publish_result().is_some() {
            return StageResult::Skip("already published".to_string());
        }
        let (result, warnings) = self
            .gateway
            .publish(&self.repo, view.source(), view.state(), view.config())
            .await;

        let files = match &result {
            PublishResult::Published { files, .. } => files.len(),
            _ => 0,
        };
        let detail = match &result {
            PublishResult::Published { pull_request, .. } => Some(pull_request.url.clone()),
            PublishResult::Failed { step, error } => Some(format!("{step}: {error}")),
            _ => None,
        };
        obs::emit_publish_finished(result.label(), files, detail.as_deref());

        StageResult::Continue(RunStateDelta {
            warnings,
            publish_result: Some(result),
            ..Default::default()
        })
    }
}
