//! Stage contract.
//!
//! A stage reads an immutable [`RunStateView`] and returns a
//! [`StageResult`]; it never writes the run state. The orchestrator applies
//! the returned delta, so a stage retried after a transient failure cannot
//! corrupt anything.
//!
//! # Module layout
//!
//! - [`analyze`]: `AnalyzeStage`, one model call per source file
//! - [`locate`]: `LocateStage`, one model call per admitted issue
//!
//! The per-location stages live next to the components that drive them:
//! `FixStage` in [`crate::delegation`], `ReviewStage` in [`crate::review`],
//! `PublishStage` in [`crate::publish`] and `ReportStage` in
//! [`crate::report`].

pub mod analyze;
pub mod locate;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RunConfig;
use crate::domain::{FixAttempt, FixDomain, Issue, Location, Verdict};
use crate::run_state::{RunState, RunStateDelta};
use crate::vcs::WorkingCopy;

pub use analyze::AnalyzeStage;
pub use locate::LocateStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Analyze,
    Locate,
    Fix(FixDomain),
    Review,
    Publish,
    Report,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Analyze => write!(f, "analyze"),
            StageKind::Locate => write!(f, "locate"),
            StageKind::Fix(domain) => write!(f, "fix:{domain}"),
            StageKind::Review => write!(f, "review"),
            StageKind::Publish => write!(f, "publish"),
            StageKind::Report => write!(f, "report"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Continue(RunStateDelta),
    Fail(String),
    Skip(String),
}

impl StageResult {
    pub fn label(&self) -> &'static str {
        match self {
            StageResult::Continue(_) => "continue",
            StageResult::Fail(_) => "fail",
            StageResult::Skip(_) => "skip",
        }
    }
}

/// One location's progress as seen by the task driving its review loop.
///
/// Mirrors what that task has already sent to the orchestrator, so the fix
/// and review stages can see earlier attempts without reading the shared
/// state.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationTrack {
    pub issue: Issue,
    pub location: Location,
    /// Owning domain, fixed before the first attempt.
    pub domain: FixDomain,
    pub attempts: Vec<FixAttempt>,
    pub verdicts: Vec<Verdict>,
}

impl LocationTrack {
    pub fn new(issue: Issue, location: Location, domain: FixDomain) -> Self {
        Self {
            issue,
            location,
            domain,
            attempts: Vec::new(),
            verdicts: Vec::new(),
        }
    }

    pub fn current(&self) -> Option<&FixAttempt> {
        self.attempts.last()
    }

    pub fn next_attempt_number(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    /// Feedback of the latest verdict, if it carried any.
    pub fn last_feedback(&self) -> Option<&str> {
        self.verdicts.last().and_then(|v| v.feedback.as_deref())
    }

    /// Whether the current attempt still awaits a verdict.
    pub fn awaiting_verdict(&self) -> bool {
        match self.current() {
            Some(fix) => !self.verdicts.iter().any(|v| v.fix_id == fix.id),
            None => false,
        }
    }

    /// Record this location's attempts and verdicts from a delta.
    pub fn absorb(&mut self, delta: &RunStateDelta) {
        let id = &self.location.id;
        for fix in delta.fix_attempts.iter().filter(|f| &f.location_id == id) {
            if !self.attempts.iter().any(|f| f.id == fix.id) {
                self.attempts.push(fix.clone());
            }
        }
        for verdict in delta.verdicts.iter().filter(|v| &v.location_id == id) {
            if !self.verdicts.iter().any(|v| v.fix_id == verdict.fix_id) {
                self.verdicts.push(verdict.clone());
            }
        }
    }
}

/// Immutable input to a stage.
#[derive(Debug, Clone)]
pub struct RunStateView {
    state: Arc<RunState>,
    source: Arc<WorkingCopy>,
    config: Arc<RunConfig>,
    focus: Option<LocationTrack>,
}

impl RunStateView {
    pub fn new(state: Arc<RunState>, source: Arc<WorkingCopy>, config: Arc<RunConfig>) -> Self {
        Self {
            state,
            source,
            config,
            focus: None,
        }
    }

    /// Snapshot `state` for a run-scoped stage.
    pub fn snapshot(state: &RunState, source: Arc<WorkingCopy>, config: Arc<RunConfig>) -> Self {
        Self::new(Arc::new(state.clone()), source, config)
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn source(&self) -> &WorkingCopy {
        &self.source
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn focus(&self) -> Option<&LocationTrack> {
        self.focus.as_ref()
    }

    /// The same snapshot scoped to one location.
    pub fn focused(&self, track: LocationTrack) -> Self {
        Self {
            state: Arc::clone(&self.state),
            source: Arc::clone(&self.source),
            config: Arc::clone(&self.config),
            focus: Some(track),
        }
    }

    /// Fold a delta this view's task produced into its focus.
    pub fn absorb(&mut self, delta: &RunStateDelta) {
        if let Some(track) = self.focus.as_mut() {
            track.absorb(delta);
        }
    }
}

/// A unit of work in the run graph.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, view: &RunStateView) -> StageResult;
}
