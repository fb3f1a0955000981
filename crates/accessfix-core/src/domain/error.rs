//! Error taxonomy for accessfix.
//!
//! Collaborator errors ([`IntelligenceError`], [`VcsError`]) are classified
//! by [`Transient`] for the transport retry layer. Per-location failures are
//! [`HandlerError`]s and never abort a run; [`OrchestratorError`] carries the
//! fatal ones.

use std::time::Duration;

use crate::domain::fix::FixId;
use crate::domain::issue::IssueId;
use crate::domain::location::LocationId;

/// Errors a transport retry can classify.
pub trait Transient {
    /// Whether a retry may succeed.
    fn is_transient(&self) -> bool;

    /// Error to report when one call exceeded its timeout.
    fn timed_out(after: Duration) -> Self;
}

/// Failures of the language-model collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntelligenceError {
    #[error("intelligence unavailable: {0}")]
    Unavailable(String),

    #[error("intelligence quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("intelligence call timed out after {0:?}")]
    Timeout(Duration),

    #[error("intelligence rejected the request: {0}")]
    Rejected(String),

    #[error("malformed intelligence response: {0}")]
    MalformedResponse(String),
}

impl Transient for IntelligenceError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::QuotaExceeded(_) | Self::Timeout(_)
        )
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

/// Failures of the version-control collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VcsError {
    #[error("vcs authentication failed: {0}")]
    Auth(String),

    #[error("vcs network error: {0}")]
    Network(String),

    #[error("vcs call timed out after {0:?}")]
    Timeout(Duration),

    #[error("vcs command failed: {0}")]
    Command(String),
}

impl Transient for VcsError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

/// Per-location failure of a domain handler or the judge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Intelligence(#[from] IntelligenceError),

    #[error("handler returned an unusable fix: {0}")]
    InvalidFix(String),

    #[error("no handler registered for domain {0}")]
    NoHandler(String),

    #[error("handler task panicked or was aborted: {0}")]
    Task(String),
}

/// Rejections from [`crate::run_state::RunState::apply`]. A rejected delta
/// leaves the state untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("run is no longer accepting changes (status {0})")]
    Closed(String),

    #[error("location {location} references unknown issue {issue}")]
    UnknownIssue { location: LocationId, issue: IssueId },

    #[error("fix attempt {fix} references unknown location {location}")]
    UnknownLocation { fix: FixId, location: LocationId },

    #[error("fix attempt {fix} is out of sequence: expected attempt {expected}")]
    AttemptGap { fix: FixId, expected: u32 },

    #[error("unknown location {0}")]
    UnknownLocationId(LocationId),

    #[error("verdict references unknown fix attempt {0}")]
    UnknownFix(FixId),

    #[error("fix attempt {0} already has a different verdict")]
    ConflictingVerdict(FixId),

    #[error("verdict for {0} is missing required feedback")]
    MissingFeedback(FixId),

    #[error("location {0} already reached a terminal outcome")]
    AlreadyTerminal(LocationId),

    #[error("location {location} is owned by {owner}, not {requested}")]
    DomainReassigned {
        location: LocationId,
        owner: String,
        requested: String,
    },

    #[error("publish result already recorded")]
    AlreadyPublished,

    #[error("status cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

/// Invalid run configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal run errors, surfaced to the caller of
/// [`crate::orchestrator::Orchestrator::execute`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("repository {repo} unavailable: {source}")]
    RepoUnavailable {
        repo: String,
        #[source]
        source: VcsError,
    },

    #[error("analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("stage {stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },

    #[error("run state rejected a change: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for run-level operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
