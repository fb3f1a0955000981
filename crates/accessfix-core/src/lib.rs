//! accessfix core library
//!
//! Run state, stage graph, delegation, review loop, publication and
//! reporting for automated accessibility remediation. Collaborators (the
//! language model and version control) are traits; concrete clients live in
//! `accessfix-adapters`, in-memory fakes in [`fakes`].

pub mod config;
pub mod delegation;
pub mod domain;
pub mod fakes;
pub mod intelligence;
pub mod obs;
pub mod orchestrator;
pub mod prompts;
pub mod publish;
pub mod report;
pub mod review;
pub mod run_state;
pub mod stage;
pub mod telemetry;
pub mod transport;
pub mod vcs;

pub use config::RunConfig;

pub use domain::{
    ConfigError, Decision, FixAttempt, FixDomain, FixId, HandlerError, IntelligenceError, Issue,
    IssueCategory, IssueId, LineRange, Location, LocationId, OrchestratorError, Result, Severity,
    StateError, Transient, VcsError, Verdict,
};

pub use delegation::{
    classify, DelegationRouter, DomainHandler, FixProposal, FixRequest, FixStage, HandlerRegistry,
    IntelligenceHandler,
};
pub use intelligence::{CompletionRequest, Intelligence, Purpose};
pub use orchestrator::{cancel_pair, CancelHandle, CancelSignal, Orchestrator};
pub use publish::{PublishGateway, PublishResult, PublishStage, PublishStep};
pub use report::{LocationReport, Report, ReportOutcome, ReportStage};
pub use review::{IntelligenceJudge, Judge, Judgment, LoopState, ReviewLoop, ReviewRequest, ReviewStage};
pub use run_state::{
    AbandonReason, LocationOutcome, RunState, RunStateDelta, RunStatus, RunWarning,
};
pub use stage::{RunStateView, Stage, StageKind, StageResult};
pub use telemetry::init_tracing;
pub use transport::{call_with_retry, TransportPolicy};
pub use vcs::{
    ChangeSet, FileChange, PullRequestDraft, PullRequestRef, RepoRef, VersionControlClient,
    WorkingCopy,
};
