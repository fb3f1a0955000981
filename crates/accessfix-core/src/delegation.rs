//! Delegation of located issues to domain handlers.
//!
//! [`classify`] is a flat table from file extension (then issue category,
//! then description keywords) to a [`FixDomain`]. [`DelegationRouter`] fans
//! one task out per location, bounded by a semaphore, and streams each task's
//! deltas back over a channel so the orchestrator stays the single writer.
//! A failing handler turns into data for its own location only.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::domain::{
    FixAttempt, FixDomain, HandlerError, Issue, IssueCategory, Location, LocationId,
};
use crate::intelligence::{parse_reply, CompletionRequest, Intelligence, Purpose};
use crate::prompts;
use crate::run_state::{AbandonReason, LocationOutcome, RunState, RunStateDelta, RunWarning};
use crate::stage::{RunStateView, Stage, StageKind, StageResult};
use crate::transport::{call_with_retry, TransportPolicy};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn domain_for_extension(ext: &str) -> Option<FixDomain> {
    match ext {
        ".html" | ".htm" => Some(FixDomain::Html),
        ".css" | ".scss" | ".sass" | ".less" => Some(FixDomain::Css),
        ".js" | ".jsx" | ".ts" | ".tsx" | ".mjs" | ".cjs" => Some(FixDomain::Javascript),
        _ => None,
    }
}

fn domain_for_category(category: IssueCategory) -> Option<FixDomain> {
    match category {
        IssueCategory::Aria | IssueCategory::Structural => Some(FixDomain::Html),
        IssueCategory::Contrast => Some(FixDomain::Css),
        IssueCategory::KeyboardAccess => Some(FixDomain::Javascript),
        IssueCategory::Other => None,
    }
}

const CSS_KEYWORDS: &[&str] = &[
    "color", "contrast", "focus", "outline", "font", "size", "visible", "display",
];
const JS_KEYWORDS: &[&str] = &[
    "click", "event", "keyboard", "focus", "dynamic", "interactive", "listener",
];
const HTML_KEYWORDS: &[&str] = &[
    "alt", "aria", "label", "heading", "semantic", "role", "landmark", "form",
];

fn domain_by_keywords(text: &str) -> FixDomain {
    let text = text.to_lowercase();
    let score = |words: &[&str]| words.iter().filter(|w| text.contains(*w)).count();
    let html = score(HTML_KEYWORDS);
    let css = score(CSS_KEYWORDS);
    let js = score(JS_KEYWORDS);

    if css > html && css >= js {
        FixDomain::Css
    } else if js > html && js > css {
        FixDomain::Javascript
    } else {
        FixDomain::Html
    }
}

/// Pick the owning domain for a location.
pub fn classify(issue: &Issue, location: &Location) -> FixDomain {
    location
        .extension()
        .and_then(|ext| domain_for_extension(&ext))
        .or_else(|| domain_for_category(issue.category))
        .unwrap_or_else(|| domain_by_keywords(&format!("{} {}", issue.description, location.snippet)))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Input to one handler invocation.
#[derive(Debug, Clone)]
pub struct FixRequest {
    pub issue: Issue,
    pub location: Location,
    pub attempt_number: u32,
    /// The rejected attempt this one revises.
    pub previous: Option<FixAttempt>,
    pub feedback: Option<String>,
}

/// What a handler proposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixProposal {
    pub patch: String,
    pub rationale: String,
    pub notes: Option<String>,
}

/// Produces fixes for one technology domain.
#[async_trait]
pub trait DomainHandler: Send + Sync {
    fn domain(&self) -> FixDomain;

    async fn propose(&self, request: &FixRequest) -> Result<FixProposal, HandlerError>;
}

#[derive(Debug, Deserialize)]
struct FixReply {
    #[serde(default, alias = "patch")]
    fixed_code: String,
    #[serde(default, alias = "rationale")]
    explanation: String,
    #[serde(default)]
    additional_notes: Option<String>,
}

/// Domain handler backed by the language model.
pub struct IntelligenceHandler {
    domain: FixDomain,
    intelligence: Arc<dyn Intelligence>,
    transport: TransportPolicy,
}

impl IntelligenceHandler {
    pub fn new(domain: FixDomain, intelligence: Arc<dyn Intelligence>, transport: TransportPolicy) -> Self {
        Self {
            domain,
            intelligence,
            transport,
        }
    }
}

#[async_trait]
impl DomainHandler for IntelligenceHandler {
    fn domain(&self) -> FixDomain {
        self.domain
    }

    async fn propose(&self, request: &FixRequest) -> Result<FixProposal, HandlerError> {
        let completion = CompletionRequest::new(
            Purpose::Fix(self.domain),
            request.location.id.to_string(),
            prompts::fix(self.domain, request.previous.is_some()),
            json!({
                "issue": request.issue,
                "location": request.location,
                "attempt_number": request.attempt_number,
                "previous_fix": request.previous.as_ref().map(|p| &p.patch),
                "feedback": request.feedback,
            }),
        );

        let operation = format!("fix:{}", self.domain);
        let reply = call_with_retry(&self.transport, &operation, || {
            self.intelligence.complete(completion.clone())
        })
        .await?;
        let reply: FixReply = parse_reply(&reply)?;

        if reply.fixed_code.trim().is_empty() {
            return Err(HandlerError::InvalidFix("empty fixed_code".to_string()));
        }
        if reply.fixed_code == request.location.snippet {
            return Err(HandlerError::InvalidFix(
                "fixed_code is identical to the original snippet".to_string(),
            ));
        }

        Ok(FixProposal {
            patch: reply.fixed_code,
            rationale: reply.explanation,
            notes: reply.additional_notes.filter(|n| !n.trim().is_empty()),
        })
    }
}

/// Flat domain-to-handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<FixDomain, Arc<dyn DomainHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One model-backed handler per domain.
    pub fn with_intelligence(intelligence: Arc<dyn Intelligence>, transport: &TransportPolicy) -> Self {
        let mut registry = Self::new();
        for domain in FixDomain::ALL {
            registry.register(Arc::new(IntelligenceHandler::new(
                domain,
                Arc::clone(&intelligence),
                transport.clone(),
            )));
        }
        registry
    }

    /// Register a handler under its own domain, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn DomainHandler>) {
        self.handlers.insert(handler.domain(), handler);
    }

    pub fn get(&self, domain: FixDomain) -> Option<Arc<dyn DomainHandler>> {
        self.handlers.get(&domain).cloned()
    }
}

/// `Fix(domain)` stage: one handler call for the focused location.
pub struct FixStage {
    handler: Arc<dyn DomainHandler>,
}

impl FixStage {
    pub fn new(handler: Arc<dyn DomainHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl Stage for FixStage {
    fn kind(&self) -> StageKind {
        StageKind::Fix(self.handler.domain())
    }

    async fn run(&self, view: &RunStateView) -> StageResult {
        let Some(track) = view.focus() else {
            return StageResult::Fail("fix stage needs a focused location".to_string());
        };
        if track.domain != self.handler.domain() {
            return StageResult::Fail(format!(
                "location {} is owned by {}, not {}",
                track.location.id,
                track.domain,
                self.handler.domain()
            ));
        }

        let attempt_number = track.next_attempt_number();
        if attempt_number > view.config().max_attempts {
            return StageResult::Skip(format!("attempt ceiling {} reached", view.config().max_attempts));
        }

        let request = FixRequest {
            issue: track.issue.clone(),
            location: track.location.clone(),
            attempt_number,
            previous: track.current().cloned(),
            feedback: track.last_feedback().map(str::to_string),
        };

        match self.handler.propose(&request).await {
            Ok(proposal) => {
                let mut fix = FixAttempt::new(
                    track.location.id.clone(),
                    attempt_number,
                    track.domain,
                    proposal.patch,
                    proposal.rationale,
                );
                fix.notes = proposal.notes;
                StageResult::Continue(RunStateDelta {
                    fix_attempts: vec![fix],
                    ..Default::default()
                })
            }
            Err(e) => StageResult::Fail(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out / fan-in
// ---------------------------------------------------------------------------

/// A located issue with its owning domain.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub issue: Issue,
    pub location: Location,
    pub domain: FixDomain,
}

/// A delta produced by one location's pipeline.
#[derive(Debug, Clone)]
pub struct LocationDelta {
    pub location_id: LocationId,
    pub delta: RunStateDelta,
}

/// Channel end a pipeline reports through.
#[derive(Clone)]
pub struct DeltaSink {
    location_id: LocationId,
    tx: mpsc::Sender<LocationDelta>,
    cancel: watch::Receiver<bool>,
}

impl DeltaSink {
    /// Hand a delta to the orchestrator. Returns `false` once it stopped
    /// listening.
    pub async fn send(&self, delta: RunStateDelta) -> bool {
        self.tx
            .send(LocationDelta {
                location_id: self.location_id.clone(),
                delta,
            })
            .await
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Spawned per-location tasks plus the stream of their deltas.
pub struct FanOut {
    pub events: mpsc::Receiver<LocationDelta>,
    pub tasks: Vec<(LocationId, JoinHandle<()>)>,
}

/// Delta recording a per-location failure as an abandoned outcome.
pub fn handler_failure_delta(
    location_id: &LocationId,
    attempt_number: u32,
    last_attempt: Option<u32>,
    last_feedback: Option<String>,
    error: impl Into<String>,
) -> RunStateDelta {
    RunStateDelta {
        outcomes: vec![(
            location_id.clone(),
            LocationOutcome::Abandoned {
                attempt_number: last_attempt,
                reason: AbandonReason::HandlerError,
                last_feedback,
            },
        )],
        warnings: vec![RunWarning::HandlerFailure {
            location_id: location_id.clone(),
            attempt_number,
            error: error.into(),
        }],
        ..Default::default()
    }
}

pub struct DelegationRouter {
    registry: HandlerRegistry,
    max_parallel: usize,
}

impl DelegationRouter {
    pub fn new(registry: HandlerRegistry, max_parallel: usize) -> Self {
        Self {
            registry,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Every located issue without a terminal outcome, in issue order, with
    /// its owning domain. A domain already recorded in `state` wins.
    pub fn assign(&self, state: &RunState) -> Vec<Assignment> {
        state
            .locations()
            .filter(|l| state.outcome(&l.id).is_none())
            .filter_map(|location| {
                let issue = state.issue(&location.issue_id)?;
                let domain = state
                    .domain_of(&location.id)
                    .unwrap_or_else(|| classify(issue, location));
                Some(Assignment {
                    issue: issue.clone(),
                    location: location.clone(),
                    domain,
                })
            })
            .collect()
    }

    /// Location ids grouped by owning domain.
    pub fn partition(assignments: &[Assignment]) -> BTreeMap<FixDomain, Vec<LocationId>> {
        let mut groups: BTreeMap<FixDomain, Vec<LocationId>> = BTreeMap::new();
        for a in assignments {
            groups.entry(a.domain).or_default().push(a.location.id.clone());
        }
        groups
    }

    /// Delta fixing each assignment's owning domain in the run state.
    pub fn assignment_delta(assignments: &[Assignment]) -> RunStateDelta {
        RunStateDelta {
            assignments: assignments
                .iter()
                .map(|a| (a.location.id.clone(), a.domain))
                .collect(),
            ..Default::default()
        }
    }

    /// Spawn `pipeline` once per assignment, at most `max_parallel` at a
    /// time.
    ///
    /// `pipeline` is an async closure `(Assignment, handler, sink)`; it must
    /// report everything through the sink. Assignments whose domain has no
    /// registered handler are reported as handler failures without running.
    #[instrument(skip_all, fields(locations = assignments.len(), max_parallel = self.max_parallel))]
    pub fn fan_out<P, Fut>(
        &self,
        assignments: Vec<Assignment>,
        cancel: watch::Receiver<bool>,
        pipeline: P,
    ) -> FanOut
    where
        P: Fn(Assignment, Arc<dyn DomainHandler>, DeltaSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pipeline = Arc::new(pipeline);
        let sem = Arc::new(Semaphore::new(self.max_parallel));
        let (tx, events) = mpsc::channel(assignments.len().max(1) * 4);
        let mut tasks = Vec::with_capacity(assignments.len());

        for assignment in assignments {
            let location_id = assignment.location.id.clone();
            let sink = DeltaSink {
                location_id: location_id.clone(),
                tx: tx.clone(),
                cancel: cancel.clone(),
            };
            let handler = self.registry.get(assignment.domain);
            let pipeline = Arc::clone(&pipeline);
            let sem = Arc::clone(&sem);

            let task = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();

                if sink.is_cancelled() {
                    return;
                }

                match handler {
                    Some(handler) => {
                        debug!(location_id = %assignment.location.id, domain = %assignment.domain, "pipeline started");
                        pipeline(assignment, handler, sink).await;
                    }
                    None => {
                        warn!(location_id = %assignment.location.id, domain = %assignment.domain, "no handler registered");
                        let err = HandlerError::NoHandler(assignment.domain.to_string());
                        let delta = handler_failure_delta(&assignment.location.id, 1, None, None, err.to_string());
                        sink.send(delta).await;
                    }
                }
            });
            tasks.push((location_id, task));
        }

        FanOut { events, tasks }
    }
}
