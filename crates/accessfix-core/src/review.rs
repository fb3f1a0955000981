//! Review loop: judge each attempt, revise or settle the location.
//!
//! Per location the loop is an explicit state machine:
//!
//! ```text
//! Drafting ──fix──▶ Pending ──approved──────────────▶ Approved
//!                     │  ▲ ──abandoned / ceiling─────▶ Abandoned
//!              revise │  │ fix (attempt + 1)
//!                     ▼  │
//!                   Revising
//! ```
//!
//! [`LoopState::on_judgment`] is the only place the ceiling is applied: a
//! `revise` at `attempt >= max_attempts` becomes `Abandoned`, so no location
//! ever gets more than `max_attempts` attempts.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::{Decision, FixAttempt, HandlerError, Issue, Location, Verdict};
use crate::intelligence::{parse_reply, CompletionRequest, Intelligence, Purpose};
use crate::obs;
use crate::prompts;
use crate::run_state::{AbandonReason, LocationOutcome, RunStateDelta, RunWarning};
use crate::stage::{RunStateView, Stage, StageKind, StageResult};
use crate::transport::{call_with_retry, TransportPolicy};

const DEFAULT_REVISE_FEEDBACK: &str = "reviewer requested changes without details";
const DEFAULT_ABANDON_FEEDBACK: &str = "reviewer judged the issue not fixable at this location";

// ---------------------------------------------------------------------------
// Judge
// ---------------------------------------------------------------------------

/// Input to one judgment.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub issue: Issue,
    pub location: Location,
    pub fix: FixAttempt,
}

/// A judge's raw decision, before the ceiling is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgment {
    pub decision: Decision,
    pub feedback: Option<String>,
    pub criteria_checked: BTreeSet<String>,
    pub rating: Option<u8>,
}

impl Judgment {
    pub fn approved() -> Self {
        Self {
            decision: Decision::Approved,
            feedback: None,
            criteria_checked: BTreeSet::new(),
            rating: None,
        }
    }

    pub fn revise(feedback: impl Into<String>) -> Self {
        Self {
            decision: Decision::Revise,
            feedback: Some(feedback.into()),
            ..Self::approved()
        }
    }

    pub fn abandoned(feedback: impl Into<String>) -> Self {
        Self {
            decision: Decision::Abandoned,
            feedback: Some(feedback.into()),
            ..Self::approved()
        }
    }

    /// Feedback text, falling back to a generic note for non-approvals.
    fn feedback_or_default(&self) -> String {
        match self.feedback.as_deref().map(str::trim) {
            Some(f) if !f.is_empty() => f.to_string(),
            _ => match self.decision {
                Decision::Abandoned => DEFAULT_ABANDON_FEEDBACK.to_string(),
                _ => DEFAULT_REVISE_FEEDBACK.to_string(),
            },
        }
    }
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, request: &ReviewRequest) -> Result<Judgment, HandlerError>;
}

/// Judge reply. Accepts both `{"decision": ...}` and the
/// `{"approved": bool, "weaknesses": [...]}` critic form.
#[derive(Debug, Default, Deserialize)]
struct JudgeReply {
    #[serde(default)]
    decision: Option<String>,
    #[serde(default)]
    approved: Option<bool>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    criteria_checked: Vec<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    weaknesses: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    concerns: Vec<String>,
}

impl JudgeReply {
    fn into_judgment(self) -> Result<Judgment, HandlerError> {
        let decision = match (self.decision.as_deref().map(str::to_lowercase), self.approved) {
            (Some(d), _) if d == "approved" || d == "approve" => Decision::Approved,
            (Some(d), _) if d == "revise" || d == "rejected" || d == "reject" => Decision::Revise,
            (Some(d), _) if d == "abandoned" || d == "abandon" => Decision::Abandoned,
            (_, Some(true)) => Decision::Approved,
            (_, Some(false)) => Decision::Revise,
            (d, None) => {
                return Err(HandlerError::InvalidFix(format!(
                    "judge reply has no usable decision ({})",
                    d.unwrap_or_else(|| "missing".to_string())
                )))
            }
        };

        let feedback = self.feedback.filter(|f| !f.trim().is_empty()).or_else(|| {
            let points: Vec<String> = self
                .weaknesses
                .into_iter()
                .chain(self.concerns)
                .chain(self.suggestions)
                .filter(|p| !p.trim().is_empty())
                .collect();
            (!points.is_empty()).then(|| points.join("; "))
        });

        Ok(Judgment {
            decision,
            feedback,
            criteria_checked: self.criteria_checked.into_iter().collect(),
            rating: self.rating.map(|r| r.clamp(0.0, 10.0).round() as u8),
        })
    }
}

/// Judge backed by the language model.
pub struct IntelligenceJudge {
    intelligence: Arc<dyn Intelligence>,
    transport: TransportPolicy,
}

impl IntelligenceJudge {
    pub fn new(intelligence: Arc<dyn Intelligence>, transport: TransportPolicy) -> Self {
        Self {
            intelligence,
            transport,
        }
    }
}

#[async_trait]
impl Judge for IntelligenceJudge {
    async fn judge(&self, request: &ReviewRequest) -> Result<Judgment, HandlerError> {
        let completion = CompletionRequest::new(
            Purpose::Review,
            request.location.id.to_string(),
            prompts::review(),
            json!({
                "issue": request.issue,
                "original_code": request.location.snippet,
                "fix": {
                    "attempt_number": request.fix.attempt_number,
                    "domain": request.fix.domain,
                    "fixed_code": request.fix.patch,
                    "explanation": request.fix.rationale,
                },
            }),
        );
        let reply = call_with_retry(&self.transport, "review", || {
            self.intelligence.complete(completion.clone())
        })
        .await?;
        parse_reply::<JudgeReply>(&reply)?.into_judgment()
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    /// No attempt yet.
    Drafting,
    /// `attempt` awaits a verdict.
    Pending { attempt: u32 },
    /// `attempt` was rejected; the next one carries `feedback`.
    Revising { attempt: u32, feedback: String },
    Approved { attempt: u32 },
    Abandoned {
        attempt: Option<u32>,
        reason: AbandonReason,
        feedback: Option<String>,
    },
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Approved { .. } | LoopState::Abandoned { .. })
    }

    /// Transition out of `Pending { attempt }` for a judgment.
    pub fn on_judgment(attempt: u32, judgment: &Judgment, max_attempts: u32) -> LoopState {
        match judgment.decision {
            Decision::Approved => LoopState::Approved { attempt },
            Decision::Revise if attempt < max_attempts => LoopState::Revising {
                attempt,
                feedback: judgment.feedback_or_default(),
            },
            Decision::Revise => LoopState::Abandoned {
                attempt: Some(attempt),
                reason: AbandonReason::RetryCeiling,
                feedback: Some(judgment.feedback_or_default()),
            },
            Decision::Abandoned => LoopState::Abandoned {
                attempt: Some(attempt),
                reason: AbandonReason::Judge,
                feedback: Some(judgment.feedback_or_default()),
            },
        }
    }

    /// State implied by a recorded verdict.
    pub fn after_verdict(verdict: &Verdict) -> LoopState {
        let attempt = verdict.attempt_number;
        match verdict.decision {
            Decision::Approved => LoopState::Approved { attempt },
            Decision::Revise => LoopState::Revising {
                attempt,
                feedback: verdict.feedback.clone().unwrap_or_default(),
            },
            Decision::Abandoned => LoopState::Abandoned {
                attempt: Some(attempt),
                reason: if verdict.forced {
                    AbandonReason::RetryCeiling
                } else {
                    AbandonReason::Judge
                },
                feedback: verdict.feedback.clone(),
            },
        }
    }

    /// Terminal outcome for the run state, if this state is terminal.
    pub fn outcome(&self) -> Option<LocationOutcome> {
        match self {
            LoopState::Approved { attempt } => Some(LocationOutcome::Approved {
                attempt_number: *attempt,
            }),
            LoopState::Abandoned {
                attempt,
                reason,
                feedback,
            } => Some(LocationOutcome::Abandoned {
                attempt_number: *attempt,
                reason: *reason,
                last_feedback: feedback.clone(),
            }),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LoopState::Drafting => "drafting",
            LoopState::Pending { .. } => "pending",
            LoopState::Revising { .. } => "revising",
            LoopState::Approved { .. } => "approved",
            LoopState::Abandoned { .. } => "abandoned",
        }
    }
}

/// Verdict recording `next` for `fix`.
fn verdict_for(fix: &FixAttempt, judgment: &Judgment, next: &LoopState) -> Verdict {
    let verdict = match next {
        LoopState::Approved { .. } => Verdict::approved(fix),
        LoopState::Revising { feedback, .. } => Verdict::revise(fix, feedback.clone()),
        LoopState::Abandoned {
            reason, feedback, ..
        } => {
            let v = Verdict::abandoned(fix, feedback.clone().unwrap_or_default());
            if *reason == AbandonReason::RetryCeiling {
                v.forced()
            } else {
                v
            }
        }
        LoopState::Drafting | LoopState::Pending { .. } => {
            Verdict::revise(fix, judgment.feedback_or_default())
        }
    };
    verdict.with_criteria(judgment.criteria_checked.iter().cloned())
}

// ---------------------------------------------------------------------------
// Review stage
// ---------------------------------------------------------------------------

/// `Review` stage: judge the focused location's current attempt.
pub struct ReviewStage {
    judge: Arc<dyn Judge>,
}

impl ReviewStage {
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self { judge }
    }
}

#[async_trait]
impl Stage for ReviewStage {
    fn kind(&self) -> StageKind {
        StageKind::Review
    }

    async fn run(&self, view: &RunStateView) -> StageResult {
        let Some(track) = view.focus() else {
            return StageResult::Fail("review stage needs a focused location".to_string());
        };
        let Some(fix) = track.current().filter(|_| track.awaiting_verdict()) else {
            return StageResult::Skip("no attempt awaiting a verdict".to_string());
        };

        let request = ReviewRequest {
            issue: track.issue.clone(),
            location: track.location.clone(),
            fix: fix.clone(),
        };

        match self.judge.judge(&request).await {
            Ok(judgment) => {
                let next =
                    LoopState::on_judgment(fix.attempt_number, &judgment, view.config().max_attempts);
                StageResult::Continue(RunStateDelta {
                    verdicts: vec![verdict_for(fix, &judgment, &next)],
                    ..Default::default()
                })
            }
            Err(e) => StageResult::Fail(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Drives one location from `Drafting` to a terminal state.
pub struct ReviewLoop {
    fix: Arc<dyn Stage>,
    review: Arc<dyn Stage>,
}

impl ReviewLoop {
    pub fn new(fix: Arc<dyn Stage>, review: Arc<dyn Stage>) -> Self {
        Self { fix, review }
    }

    /// Run the loop for `view`'s focused location, sending every transition
    /// through `emit`. Returns the last state reached; a non-terminal state
    /// means the run was cancelled or the receiver went away.
    pub async fn drive<E, Fut>(&self, mut view: RunStateView, emit: E, cancelled: impl Fn() -> bool) -> LoopState
    where
        E: Fn(RunStateDelta) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let Some(location_id) = view.focus().map(|t| t.location.id.clone()) else {
            return LoopState::Drafting;
        };
        let mut state = LoopState::Drafting;

        while !state.is_terminal() {
            if cancelled() {
                debug!(location_id = %location_id, state = state.label(), "review loop interrupted");
                return state;
            }

            let (mut delta, next) = match &state {
                LoopState::Drafting | LoopState::Revising { .. } => {
                    match self.fix.run(&view).await {
                        StageResult::Continue(delta) => {
                            let attempt = delta
                                .fix_attempts
                                .first()
                                .map(|f| f.attempt_number)
                                .unwrap_or(0);
                            (delta, LoopState::Pending { attempt })
                        }
                        StageResult::Fail(reason) | StageResult::Skip(reason) => {
                            self.failure(&view, &location_id, &reason)
                        }
                    }
                }
                LoopState::Pending { attempt } => match self.review.run(&view).await {
                    StageResult::Continue(delta) => match delta.verdicts.first() {
                        Some(verdict) => {
                            obs::emit_verdict_recorded(&location_id, *attempt, verdict.decision, verdict.forced);
                            let next = LoopState::after_verdict(verdict);
                            (delta, next)
                        }
                        None => self.failure(&view, &location_id, "review produced no verdict"),
                    },
                    StageResult::Fail(reason) | StageResult::Skip(reason) => {
                        self.review_failure(&view, &location_id, &reason)
                    }
                },
                LoopState::Approved { .. } | LoopState::Abandoned { .. } => break,
            };

            if let Some(outcome) = next.outcome() {
                delta.outcomes.push((location_id.clone(), outcome));
            }
            view.absorb(&delta);
            if !emit(delta).await {
                warn!(location_id = %location_id, "orchestrator stopped listening");
                return next;
            }
            state = next;
        }

        info!(location_id = %location_id, state = state.label(), "review loop finished");
        state
    }

    /// Handler failure before a new attempt exists.
    fn failure(
        &self,
        view: &RunStateView,
        location_id: &crate::domain::LocationId,
        reason: &str,
    ) -> (RunStateDelta, LoopState) {
        let track = view.focus();
        let last_attempt = track.and_then(|t| t.current()).map(|f| f.attempt_number);
        let attempt_number = track.map(|t| t.next_attempt_number()).unwrap_or(1);
        let last_feedback = track.and_then(|t| t.last_feedback()).map(str::to_string);

        obs::emit_handler_failure(location_id, attempt_number, reason);
        let mut delta = RunStateDelta::new();
        delta.warnings.push(RunWarning::HandlerFailure {
            location_id: location_id.clone(),
            attempt_number,
            error: reason.to_string(),
        });
        let next = LoopState::Abandoned {
            attempt: last_attempt,
            reason: AbandonReason::HandlerError,
            feedback: last_feedback,
        };
        (delta, next)
    }

    /// Judge failure: the pending attempt still gets exactly one verdict.
    fn review_failure(
        &self,
        view: &RunStateView,
        location_id: &crate::domain::LocationId,
        reason: &str,
    ) -> (RunStateDelta, LoopState) {
        let Some(fix) = view.focus().and_then(|t| t.current()) else {
            return self.failure(view, location_id, reason);
        };
        let feedback = format!("review failed: {reason}");

        obs::emit_handler_failure(location_id, fix.attempt_number, reason);
        let mut delta = RunStateDelta::new();
        delta.verdicts.push(Verdict::abandoned(fix, feedback.clone()));
        delta.warnings.push(RunWarning::HandlerFailure {
            location_id: location_id.clone(),
            attempt_number: fix.attempt_number,
            error: reason.to_string(),
        });
        let next = LoopState::Abandoned {
            attempt: Some(fix.attempt_number),
            reason: AbandonReason::HandlerError,
            feedback: Some(feedback),
        };
        (delta, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_is_terminal() {
        let next = LoopState::on_judgment(1, &Judgment::approved(), 3);
        assert_eq!(next, LoopState::Approved { attempt: 1 });
        assert!(next.is_terminal());
    }

    #[test]
    fn revise_below_ceiling_revises() {
        let next = LoopState::on_judgment(2, &Judgment::revise("contrast still 3:1"), 3);
        assert_eq!(
            next,
            LoopState::Revising {
                attempt: 2,
                feedback: "contrast still 3:1".into()
            }
        );
    }

    #[test]
    fn revise_at_ceiling_is_forced_abandon() {
        let next = LoopState::on_judgment(3, &Judgment::revise("still wrong"), 3);
        assert_eq!(
            next,
            LoopState::Abandoned {
                attempt: Some(3),
                reason: AbandonReason::RetryCeiling,
                feedback: Some("still wrong".into())
            }
        );
    }

    #[test]
    fn ceiling_of_one_never_revises() {
        let next = LoopState::on_judgment(1, &Judgment::revise("meh"), 1);
        assert!(matches!(next, LoopState::Abandoned { reason: AbandonReason::RetryCeiling, .. }));
    }

    #[test]
    fn revise_without_feedback_gets_default_text() {
        let judgment = Judgment {
            feedback: Some("  ".into()),
            ..Judgment::revise("")
        };
        match LoopState::on_judgment(1, &judgment, 3) {
            LoopState::Revising { feedback, .. } => assert_eq!(feedback, DEFAULT_REVISE_FEEDBACK),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn forced_verdict_maps_back_to_ceiling() {
        let fix = FixAttempt::new(
            crate::domain::LocationId("loc-1".into()),
            3,
            crate::domain::FixDomain::Css,
            "p",
            "r",
        );
        let judgment = Judgment::revise("no");
        let next = LoopState::on_judgment(3, &judgment, 3);
        let verdict = verdict_for(&fix, &judgment, &next);
        assert!(verdict.forced);
        assert_eq!(verdict.decision, Decision::Abandoned);
        assert_eq!(LoopState::after_verdict(&verdict), next);
    }

    #[test]
    fn critic_form_reply_maps_to_revise_with_points() {
        let reply: JudgeReply = serde_json::from_value(json!({
            "approved": false,
            "rating": 4,
            "weaknesses": ["alt text repeats filename"],
            "suggestions": ["describe the image"]
        }))
        .unwrap();
        let judgment = reply.into_judgment().unwrap();
        assert_eq!(judgment.decision, Decision::Revise);
        assert_eq!(
            judgment.feedback.as_deref(),
            Some("alt text repeats filename; describe the image")
        );
        assert_eq!(judgment.rating, Some(4));
    }

    #[test]
    fn reply_without_decision_is_an_error() {
        let reply: JudgeReply = serde_json::from_value(json!({"feedback": "hm"})).unwrap();
        assert!(reply.into_judgment().is_err());
    }
}
