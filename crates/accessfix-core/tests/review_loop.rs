//! Review-loop bounds driven through the public stage API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use accessfix_core::stage::LocationTrack;
use accessfix_core::{
    AbandonReason, Decision, DomainHandler, FixDomain, FixProposal, FixRequest, FixStage,
    HandlerError, Issue, IssueCategory, Judge, Judgment, LineRange, Location, LocationOutcome,
    LoopState, ReviewLoop, ReviewRequest, ReviewStage, RunConfig, RunState, RunStateDelta,
    RunStateView, Severity, WorkingCopy,
};
use async_trait::async_trait;

struct CountingHandler {
    calls: AtomicU32,
    fail_on: Option<u32>,
}

#[async_trait]
impl DomainHandler for CountingHandler {
    fn domain(&self) -> FixDomain {
        FixDomain::Css
    }

    async fn propose(&self, request: &FixRequest) -> Result<FixProposal, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on == Some(request.attempt_number) {
            return Err(HandlerError::InvalidFix("empty fixed_code".into()));
        }
        if request.attempt_number > 1 {
            assert!(request.feedback.is_some(), "revisions carry feedback");
            assert!(request.previous.is_some(), "revisions see the previous attempt");
        }
        Ok(FixProposal {
            patch: format!("color: #4{}4{}4{};", request.attempt_number, request.attempt_number, request.attempt_number),
            rationale: "darker grey".into(),
            notes: None,
        })
    }
}

/// Revises until `approve_at`, if ever.
struct ScriptedJudge {
    approve_at: Option<u32>,
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn judge(&self, request: &ReviewRequest) -> Result<Judgment, HandlerError> {
        match self.approve_at {
            Some(n) if request.fix.attempt_number >= n => Ok(Judgment::approved()),
            _ => Ok(Judgment::revise(format!("attempt {} still below 4.5:1", request.fix.attempt_number))),
        }
    }
}

fn seeded() -> (RunState, Issue, Location) {
    let issue = Issue::new("styles.css", Some(2), IssueCategory::Contrast, Severity::Medium, "1.4.3", "low contrast");
    let location = Location::new(issue.id.clone(), "styles.css", LineRange::single(2), "color: #aaa;", "");
    let mut state = RunState::new("run-loop", "acme/site");
    state
        .apply(RunStateDelta {
            issues: vec![issue.clone()],
            locations: vec![location.clone()],
            assignments: vec![(location.id.clone(), FixDomain::Css)],
            ..Default::default()
        })
        .unwrap();
    (state, issue, location)
}

async fn drive(
    max_attempts: u32,
    handler: Arc<CountingHandler>,
    judge: ScriptedJudge,
) -> (RunState, Location, LoopState) {
    let (mut state, issue, location) = seeded();
    let config = RunConfig {
        max_attempts,
        ..RunConfig::default()
    };
    let view = RunStateView::snapshot(&state, Arc::new(WorkingCopy::default()), Arc::new(config))
        .focused(LocationTrack::new(issue, location.clone(), FixDomain::Css));

    let review_loop = ReviewLoop::new(
        Arc::new(FixStage::new(handler)),
        Arc::new(ReviewStage::new(Arc::new(judge))),
    );
    let emitted: Arc<Mutex<Vec<RunStateDelta>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&emitted);
    let last = review_loop
        .drive(
            view,
            move |delta| {
                sink.lock().unwrap().push(delta);
                async { true }
            },
            || false,
        )
        .await;

    for delta in emitted.lock().unwrap().drain(..) {
        state.apply(delta).unwrap();
    }
    (state, location, last)
}

#[tokio::test]
async fn test_attempts_never_exceed_ceiling() {
    for max_attempts in 1..=4 {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_on: None,
        });
        let (state, location, last) =
            drive(max_attempts, Arc::clone(&handler), ScriptedJudge { approve_at: None }).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), max_attempts);
        let numbers: Vec<u32> = state.attempts(&location.id).iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, (1..=max_attempts).collect::<Vec<_>>());
        assert_eq!(state.verdicts_for(&location.id).len(), max_attempts as usize);
        assert!(matches!(
            last,
            LoopState::Abandoned { reason: AbandonReason::RetryCeiling, .. }
        ));
        assert!(matches!(
            state.outcome(&location.id),
            Some(LocationOutcome::Abandoned { reason: AbandonReason::RetryCeiling, .. })
        ));
    }
}

#[tokio::test]
async fn test_exactly_one_verdict_per_attempt() {
    let handler = Arc::new(CountingHandler {
        calls: AtomicU32::new(0),
        fail_on: None,
    });
    let (state, location, _) = drive(5, handler, ScriptedJudge { approve_at: Some(4) }).await;

    let attempts = state.attempts(&location.id);
    assert_eq!(attempts.len(), 4);
    for attempt in attempts {
        let verdict = state.verdict_for(&attempt.id).unwrap();
        assert_eq!(verdict.attempt_number, attempt.attempt_number);
    }
    assert_eq!(state.current_fix(&location.id).unwrap().patch, "color: #444444;");
    let decisions: Vec<Decision> = state.verdicts_for(&location.id).iter().map(|v| v.decision).collect();
    assert_eq!(decisions.last(), Some(&Decision::Approved));
}

#[tokio::test]
async fn test_handler_failure_on_revision_keeps_earlier_history() {
    let handler = Arc::new(CountingHandler {
        calls: AtomicU32::new(0),
        fail_on: Some(2),
    });
    let (state, location, last) = drive(3, handler, ScriptedJudge { approve_at: None }).await;

    assert_eq!(state.attempts(&location.id).len(), 1);
    assert_eq!(state.verdicts_for(&location.id).len(), 1);
    match last {
        LoopState::Abandoned { attempt, reason, feedback } => {
            assert_eq!(attempt, Some(1));
            assert_eq!(reason, AbandonReason::HandlerError);
            assert_eq!(feedback.as_deref(), Some("attempt 1 still below 4.5:1"));
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn test_cancelled_loop_stops_before_first_attempt() {
    let (state, issue, location) = seeded();
    let view = RunStateView::snapshot(&state, Arc::new(WorkingCopy::default()), Arc::new(RunConfig::default()))
        .focused(LocationTrack::new(issue, location, FixDomain::Css));
    let handler = Arc::new(CountingHandler {
        calls: AtomicU32::new(0),
        fail_on: None,
    });
    let review_loop = ReviewLoop::new(
        Arc::new(FixStage::new(Arc::clone(&handler) as Arc<dyn DomainHandler>)),
        Arc::new(ReviewStage::new(Arc::new(ScriptedJudge { approve_at: Some(1) }))),
    );

    let last = review_loop.drive(view, |_| async { true }, || true).await;

    assert_eq!(last, LoopState::Drafting);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
}
