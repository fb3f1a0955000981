//! Retried stages must not duplicate anything in the run state.

mod support;

use std::sync::Arc;

use accessfix_core::fakes::ScriptedIntelligence;
use accessfix_core::stage::{AnalyzeStage, LocateStage};
use accessfix_core::{
    IntelligenceError, Purpose, RunState, RunStateView, RunWarning, Stage, StageResult, WorkingCopy,
};

use support::*;

fn site() -> Arc<WorkingCopy> {
    Arc::new(WorkingCopy::in_memory([
        ("index.html", PAGE),
        ("styles.css", STYLES),
        ("app.js", SCRIPT),
    ]))
}

async fn run_and_apply(stage: &dyn Stage, state: &mut RunState, source: &Arc<WorkingCopy>) -> usize {
    let view = RunStateView::snapshot(state, Arc::clone(source), Arc::new(fast_config()));
    match stage.run(&view).await {
        StageResult::Continue(delta) => state.apply(delta).unwrap().total(),
        other => panic!("unexpected stage result {other:?}"),
    }
}

#[tokio::test]
async fn test_reanalysis_yields_identical_issue_ids() {
    let intel = Arc::new(scripted(|_, _| approve(), None));
    let source = site();
    let mut state = RunState::new("run-retry", "acme/site");
    let analyze = AnalyzeStage::new(intel.clone());

    let first = run_and_apply(&analyze, &mut state, &source).await;
    let ids: Vec<_> = state.issues().iter().map(|i| i.id.clone()).collect();
    let second = run_and_apply(&analyze, &mut state, &source).await;

    assert_eq!(first, 3);
    assert_eq!(second, 0);
    assert_eq!(state.issues().iter().map(|i| i.id.clone()).collect::<Vec<_>>(), ids);
}

#[tokio::test]
async fn test_relocation_skips_already_located_issues() {
    let intel = Arc::new(scripted(|_, _| approve(), None));
    let source = site();
    let mut state = RunState::new("run-retry", "acme/site");

    run_and_apply(&AnalyzeStage::new(intel.clone()), &mut state, &source).await;
    let locate = LocateStage::new(intel.clone());
    run_and_apply(&locate, &mut state, &source).await;
    let calls = intel.calls_for(Purpose::Locate);
    run_and_apply(&locate, &mut state, &source).await;

    assert_eq!(state.locations().count(), 3);
    assert_eq!(intel.calls_for(Purpose::Locate), calls);
}

#[tokio::test]
async fn test_one_unanalyzable_file_is_a_warning() {
    let intel = Arc::new(ScriptedIntelligence::new(|req| {
        if req.subject == "styles.css" {
            Err(IntelligenceError::Rejected("file too large".into()))
        } else {
            Ok(analyze_reply(&req.subject))
        }
    }));
    let source = site();
    let mut state = RunState::new("run-retry", "acme/site");

    run_and_apply(&AnalyzeStage::new(intel), &mut state, &source).await;

    assert_eq!(state.issues().len(), 2);
    assert!(state
        .warnings()
        .iter()
        .any(|w| matches!(w, RunWarning::AnalysisFailed { file_path, .. } if file_path == "styles.css")));
}

#[tokio::test(start_paused = true)]
async fn test_transient_analyze_failure_is_retried() {
    let intel = Arc::new(ScriptedIntelligence::new({
        let seen = std::sync::atomic::AtomicUsize::new(0);
        move |req| {
            if req.subject == "index.html" && seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(IntelligenceError::Unavailable("503".into()))
            } else {
                Ok(analyze_reply(&req.subject))
            }
        }
    }));
    let source = Arc::new(WorkingCopy::in_memory([("index.html", PAGE)]));
    let mut state = RunState::new("run-retry", "acme/site");

    run_and_apply(&AnalyzeStage::new(intel.clone()), &mut state, &source).await;

    assert_eq!(state.issues().len(), 1);
    assert_eq!(intel.calls_for(Purpose::Analyze), 2);
    assert!(state.warnings().is_empty());
}
