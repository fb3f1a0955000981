//! Run orchestration.
//!
//! The orchestrator owns the only [`RunState`] of a run and is its single
//! writer. Analyze and Locate run once, in order; each located issue then
//! gets its own review-loop task. Those tasks never touch the state: their
//! deltas arrive over a channel and are merged one at a time. Publish and
//! Report run once every loop has settled.
//!
//! ```text
//! clone ─▶ Analyze ─▶ Locate ─▶ fan-out ──▶ [Fix ⇄ Review] × N ──▶ fan-in ─▶ Publish ─▶ Report
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::delegation::{
    handler_failure_delta, DelegationRouter, DomainHandler, FanOut, FixStage, HandlerRegistry,
    LocationDelta,
};
use crate::domain::{LocationId, OrchestratorError, Result};
use crate::intelligence::Intelligence;
use crate::obs::{self, RunSpan};
use crate::publish::{PublishGateway, PublishResult, PublishStage};
use crate::report::{Report, ReportStage};
use crate::review::{IntelligenceJudge, Judge, ReviewLoop, ReviewStage};
use crate::run_state::{RunState, RunStateDelta, RunStatus};
use crate::stage::{AnalyzeStage, LocateStage, LocationTrack, RunStateView, Stage, StageResult};
use crate::transport::call_with_retry;
use crate::vcs::{RepoRef, VersionControlClient, WorkingCopy};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Caller side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Run side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn receiver(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    intelligence: Arc<dyn Intelligence>,
    vcs: Arc<dyn VersionControlClient>,
    config: Arc<RunConfig>,
    registry: HandlerRegistry,
    judge: Arc<dyn Judge>,
}

impl Orchestrator {
    /// Model-backed handlers for every domain and a model-backed judge.
    pub fn new(
        intelligence: Arc<dyn Intelligence>,
        vcs: Arc<dyn VersionControlClient>,
        config: RunConfig,
    ) -> Self {
        let registry = HandlerRegistry::with_intelligence(Arc::clone(&intelligence), &config.transport);
        let judge = Arc::new(IntelligenceJudge::new(
            Arc::clone(&intelligence),
            config.transport.clone(),
        ));
        Self {
            intelligence,
            vcs,
            config: Arc::new(config),
            registry,
            judge,
        }
    }

    /// Replace the handler for `handler.domain()`.
    pub fn with_handler(mut self, handler: Arc<dyn DomainHandler>) -> Self {
        self.registry.register(handler);
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = judge;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run to completion.
    pub async fn execute(&self, repo: &RepoRef) -> Result<Report> {
        let (_handle, signal) = cancel_pair();
        self.execute_with_cancel(repo, signal).await
    }

    /// Run until done or until `cancel` fires. A cancelled run still returns
    /// a report, with `cancelled` set and status `failed`.
    #[instrument(skip_all, fields(repo = %repo))]
    pub async fn execute_with_cancel(&self, repo: &RepoRef, cancel: CancelSignal) -> Result<Report> {
        self.config.validate()?;
        let run_id = format!("run-{}", Uuid::new_v4());
        let span = RunSpan::new(&run_id, &repo.name);
        span.scope(self.run(run_id.clone(), repo, cancel)).await
    }

    async fn run(&self, run_id: String, repo: &RepoRef, mut cancel: CancelSignal) -> Result<Report> {
        let started = Instant::now();
        obs::emit_run_started(&run_id, &repo.name);

        let copy = call_with_retry(&self.config.transport, "clone_repository", || {
            self.vcs.clone_repository(repo)
        })
        .await
        .map_err(|source| {
            error!(error = %source, "repository unavailable");
            OrchestratorError::RepoUnavailable {
                repo: repo.name.clone(),
                source,
            }
        })?;
        info!(files = copy.files.len(), "repository cloned");
        let source = Arc::new(copy);
        let mut state = RunState::new(run_id.clone(), repo.name.clone());

        let analyze = AnalyzeStage::new(Arc::clone(&self.intelligence));
        if let StageResult::Fail(reason) = self.run_stage(&analyze, &mut state, &source).await? {
            state.transition(RunStatus::Failed)?;
            return Err(OrchestratorError::AnalysisFailed(reason));
        }

        if !cancel.is_cancelled() {
            let locate = LocateStage::new(Arc::clone(&self.intelligence));
            if let StageResult::Fail(reason) = self.run_stage(&locate, &mut state, &source).await? {
                state.transition(RunStatus::Failed)?;
                return Err(OrchestratorError::StageFailed {
                    stage: locate.kind().to_string(),
                    reason,
                });
            }
        }

        let cancelled = cancel.is_cancelled()
            || self.delegate(&mut state, &source, &mut cancel).await?;

        let status = if cancelled {
            state.mark_cancelled();
            let pending = state
                .locations()
                .filter(|l| state.outcome(&l.id).is_none())
                .count();
            obs::emit_run_cancelled(&run_id, pending);
            let skipped = RunStateDelta {
                publish_result: Some(PublishResult::Skipped {
                    reason: "run cancelled".to_string(),
                }),
                ..Default::default()
            };
            state.apply(skipped)?;
            RunStatus::Failed
        } else {
            let publish = PublishStage::new(PublishGateway::new(Arc::clone(&self.vcs)), repo.clone());
            self.run_stage(&publish, &mut state, &source).await?;
            RunStatus::Completed
        };

        self.run_stage(&ReportStage, &mut state, &source).await?;
        state.transition(status)?;

        let report = Report::from_state(&state, &self.config);
        obs::emit_run_finished(
            &run_id,
            started.elapsed().as_millis() as u64,
            &status.to_string(),
            report.approved_count(),
            report.abandoned_count(),
        );
        Ok(report)
    }

    /// Run one run-scoped stage against a fresh snapshot and merge its delta.
    async fn run_stage(
        &self,
        stage: &dyn Stage,
        state: &mut RunState,
        source: &Arc<WorkingCopy>,
    ) -> Result<StageResult> {
        let kind = stage.kind().to_string();
        let view = RunStateView::snapshot(state, Arc::clone(source), Arc::clone(&self.config));
        let result = stage.run(&view).await;

        match &result {
            StageResult::Continue(delta) => {
                obs::emit_stage_finished(&kind, result.label(), None);
                let summary = state.apply(delta.clone())?;
                obs::emit_delta_applied(&kind, &summary);
            }
            StageResult::Fail(reason) | StageResult::Skip(reason) => {
                obs::emit_stage_finished(&kind, result.label(), Some(reason));
            }
        }
        Ok(result)
    }

    /// Fan one review loop out per located issue and merge their deltas.
    /// Returns whether the run was cancelled while loops were in flight.
    async fn delegate(
        &self,
        state: &mut RunState,
        source: &Arc<WorkingCopy>,
        cancel: &mut CancelSignal,
    ) -> Result<bool> {
        let router = DelegationRouter::new(self.registry.clone(), self.config.max_parallel_handlers);
        let assignments = router.assign(state);
        if assignments.is_empty() {
            info!("no locations to delegate");
            return Ok(false);
        }

        for (domain, ids) in DelegationRouter::partition(&assignments) {
            info!(domain = %domain, locations = ids.len(), "locations delegated");
        }
        let summary = state.apply(DelegationRouter::assignment_delta(&assignments))?;
        obs::emit_delta_applied("delegation", &summary);

        let base = RunStateView::snapshot(state, Arc::clone(source), Arc::clone(&self.config));
        let judge = Arc::clone(&self.judge);
        let FanOut { mut events, tasks } =
            router.fan_out(assignments, cancel.receiver(), move |assignment, handler, sink| {
                let view = base.focused(LocationTrack::new(
                    assignment.issue,
                    assignment.location,
                    assignment.domain,
                ));
                let review_loop = ReviewLoop::new(
                    Arc::new(FixStage::new(handler)),
                    Arc::new(ReviewStage::new(Arc::clone(&judge))),
                );
                async move {
                    let emit_sink = sink.clone();
                    review_loop
                        .drive(
                            view,
                            move |delta| {
                                let sink = emit_sink.clone();
                                async move { sink.send(delta).await }
                            },
                            || sink.is_cancelled(),
                        )
                        .await;
                }
            });

        let mut queued: Vec<LocationId> = Vec::new();
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.merge(state, event, &mut queued),
                    None => break,
                },
            }
        }

        if cancelled {
            warn!(in_flight = tasks.len(), "cancellation requested; aborting review loops");
            for (_, task) in &tasks {
                task.abort();
            }
            return Ok(true);
        }

        let (ids, handles): (Vec<LocationId>, Vec<_>) = tasks.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;
        for (location_id, result) in ids.into_iter().zip(joined) {
            if let Err(e) = result {
                warn!(location_id = %location_id, error = %e, "review loop task failed");
            }
            if state.outcome(&location_id).is_none() {
                self.contain(state, &location_id, "review loop ended without an outcome");
            }
        }
        info!(queued = queued.len(), "publication queue closed");
        Ok(false)
    }

    /// Merge one location's delta. A rejected delta settles only that
    /// location.
    fn merge(&self, state: &mut RunState, event: LocationDelta, queued: &mut Vec<LocationId>) {
        let LocationDelta { location_id, delta } = event;
        let approved = delta
            .outcomes
            .iter()
            .any(|(id, outcome)| id == &location_id && outcome.is_approved());

        match state.apply(delta) {
            Ok(summary) => {
                obs::emit_delta_applied(location_id.as_str(), &summary);
                if approved {
                    info!(location_id = %location_id, "location approved; queued for publication");
                    queued.push(location_id);
                }
            }
            Err(e) => {
                warn!(location_id = %location_id, error = %e, "location delta rejected");
                if state.outcome(&location_id).is_none() {
                    self.contain(state, &location_id, &format!("rejected delta: {e}"));
                }
            }
        }
    }

    /// Settle a location as a handler failure.
    fn contain(&self, state: &mut RunState, location_id: &LocationId, reason: &str) {
        let attempts = state.attempts(location_id);
        let last_attempt = attempts.last().map(|f| f.attempt_number);
        let next_attempt = attempts.len() as u32 + 1;
        let last_feedback = state
            .verdicts_for(location_id)
            .last()
            .and_then(|v| v.feedback.clone());

        obs::emit_handler_failure(location_id, next_attempt, reason);
        let delta = handler_failure_delta(location_id, next_attempt, last_attempt, last_feedback, reason);
        if let Err(e) = state.apply(delta) {
            error!(location_id = %location_id, error = %e, "could not record handler failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_signal_resolves_after_cancel() {
        let (handle, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_never_cancels() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);
        let waited = tokio::time::timeout(std::time::Duration::from_secs(5), signal.cancelled()).await;
        assert!(waited.is_err());
        assert!(!signal.is_cancelled());
    }
}
