//! Structured observability hooks for run lifecycle events.
//!
//! This module provides:
//! - a run-scoped tracing span via the `RunSpan` guard
//! - emission functions for stage results, merged deltas, verdicts, handler
//!   failures and publication
//!
//! Every event carries an `event = "..."` field so JSON logs can be filtered
//! without parsing messages.

use tracing::{info, warn, Instrument};

use crate::domain::{Decision, LocationId};
use crate::run_state::ApplySummary;

/// Span tagged with run id and repository; instrument the run future with it.
///
/// # Example
///
/// ```ignore
/// let span = RunSpan::new("run-123", "acme/site");
/// async { /* ... */ }.instrument(span.span()).await;
/// ```
pub struct RunSpan {
    span: tracing::Span,
}

impl RunSpan {
    pub fn new(run_id: &str, repo: &str) -> Self {
        Self {
            span: tracing::info_span!("accessfix_run", run_id = %run_id, repo = %repo),
        }
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }

    /// Run `fut` inside the span.
    pub async fn scope<F: std::future::Future>(&self, fut: F) -> F::Output {
        fut.instrument(self.span.clone()).await
    }
}

/// Emit event: run started.
pub fn emit_run_started(run_id: &str, repo: &str) {
    info!(event = "run.started", run_id = %run_id, repo = %repo);
}

/// Emit event: a run-scoped stage returned.
pub fn emit_stage_finished(stage: &str, result: &str, detail: Option<&str>) {
    match detail {
        Some(detail) => info!(event = "stage.finished", stage = %stage, result = %result, detail = %detail),
        None => info!(event = "stage.finished", stage = %stage, result = %result),
    }
}

/// Emit event: a delta was merged into the run state.
pub fn emit_delta_applied(source: &str, summary: &ApplySummary) {
    info!(
        event = "state.delta_applied",
        source = %source,
        issues = summary.issues,
        locations = summary.locations,
        fix_attempts = summary.fix_attempts,
        verdicts = summary.verdicts,
        outcomes = summary.outcomes,
        warnings = summary.warnings,
    );
}

/// Emit event: a verdict was recorded for an attempt.
pub fn emit_verdict_recorded(location_id: &LocationId, attempt: u32, decision: Decision, forced: bool) {
    info!(
        event = "review.verdict",
        location_id = %location_id,
        attempt = attempt,
        decision = ?decision,
        forced = forced,
    );
}

/// Emit event: a domain handler or the judge failed for one location.
pub fn emit_handler_failure(location_id: &LocationId, attempt: u32, error: &str) {
    warn!(
        event = "delegation.handler_failure",
        location_id = %location_id,
        attempt = attempt,
        error = %error,
    );
}

/// Emit event: publication finished.
pub fn emit_publish_finished(outcome: &str, files: usize, detail: Option<&str>) {
    info!(
        event = "publish.finished",
        outcome = %outcome,
        files = files,
        detail = detail.unwrap_or(""),
    );
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, status: &str, approved: usize, abandoned: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        status = %status,
        approved = approved,
        abandoned = abandoned,
    );
}

/// Emit event: run cancelled by the caller (warning level).
pub fn emit_run_cancelled(run_id: &str, pending_locations: usize) {
    warn!(event = "run.cancelled", run_id = %run_id, pending_locations = pending_locations);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_span_scopes_a_future() {
        let span = RunSpan::new("run-1", "acme/site");
        let value = span.scope(async { 7 }).await;
        assert_eq!(value, 7);
    }
}
