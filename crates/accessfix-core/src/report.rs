//! Terminal run report.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::domain::{
    FixAttempt, FixDomain, IssueCategory, IssueId, LineRange, LocationId, Severity, Verdict,
};
use crate::publish::PublishResult;
use crate::run_state::{AbandonReason, LocationOutcome, RunState, RunStateDelta, RunStatus, RunWarning};
use crate::stage::{RunStateView, Stage, StageKind, StageResult};
use crate::vcs::PullRequestRef;

/// Issue totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCounts {
    pub total: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

/// Final state of one location as reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportOutcome {
    Approved {
        attempt_number: u32,
    },
    Abandoned {
        attempt_number: Option<u32>,
        reason: AbandonReason,
        last_feedback: Option<String>,
    },
    /// The run stopped before this location settled.
    Interrupted,
}

impl From<&LocationOutcome> for ReportOutcome {
    fn from(outcome: &LocationOutcome) -> Self {
        match outcome {
            LocationOutcome::Approved { attempt_number } => ReportOutcome::Approved {
                attempt_number: *attempt_number,
            },
            LocationOutcome::Abandoned {
                attempt_number,
                reason,
                last_feedback,
            } => ReportOutcome::Abandoned {
                attempt_number: *attempt_number,
                reason: *reason,
                last_feedback: last_feedback.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationReport {
    pub location_id: LocationId,
    pub issue_id: IssueId,
    pub file_path: String,
    pub line_range: LineRange,
    pub severity: Severity,
    pub category: IssueCategory,
    pub criterion: String,
    pub description: String,
    pub domain: Option<FixDomain>,
    #[serde(flatten)]
    pub outcome: ReportOutcome,
    pub attempts: Vec<FixAttempt>,
    pub verdicts: Vec<Verdict>,
}

impl LocationReport {
    pub fn is_approved(&self) -> bool {
        matches!(self.outcome, ReportOutcome::Approved { .. })
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.outcome, ReportOutcome::Abandoned { .. })
    }
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub repo: String,
    pub status: RunStatus,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub issues: IssueCounts,
    /// Issues kept in the run but excluded by the severity filter.
    pub skipped_by_filter: Vec<IssueId>,
    pub locations: Vec<LocationReport>,
    /// Admitted issues that never got a location.
    pub unlocated: Vec<IssueId>,
    pub warnings: Vec<RunWarning>,
    pub publish: Option<PublishResult>,
}

impl Report {
    pub fn from_state(state: &RunState, config: &RunConfig) -> Self {
        let mut issues = IssueCounts::default();
        let mut skipped_by_filter = Vec::new();
        let mut unlocated = Vec::new();

        for issue in state.issues() {
            issues.total += 1;
            *issues.by_severity.entry(issue.severity.to_string()).or_default() += 1;
            *issues.by_category.entry(issue.category.to_string()).or_default() += 1;

            if !config.admits(issue.severity) {
                skipped_by_filter.push(issue.id.clone());
            } else if state.location_for_issue(&issue.id).is_none() {
                unlocated.push(issue.id.clone());
            }
        }

        let locations = state
            .locations()
            .filter_map(|location| {
                let issue = state.issue(&location.issue_id)?;
                let outcome = state
                    .outcome(&location.id)
                    .map(ReportOutcome::from)
                    .unwrap_or(ReportOutcome::Interrupted);
                Some(LocationReport {
                    location_id: location.id.clone(),
                    issue_id: issue.id.clone(),
                    file_path: location.file_path.clone(),
                    line_range: location.line_range,
                    severity: issue.severity,
                    category: issue.category,
                    criterion: issue.criterion.clone(),
                    description: issue.description.clone(),
                    domain: state.domain_of(&location.id),
                    outcome,
                    attempts: state.attempts(&location.id).to_vec(),
                    verdicts: state.verdicts_for(&location.id).into_iter().cloned().collect(),
                })
            })
            .collect();

        Self {
            run_id: state.run_id().to_string(),
            repo: state.repo().to_string(),
            status: state.status(),
            cancelled: state.is_cancelled(),
            started_at: state.started_at(),
            finished_at: state.finished_at(),
            issues,
            skipped_by_filter,
            locations,
            unlocated,
            warnings: state.warnings().to_vec(),
            publish: state.publish_result().cloned(),
        }
    }

    pub fn approved_count(&self) -> usize {
        self.locations.iter().filter(|l| l.is_approved()).count()
    }

    pub fn abandoned_count(&self) -> usize {
        self.locations.iter().filter(|l| l.is_abandoned()).count()
    }

    pub fn location(&self, id: &LocationId) -> Option<&LocationReport> {
        self.locations.iter().find(|l| &l.location_id == id)
    }

    /// The opened pull request, when publication succeeded.
    pub fn pull_request(&self) -> Option<&PullRequestRef> {
        match &self.publish {
            Some(PublishResult::Published { pull_request, .. }) => Some(pull_request),
            _ => None,
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// `Report` stage: closes out locations that never settled.
///
/// Runs last. Every delegated location without an outcome gets an
/// `Interrupted` warning so the state itself records the gap.
pub struct ReportStage;

#[async_trait]
impl Stage for ReportStage {
    fn kind(&self) -> StageKind {
        StageKind::Report
    }

    async fn run(&self, view: &RunStateView) -> StageResult {
        let state = view.state();
        let delta = state
            .locations()
            .filter(|l| state.domain_of(&l.id).is_some() && state.outcome(&l.id).is_none())
            .fold(RunStateDelta::new(), |delta, l| {
                delta.with_warning(RunWarning::Interrupted {
                    location_id: l.id.clone(),
                })
            });
        if delta.is_empty() {
            StageResult::Skip("every location settled".to_string())
        } else {
            StageResult::Continue(delta)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::{Issue, Location};
    use crate::vcs::WorkingCopy;

    fn seeded() -> (RunState, Location, Location) {
        let mut state = RunState::new("run-1", "acme/site");
        let a = Issue::new("a.html", Some(1), IssueCategory::Aria, Severity::Critical, "4.1.2", "unnamed button");
        let b = Issue::new("b.css", Some(2), IssueCategory::Contrast, Severity::Medium, "1.4.3", "low contrast");
        let c = Issue::new("c.js", Some(3), IssueCategory::KeyboardAccess, Severity::Low, "2.1.1", "no key handler");
        let d = Issue::new("d.html", Some(4), IssueCategory::Structural, Severity::High, "1.3.1", "skipped heading");
        let la = Location::new(a.id.clone(), "a.html", LineRange::single(1), "<button>", "");
        let lb = Location::new(b.id.clone(), "b.css", LineRange::single(2), ".x{}", "");
        let fix = FixAttempt::new(la.id.clone(), 1, FixDomain::Html, "<button aria-label=\"Go\">", "name");
        state
            .apply(RunStateDelta {
                issues: vec![a, b, c, d],
                locations: vec![la.clone(), lb.clone()],
                assignments: vec![(la.id.clone(), FixDomain::Html), (lb.id.clone(), FixDomain::Css)],
                verdicts: vec![Verdict::approved(&fix)],
                fix_attempts: vec![fix],
                outcomes: vec![(la.id.clone(), LocationOutcome::Approved { attempt_number: 1 })],
                ..Default::default()
            })
            .unwrap();
        (state, la, lb)
    }

    #[test]
    fn counts_and_outcomes() {
        let config = RunConfig {
            severity_filter: [Severity::Critical, Severity::Medium, Severity::High].into_iter().collect(),
            ..RunConfig::default()
        };
        let (state, la, lb) = seeded();
        let report = Report::from_state(&state, &config);

        assert_eq!(report.issues.total, 4);
        assert_eq!(report.issues.by_severity["critical"], 1);
        assert_eq!(report.issues.by_category["contrast"], 1);
        assert_eq!(report.skipped_by_filter.len(), 1);
        assert_eq!(report.unlocated.len(), 1);
        assert_eq!(report.approved_count(), 1);
        assert_eq!(report.location(&la.id).unwrap().attempts.len(), 1);
        assert_eq!(report.location(&lb.id).unwrap().outcome, ReportOutcome::Interrupted);
        assert!(report.pull_request().is_none());
    }

    #[test]
    fn report_serializes_outcome_inline() {
        let config = RunConfig::default();
        let (state, la, _) = seeded();
        let report = Report::from_state(&state, &config);
        let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
        let first = &json["locations"][0];
        assert_eq!(first["location_id"], la.id.as_str());
        assert_eq!(first["outcome"], "approved");
        assert_eq!(json["status"], "running");
    }

    #[tokio::test]
    async fn report_stage_flags_unsettled_locations() {
        let config = RunConfig::default();
        let (state, _, lb) = seeded();
        let view = RunStateView::snapshot(&state, Arc::new(WorkingCopy::default()), Arc::new(config));
        match ReportStage.run(&view).await {
            StageResult::Continue(delta) => {
                assert_eq!(delta.warnings, vec![RunWarning::Interrupted { location_id: lb.id }]);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
