//! The aggregate threaded through one run.
//!
//! [`RunState`] is owned by the orchestrator. Stages never touch it directly:
//! they return a [`RunStateDelta`] which [`RunState::apply`] validates as a
//! whole and then commits, so a rejected delta leaves no partial writes.
//! Items are deduplicated by id, which makes re-applying the delta of a
//! retried stage a no-op.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    FixAttempt, FixDomain, FixId, Issue, IssueId, Location, LocationId, StateError, Verdict,
};
use crate::publish::PublishResult;

/// Run lifecycle. Only `Running -> Completed` and `Running -> Failed` exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Running, RunStatus::Completed) | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Why a location ended without an approved fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// The judge returned `abandoned`.
    Judge,
    /// `revise` at the last allowed attempt.
    RetryCeiling,
    /// The domain handler or the judge could not be reached.
    HandlerError,
}

/// Terminal state of one location's review loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LocationOutcome {
    Approved {
        attempt_number: u32,
    },
    Abandoned {
        /// Last attempt produced, if any.
        attempt_number: Option<u32>,
        reason: AbandonReason,
        last_feedback: Option<String>,
    },
}

impl LocationOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, LocationOutcome::Approved { .. })
    }
}

/// Non-fatal conditions recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    AnalysisFailed {
        file_path: String,
        error: String,
    },
    UnlocatedIssue {
        issue_id: IssueId,
        reason: String,
    },
    HandlerFailure {
        location_id: LocationId,
        attempt_number: u32,
        error: String,
    },
    PatchNotApplied {
        location_id: LocationId,
        file_path: String,
    },
    /// The run was cancelled before this location settled.
    Interrupted {
        location_id: LocationId,
    },
}

/// Value-type change set computed by a stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStateDelta {
    pub issues: Vec<Issue>,
    pub locations: Vec<Location>,
    /// Owning domain per location, fixed on first assignment.
    pub assignments: Vec<(LocationId, FixDomain)>,
    pub fix_attempts: Vec<FixAttempt>,
    pub verdicts: Vec<Verdict>,
    pub outcomes: Vec<(LocationId, LocationOutcome)>,
    pub warnings: Vec<RunWarning>,
    pub publish_result: Option<PublishResult>,
}

impl RunStateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warning(mut self, warning: RunWarning) -> Self {
        self.warnings.push(warning);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
            && self.locations.is_empty()
            && self.assignments.is_empty()
            && self.fix_attempts.is_empty()
            && self.verdicts.is_empty()
            && self.outcomes.is_empty()
            && self.warnings.is_empty()
            && self.publish_result.is_none()
    }

    /// Append another delta's contents.
    pub fn extend(&mut self, other: RunStateDelta) {
        self.issues.extend(other.issues);
        self.locations.extend(other.locations);
        self.assignments.extend(other.assignments);
        self.fix_attempts.extend(other.fix_attempts);
        self.verdicts.extend(other.verdicts);
        self.outcomes.extend(other.outcomes);
        self.warnings.extend(other.warnings);
        if other.publish_result.is_some() {
            self.publish_result = other.publish_result;
        }
    }
}

/// Counts of items a delta actually added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub issues: usize,
    pub locations: usize,
    pub fix_attempts: usize,
    pub verdicts: usize,
    pub outcomes: usize,
    pub warnings: usize,
}

impl ApplySummary {
    pub fn total(&self) -> usize {
        self.issues + self.locations + self.fix_attempts + self.verdicts + self.outcomes + self.warnings
    }
}

/// Full record of one run.
#[derive(Debug, Clone)]
pub struct RunState {
    run_id: String,
    repo: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: RunStatus,
    cancelled: bool,
    issues: Vec<Issue>,
    locations: BTreeMap<IssueId, Location>,
    location_index: BTreeMap<LocationId, IssueId>,
    assignments: BTreeMap<LocationId, FixDomain>,
    attempts: BTreeMap<LocationId, Vec<FixAttempt>>,
    verdicts: Vec<Verdict>,
    outcomes: BTreeMap<LocationId, LocationOutcome>,
    warnings: Vec<RunWarning>,
    publish_result: Option<PublishResult>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            repo: repo.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            cancelled: false,
            issues: Vec::new(),
            locations: BTreeMap::new(),
            location_index: BTreeMap::new(),
            assignments: BTreeMap::new(),
            attempts: BTreeMap::new(),
            verdicts: Vec::new(),
            outcomes: BTreeMap::new(),
            warnings: Vec::new(),
            publish_result: None,
        }
    }

    // ---------------------------------------------------------------------
    // Read access
    // ---------------------------------------------------------------------

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn issue(&self, id: &IssueId) -> Option<&Issue> {
        self.issues.iter().find(|i| &i.id == id)
    }

    pub fn location_for_issue(&self, id: &IssueId) -> Option<&Location> {
        self.locations.get(id)
    }

    pub fn location(&self, id: &LocationId) -> Option<&Location> {
        self.location_index
            .get(id)
            .and_then(|issue| self.locations.get(issue))
    }

    /// Locations in issue order.
    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.issues
            .iter()
            .filter_map(|issue| self.locations.get(&issue.id))
    }

    pub fn domain_of(&self, id: &LocationId) -> Option<FixDomain> {
        self.assignments.get(id).copied()
    }

    /// Every attempt for a location, oldest first.
    pub fn attempts(&self, id: &LocationId) -> &[FixAttempt] {
        self.attempts.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The highest-numbered attempt for a location.
    pub fn current_fix(&self, id: &LocationId) -> Option<&FixAttempt> {
        self.attempts.get(id).and_then(|a| a.last())
    }

    pub fn verdicts(&self) -> &[Verdict] {
        &self.verdicts
    }

    pub fn verdicts_for(&self, id: &LocationId) -> Vec<&Verdict> {
        self.verdicts
            .iter()
            .filter(|v| &v.location_id == id)
            .collect()
    }

    pub fn verdict_for(&self, fix: &FixId) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| &v.fix_id == fix)
    }

    pub fn outcome(&self, id: &LocationId) -> Option<&LocationOutcome> {
        self.outcomes.get(id)
    }

    /// Locations whose loop ended approved, in issue order.
    pub fn approved_locations(&self) -> Vec<&Location> {
        self.locations()
            .filter(|l| self.outcomes.get(&l.id).is_some_and(LocationOutcome::is_approved))
            .collect()
    }

    pub fn warnings(&self) -> &[RunWarning] {
        &self.warnings
    }

    pub fn publish_result(&self) -> Option<&PublishResult> {
        self.publish_result.as_ref()
    }

    // ---------------------------------------------------------------------
    // Writes (orchestrator only)
    // ---------------------------------------------------------------------

    /// Move the run forward. Backward or repeated transitions are rejected.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Validate `delta` against the current state and commit it atomically.
    pub fn apply(&mut self, delta: RunStateDelta) -> Result<ApplySummary, StateError> {
        if self.status.is_terminal() {
            return Err(StateError::Closed(self.status.to_string()));
        }
        let fresh = self.filter_new(delta)?;
        Ok(self.commit(fresh))
    }

    /// Drop already-known items and reject anything that breaks an invariant.
    fn filter_new(&self, delta: RunStateDelta) -> Result<RunStateDelta, StateError> {
        let mut fresh = RunStateDelta::default();

        let mut issue_ids: HashSet<IssueId> = self.issues.iter().map(|i| i.id.clone()).collect();
        for issue in delta.issues {
            if issue_ids.insert(issue.id.clone()) {
                fresh.issues.push(issue);
            }
        }

        let mut location_ids: HashSet<LocationId> = self.location_index.keys().cloned().collect();
        for location in delta.locations {
            if !issue_ids.contains(&location.issue_id) {
                return Err(StateError::UnknownIssue {
                    location: location.id,
                    issue: location.issue_id,
                });
            }
            if self.locations.contains_key(&location.issue_id)
                || fresh
                    .locations
                    .iter()
                    .any(|l: &Location| l.issue_id == location.issue_id)
            {
                continue;
            }
            if location_ids.insert(location.id.clone()) {
                fresh.locations.push(location);
            }
        }

        let mut owners: HashMap<LocationId, FixDomain> = HashMap::new();
        for (location, domain) in delta.assignments {
            let owner = self
                .assignments
                .get(&location)
                .copied()
                .or_else(|| owners.get(&location).copied());
            match owner {
                Some(existing) if existing == domain => {}
                Some(existing) => {
                    return Err(StateError::DomainReassigned {
                        location,
                        owner: existing.to_string(),
                        requested: domain.to_string(),
                    })
                }
                None => {
                    if !location_ids.contains(&location) {
                        return Err(StateError::UnknownLocationId(location));
                    }
                    owners.insert(location.clone(), domain);
                    fresh.assignments.push((location, domain));
                }
            }
        }

        let mut next_attempt: HashMap<LocationId, u32> = HashMap::new();
        for fix in delta.fix_attempts {
            let existing = self.attempts(&fix.location_id);
            if existing.iter().any(|f| f.id == fix.id)
                || fresh.fix_attempts.iter().any(|f| f.id == fix.id)
            {
                continue;
            }
            if !location_ids.contains(&fix.location_id) {
                return Err(StateError::UnknownLocation {
                    fix: fix.id,
                    location: fix.location_id,
                });
            }
            if self.outcomes.contains_key(&fix.location_id) {
                return Err(StateError::AlreadyTerminal(fix.location_id));
            }
            if let Some(owner) = self
                .assignments
                .get(&fix.location_id)
                .or_else(|| owners.get(&fix.location_id))
            {
                if *owner != fix.domain {
                    return Err(StateError::DomainReassigned {
                        location: fix.location_id,
                        owner: owner.to_string(),
                        requested: fix.domain.to_string(),
                    });
                }
            }
            let expected = next_attempt
                .get(&fix.location_id)
                .copied()
                .unwrap_or(existing.len() as u32 + 1);
            if fix.attempt_number != expected {
                return Err(StateError::AttemptGap {
                    fix: fix.id,
                    expected,
                });
            }
            next_attempt.insert(fix.location_id.clone(), expected + 1);
            fresh.fix_attempts.push(fix);
        }

        for verdict in delta.verdicts {
            if !verdict.is_well_formed() {
                return Err(StateError::MissingFeedback(verdict.fix_id));
            }
            let prior = self
                .verdicts
                .iter()
                .chain(fresh.verdicts.iter())
                .find(|v| v.fix_id == verdict.fix_id);
            if let Some(prior) = prior {
                if prior.decision == verdict.decision && prior.feedback == verdict.feedback {
                    continue;
                }
                return Err(StateError::ConflictingVerdict(verdict.fix_id));
            }
            let known = self
                .attempts(&verdict.location_id)
                .iter()
                .chain(fresh.fix_attempts.iter())
                .any(|f| f.id == verdict.fix_id);
            if !known {
                return Err(StateError::UnknownFix(verdict.fix_id));
            }
            fresh.verdicts.push(verdict);
        }

        for (location, outcome) in delta.outcomes {
            if !location_ids.contains(&location) {
                return Err(StateError::UnknownLocationId(location));
            }
            let prior = self
                .outcomes
                .get(&location)
                .or_else(|| fresh.outcomes.iter().find(|(l, _)| l == &location).map(|(_, o)| o));
            match prior {
                Some(p) if p == &outcome => continue,
                Some(_) => return Err(StateError::AlreadyTerminal(location)),
                None => fresh.outcomes.push((location, outcome)),
            }
        }

        for warning in delta.warnings {
            if !self.warnings.contains(&warning) && !fresh.warnings.contains(&warning) {
                fresh.warnings.push(warning);
            }
        }

        if let Some(result) = delta.publish_result {
            match &self.publish_result {
                Some(existing) if existing == &result => {}
                Some(_) => return Err(StateError::AlreadyPublished),
                None => fresh.publish_result = Some(result),
            }
        }

        Ok(fresh)
    }

    fn commit(&mut self, fresh: RunStateDelta) -> ApplySummary {
        let summary = ApplySummary {
            issues: fresh.issues.len(),
            locations: fresh.locations.len(),
            fix_attempts: fresh.fix_attempts.len(),
            verdicts: fresh.verdicts.len(),
            outcomes: fresh.outcomes.len(),
            warnings: fresh.warnings.len(),
        };

        self.issues.extend(fresh.issues);
        for location in fresh.locations {
            self.location_index
                .insert(location.id.clone(), location.issue_id.clone());
            self.locations.insert(location.issue_id.clone(), location);
        }
        self.assignments.extend(fresh.assignments);
        for fix in fresh.fix_attempts {
            self.attempts
                .entry(fix.location_id.clone())
                .or_default()
                .push(fix);
        }
        self.verdicts.extend(fresh.verdicts);
        self.outcomes.extend(fresh.outcomes);
        self.warnings.extend(fresh.warnings);
        if fresh.publish_result.is_some() {
            self.publish_result = fresh.publish_result;
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IssueCategory, LineRange, Severity};

    fn issue() -> Issue {
        Issue::new(
            "index.html",
            Some(3),
            IssueCategory::Aria,
            Severity::High,
            "4.1.2",
            "button has no accessible name",
        )
    }

    fn location_for(issue: &Issue) -> Location {
        Location::new(
            issue.id.clone(),
            "index.html",
            LineRange::single(3),
            "<button></button>",
            "add aria-label",
        )
    }

    fn seeded() -> (RunState, Location) {
        let mut state = RunState::new("run-1", "acme/site");
        let issue = issue();
        let location = location_for(&issue);
        state
            .apply(RunStateDelta {
                issues: vec![issue],
                locations: vec![location.clone()],
                assignments: vec![(location.id.clone(), FixDomain::Html)],
                ..Default::default()
            })
            .unwrap();
        (state, location)
    }

    #[test]
    fn status_only_moves_forward() {
        let mut state = RunState::new("run-1", "acme/site");
        state.transition(RunStatus::Completed).unwrap();
        assert!(state.transition(RunStatus::Failed).is_err());
        assert!(state.transition(RunStatus::Running).is_err());
        assert!(state.finished_at().is_some());
    }

    #[test]
    fn closed_run_rejects_deltas() {
        let mut state = RunState::new("run-1", "acme/site");
        state.transition(RunStatus::Failed).unwrap();
        let err = state
            .apply(RunStateDelta {
                issues: vec![issue()],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Closed(_)));
        assert!(state.issues().is_empty());
    }

    #[test]
    fn location_must_reference_known_issue() {
        let mut state = RunState::new("run-1", "acme/site");
        let orphan = location_for(&issue());
        let err = state
            .apply(RunStateDelta {
                locations: vec![orphan],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownIssue { .. }));
    }

    #[test]
    fn rejected_delta_leaves_no_partial_writes() {
        let (mut state, location) = seeded();
        let extra = Issue::new("a.css", None, IssueCategory::Contrast, Severity::Low, "1.4.3", "grey on grey");
        let gap = FixAttempt::new(location.id.clone(), 2, FixDomain::Html, "x", "y");
        let err = state
            .apply(RunStateDelta {
                issues: vec![extra],
                fix_attempts: vec![gap],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StateError::AttemptGap { expected: 1, .. }));
        assert_eq!(state.issues().len(), 1);
    }

    #[test]
    fn reapplying_a_delta_is_a_no_op() {
        let (mut state, location) = seeded();
        let fix = FixAttempt::new(location.id.clone(), 1, FixDomain::Html, "<button aria-label=\"Close\"></button>", "name it");
        let delta = RunStateDelta {
            fix_attempts: vec![fix.clone()],
            verdicts: vec![Verdict::approved(&fix)],
            outcomes: vec![(location.id.clone(), LocationOutcome::Approved { attempt_number: 1 })],
            ..Default::default()
        };

        let first = state.apply(delta.clone()).unwrap();
        let second = state.apply(delta).unwrap();

        assert_eq!(first.total(), 3);
        assert_eq!(second.total(), 0);
        assert_eq!(state.attempts(&location.id).len(), 1);
        assert_eq!(state.verdicts().len(), 1);
    }

    #[test]
    fn conflicting_verdict_is_rejected() {
        let (mut state, location) = seeded();
        let fix = FixAttempt::new(location.id.clone(), 1, FixDomain::Html, "p", "r");
        state
            .apply(RunStateDelta {
                fix_attempts: vec![fix.clone()],
                verdicts: vec![Verdict::revise(&fix, "label is vague")],
                ..Default::default()
            })
            .unwrap();
        let err = state
            .apply(RunStateDelta {
                verdicts: vec![Verdict::approved(&fix)],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StateError::ConflictingVerdict(_)));
    }

    #[test]
    fn owning_domain_cannot_change() {
        let (mut state, location) = seeded();
        let css_fix = FixAttempt::new(location.id.clone(), 1, FixDomain::Css, "p", "r");
        let err = state
            .apply(RunStateDelta {
                fix_attempts: vec![css_fix],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StateError::DomainReassigned { .. }));
    }

    #[test]
    fn terminal_location_accepts_no_new_attempts() {
        let (mut state, location) = seeded();
        state
            .apply(RunStateDelta {
                outcomes: vec![(
                    location.id.clone(),
                    LocationOutcome::Abandoned {
                        attempt_number: None,
                        reason: AbandonReason::HandlerError,
                        last_feedback: None,
                    },
                )],
                ..Default::default()
            })
            .unwrap();
        let fix = FixAttempt::new(location.id.clone(), 1, FixDomain::Html, "p", "r");
        let err = state
            .apply(RunStateDelta {
                fix_attempts: vec![fix],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyTerminal(_)));
    }

    #[test]
    fn current_fix_is_highest_attempt() {
        let (mut state, location) = seeded();
        let first = FixAttempt::new(location.id.clone(), 1, FixDomain::Html, "v1", "r");
        let second = FixAttempt::new(location.id.clone(), 2, FixDomain::Html, "v2", "r");
        state
            .apply(RunStateDelta {
                fix_attempts: vec![first.clone(), second],
                verdicts: vec![Verdict::revise(&first, "too terse")],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(state.current_fix(&location.id).unwrap().patch, "v2");
        assert_eq!(state.attempts(&location.id).len(), 2);
    }
}
