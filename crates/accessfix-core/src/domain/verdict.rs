//! Judge decisions on fix attempts.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fix::{FixAttempt, FixId};
use super::location::LocationId;

/// Decision recorded for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Revise,
    Abandoned,
}

/// Judgment on exactly one [`FixAttempt`]. Immutable.
///
/// Construct through [`Verdict::approved`], [`Verdict::revise`] or
/// [`Verdict::abandoned`]; the latter two require feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub fix_id: FixId,
    pub location_id: LocationId,
    pub attempt_number: u32,
    pub decision: Decision,
    pub feedback: Option<String>,
    pub criteria_checked: BTreeSet<String>,
    /// True when the retry ceiling turned a `revise` into `abandoned`.
    pub forced: bool,
    pub recorded_at: DateTime<Utc>,
}

impl Verdict {
    fn base(fix: &FixAttempt, decision: Decision, feedback: Option<String>) -> Self {
        Self {
            fix_id: fix.id.clone(),
            location_id: fix.location_id.clone(),
            attempt_number: fix.attempt_number,
            decision,
            feedback,
            criteria_checked: BTreeSet::new(),
            forced: false,
            recorded_at: Utc::now(),
        }
    }

    pub fn approved(fix: &FixAttempt) -> Self {
        Self::base(fix, Decision::Approved, None)
    }

    pub fn revise(fix: &FixAttempt, feedback: impl Into<String>) -> Self {
        Self::base(fix, Decision::Revise, Some(feedback.into()))
    }

    pub fn abandoned(fix: &FixAttempt, feedback: impl Into<String>) -> Self {
        Self::base(fix, Decision::Abandoned, Some(feedback.into()))
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.criteria_checked = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    /// Whether the feedback rule holds: non-approved verdicts carry feedback.
    pub fn is_well_formed(&self) -> bool {
        match self.decision {
            Decision::Approved => true,
            _ => self
                .feedback
                .as_deref()
                .is_some_and(|f| !f.trim().is_empty()),
        }
    }
}
