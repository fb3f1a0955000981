//! Proposed remediations.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::location::LocationId;

/// Technology domain of a fix; selects the handler that produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixDomain {
    Html,
    Css,
    Javascript,
}

impl FixDomain {
    pub const ALL: [FixDomain; 3] = [Self::Html, Self::Css, Self::Javascript];

    /// Short expert title used in handler prompts.
    pub fn expert_title(&self) -> &'static str {
        match self {
            Self::Html => "HTML accessibility expert",
            Self::Css => "CSS accessibility expert",
            Self::Javascript => "JavaScript accessibility expert",
        }
    }
}

impl fmt::Display for FixDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Html => "html",
            Self::Css => "css",
            Self::Javascript => "javascript",
        };
        write!(f, "{s}")
    }
}

/// Identifier of one attempt: `<location-id>#<attempt>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixId(pub String);

impl FixId {
    pub fn new(location_id: &LocationId, attempt_number: u32) -> Self {
        Self(format!("{location_id}#{attempt_number}"))
    }
}

impl fmt::Display for FixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One proposed remediation for a location. Superseded, never deleted, when a
/// revision produces `attempt_number + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAttempt {
    pub id: FixId,
    pub location_id: LocationId,
    pub attempt_number: u32,
    pub domain: FixDomain,
    /// Replacement content for the location's snippet.
    pub patch: String,
    pub rationale: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FixAttempt {
    pub fn new(
        location_id: LocationId,
        attempt_number: u32,
        domain: FixDomain,
        patch: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            id: FixId::new(&location_id, attempt_number),
            location_id,
            attempt_number,
            domain,
            patch: patch.into(),
            rationale: rationale.into(),
            notes: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_id_encodes_location_and_attempt() {
        let loc = LocationId("loc-abc".to_string());
        let fix = FixAttempt::new(loc, 2, FixDomain::Css, "a{}", "why");
        assert_eq!(fix.id.0, "loc-abc#2");
    }

    #[test]
    fn domain_serializes_snake_case() {
        let json = serde_json::to_string(&FixDomain::Javascript).unwrap();
        assert_eq!(json, "\"javascript\"");
    }
}
