//! Detected accessibility defects.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Coarse defect category, used by delegation to pick a domain handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Structural,
    Contrast,
    KeyboardAccess,
    Aria,
    Other,
}

impl IssueCategory {
    /// Parse a category label as the model tends to write it.
    ///
    /// Matching is case-insensitive and tolerant of separators, so
    /// `"Keyboard Access"`, `"keyboard-access"` and `"keyboard_access"` all
    /// map to [`IssueCategory::KeyboardAccess`]. Anything unrecognised is
    /// [`IssueCategory::Other`].
    pub fn parse_lenient(raw: &str) -> Self {
        let norm: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        match norm.as_str() {
            "structural" | "structure" | "semantic" | "semantics" => Self::Structural,
            "contrast" | "colorcontrast" | "colourcontrast" | "color" => Self::Contrast,
            "keyboardaccess" | "keyboard" | "focus" | "keyboardnavigation" => Self::KeyboardAccess,
            "aria" | "arialabel" | "ariaattributes" => Self::Aria,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Structural => "structural",
            Self::Contrast => "contrast",
            Self::KeyboardAccess => "keyboard-access",
            Self::Aria => "aria",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Defect severity. Declaration order gives `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parse a severity label; unknown labels are treated as `Medium`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" | "serious" => Self::High,
            "low" | "minor" => Self::Low,
            _ => Self::Medium,
        }
    }

    pub const ALL: [Severity; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!(
                "unknown severity '{other}' (expected critical, high, medium or low)"
            )),
        }
    }
}

/// Run-unique issue identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(pub String);

impl IssueId {
    /// Derive a stable id from the fields that identify a finding.
    ///
    /// The same finding reported by a retried analysis maps to the same id,
    /// which is what lets [`crate::run_state::RunState::apply`] dedupe it.
    pub fn derive(file_path: &str, line: Option<u32>, criterion: &str, description: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(file_path.as_bytes());
        hasher.update([0u8]);
        hasher.update(line.unwrap_or(0).to_le_bytes());
        hasher.update(criterion.as_bytes());
        hasher.update([0u8]);
        hasher.update(description.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(format!("iss-{}", &digest[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One detected defect. Immutable once created by the analyze stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub category: IssueCategory,
    pub severity: Severity,
    /// WCAG reference, e.g. `"1.1.1"`.
    pub criterion: String,
    pub description: String,
    /// File the analyzer reported the defect in.
    pub file_path: String,
    pub line_hint: Option<u32>,
    pub impact: Option<String>,
    pub recommendation: Option<String>,
}

impl Issue {
    pub fn new(
        file_path: impl Into<String>,
        line_hint: Option<u32>,
        category: IssueCategory,
        severity: Severity,
        criterion: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let file_path = file_path.into();
        let criterion = criterion.into();
        let description = description.into();
        Self {
            id: IssueId::derive(&file_path, line_hint, &criterion, &description),
            category,
            severity,
            criterion,
            description,
            file_path,
            line_hint,
            impact: None,
            recommendation: None,
        }
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = Some(recommendation.into());
        self
    }

    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.impact = Some(impact.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_critical_highest() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn category_parse_is_separator_insensitive() {
        assert_eq!(
            IssueCategory::parse_lenient("Keyboard Access"),
            IssueCategory::KeyboardAccess
        );
        assert_eq!(
            IssueCategory::parse_lenient("keyboard-access"),
            IssueCategory::KeyboardAccess
        );
        assert_eq!(IssueCategory::parse_lenient("ARIA"), IssueCategory::Aria);
        assert_eq!(IssueCategory::parse_lenient("Perceivable"), IssueCategory::Other);
    }

    #[test]
    fn unknown_severity_defaults_to_medium() {
        assert_eq!(Severity::parse_lenient("whatever"), Severity::Medium);
        assert_eq!(Severity::parse_lenient(" Critical "), Severity::Critical);
    }

    #[test]
    fn strict_severity_parse_rejects_unknown() {
        assert_eq!("HIGH".parse::<Severity>(), Ok(Severity::High));
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn issue_id_is_stable_and_field_sensitive() {
        let a = IssueId::derive("index.html", Some(4), "1.1.1", "img missing alt");
        let b = IssueId::derive("index.html", Some(4), "1.1.1", "img missing alt");
        let c = IssueId::derive("index.html", Some(5), "1.1.1", "img missing alt");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("iss-"));
        assert_eq!(a.as_str().len(), 16);
    }
}
