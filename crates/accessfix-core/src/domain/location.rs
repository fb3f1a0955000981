//! Source positions bound to issues.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::issue::IssueId;

/// Identifier of a [`Location`]. Locations are one-to-one with issues, so the
/// id is derived from the issue id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub String);

impl LocationId {
    pub fn for_issue(issue_id: &IssueId) -> Self {
        let suffix = issue_id
            .as_str()
            .strip_prefix("iss-")
            .unwrap_or(issue_id.as_str());
        Self(format!("loc-{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive, 1-based line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    /// Build a range, swapping the bounds if they arrive reversed.
    pub fn new(start: u32, end: u32) -> Self {
        if end < start {
            Self {
                start: end,
                end: start,
            }
        } else {
            Self { start, end }
        }
    }

    pub fn single(line: u32) -> Self {
        Self {
            start: line,
            end: line,
        }
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "L{}", self.start)
        } else {
            write!(f, "L{}-L{}", self.start, self.end)
        }
    }
}

/// Concrete place in the working copy where an issue must be fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub issue_id: IssueId,
    pub file_path: String,
    pub line_range: LineRange,
    /// Exact source text the fix replaces.
    pub snippet: String,
    /// Free-text hint passed through to the domain handler.
    pub suggested_approach: String,
    pub problematic_element: Option<String>,
}

impl Location {
    pub fn new(
        issue_id: IssueId,
        file_path: impl Into<String>,
        line_range: LineRange,
        snippet: impl Into<String>,
        suggested_approach: impl Into<String>,
    ) -> Self {
        Self {
            id: LocationId::for_issue(&issue_id),
            issue_id,
            file_path: file_path.into(),
            line_range,
            snippet: snippet.into(),
            suggested_approach: suggested_approach.into(),
            problematic_element: None,
        }
    }

    /// Lowercased file extension including the dot, if any.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.file_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
    }
}
