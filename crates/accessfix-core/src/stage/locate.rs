//! Locate: bind each admitted issue to exact source text.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::{Issue, LineRange, Location};
use crate::intelligence::{parse_reply, truncate_chars, CompletionRequest, Intelligence, Purpose};
use crate::prompts;
use crate::run_state::{RunStateDelta, RunWarning};
use crate::stage::analyze::line_number;
use crate::stage::{RunStateView, Stage, StageKind, StageResult};
use crate::transport::call_with_retry;

#[derive(Debug, Default, Deserialize)]
struct Pinpoint {
    #[serde(default, alias = "line")]
    exact_line: Option<serde_json::Value>,
    #[serde(default)]
    end_line: Option<serde_json::Value>,
    #[serde(default, alias = "snippet")]
    code_snippet: Option<String>,
    #[serde(default)]
    problematic_element: Option<String>,
    #[serde(default)]
    fix_approach: Option<String>,
}

/// Turn a model reply (or its absence) into a location.
///
/// The snippet must occur verbatim in `content`; otherwise the source line
/// at the reported or hinted line is used.
fn resolve(issue: &Issue, content: &str, pinpoint: Pinpoint) -> Result<Location, String> {
    let line = pinpoint
        .exact_line
        .as_ref()
        .and_then(line_number)
        .or(issue.line_hint);
    let end_line = pinpoint.end_line.as_ref().and_then(line_number);

    let quoted = pinpoint
        .code_snippet
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| {
            if content.contains(s) {
                Some(s.to_string())
            } else if content.contains(s.trim()) {
                Some(s.trim().to_string())
            } else {
                None
            }
        });

    let (snippet, range) = match quoted {
        Some(snippet) => {
            let start = content
                .find(&snippet)
                .map(|offset| content[..offset].matches('\n').count() as u32 + 1)
                .unwrap_or_else(|| line.unwrap_or(1));
            let span = snippet.lines().count().max(1) as u32;
            let end = end_line.unwrap_or(start + span - 1);
            (snippet, LineRange::new(start, end))
        }
        None => {
            let line = line.ok_or_else(|| "no verbatim snippet and no line number".to_string())?;
            let text = content
                .lines()
                .nth((line.max(1) - 1) as usize)
                .filter(|l| !l.trim().is_empty())
                .ok_or_else(|| format!("line {line} is empty or outside the file"))?;
            (text.to_string(), LineRange::single(line))
        }
    };

    let approach = pinpoint
        .fix_approach
        .filter(|s| !s.trim().is_empty())
        .or_else(|| issue.recommendation.clone())
        .unwrap_or_default();

    let mut location = Location::new(issue.id.clone(), &issue.file_path, range, snippet, approach);
    location.problematic_element = pinpoint.problematic_element.filter(|s| !s.trim().is_empty());
    Ok(location)
}

pub struct LocateStage {
    intelligence: Arc<dyn Intelligence>,
}

impl LocateStage {
    pub fn new(intelligence: Arc<dyn Intelligence>) -> Self {
        Self { intelligence }
    }
}

#[async_trait]
impl Stage for LocateStage {
    fn kind(&self) -> StageKind {
        StageKind::Locate
    }

    async fn run(&self, view: &RunStateView) -> StageResult {
        let config = view.config();
        let state = view.state();
        let mut delta = RunStateDelta::new();

        let pending: Vec<&Issue> = state
            .issues()
            .iter()
            .filter(|i| config.admits(i.severity))
            .filter(|i| state.location_for_issue(&i.id).is_none())
            .collect();

        for issue in pending {
            let Some(content) = view.source().file(&issue.file_path) else {
                delta.warnings.push(RunWarning::UnlocatedIssue {
                    issue_id: issue.id.clone(),
                    reason: format!("{} is not in the working copy", issue.file_path),
                });
                continue;
            };

            let request = CompletionRequest::new(
                Purpose::Locate,
                issue.id.to_string(),
                prompts::locate(),
                json!({
                    "issue": issue,
                    "file_path": issue.file_path,
                    "content": truncate_chars(content, config.locate_char_limit),
                }),
            );

            let pinpoint = match call_with_retry(&config.transport, "locate", || {
                self.intelligence.complete(request.clone())
            })
            .await
            .and_then(|reply| parse_reply::<Pinpoint>(&reply))
            {
                Ok(p) => p,
                Err(e) => {
                    warn!(issue_id = %issue.id, error = %e, "locate call failed, using line hint");
                    Pinpoint::default()
                }
            };

            match resolve(issue, content, pinpoint) {
                Ok(location) => {
                    debug!(issue_id = %issue.id, range = %location.line_range, "issue located");
                    delta.locations.push(location);
                }
                Err(reason) => {
                    warn!(issue_id = %issue.id, reason = %reason, "issue could not be located");
                    delta.warnings.push(RunWarning::UnlocatedIssue {
                        issue_id: issue.id.clone(),
                        reason,
                    });
                }
            }
        }

        StageResult::Continue(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IssueCategory, Severity};

    const PAGE: &str = "<html>\n<body>\n  <img src=\"logo.png\">\n</body>\n</html>\n";

    fn issue(line: Option<u32>) -> Issue {
        Issue::new("index.html", line, IssueCategory::Aria, Severity::Critical, "1.1.1", "img lacks alt")
            .with_recommendation("add alt text")
    }

    #[test]
    fn verbatim_snippet_sets_line_from_offset() {
        let pinpoint = Pinpoint {
            code_snippet: Some("<img src=\"logo.png\">".into()),
            ..Default::default()
        };
        let loc = resolve(&issue(None), PAGE, pinpoint).unwrap();
        assert_eq!(loc.line_range, LineRange::single(3));
        assert_eq!(loc.suggested_approach, "add alt text");
    }

    #[test]
    fn paraphrased_snippet_falls_back_to_source_line() {
        let pinpoint = Pinpoint {
            exact_line: Some(json!(3)),
            code_snippet: Some("<img src='logo.png'>".into()),
            fix_approach: Some("describe the logo".into()),
            ..Default::default()
        };
        let loc = resolve(&issue(None), PAGE, pinpoint).unwrap();
        assert_eq!(loc.snippet, "  <img src=\"logo.png\">");
        assert_eq!(loc.suggested_approach, "describe the logo");
    }

    #[test]
    fn missing_reply_uses_line_hint() {
        let loc = resolve(&issue(Some(3)), PAGE, Pinpoint::default()).unwrap();
        assert!(loc.snippet.contains("logo.png"));
    }

    #[test]
    fn nothing_to_anchor_on_is_an_error() {
        assert!(resolve(&issue(None), PAGE, Pinpoint::default()).is_err());
        assert!(resolve(&issue(Some(40)), PAGE, Pinpoint::default()).is_err());
    }
}
