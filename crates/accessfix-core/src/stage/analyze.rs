//! Analyze: find issues in every source file.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::{Issue, IssueCategory, Severity};
use crate::intelligence::{parse_reply, truncate_chars, CompletionRequest, Intelligence, Purpose};
use crate::prompts;
use crate::run_state::{RunStateDelta, RunWarning};
use crate::stage::{RunStateView, Stage, StageKind, StageResult};
use crate::transport::call_with_retry;

/// One finding as the model reports it.
#[derive(Debug, Deserialize)]
struct Finding {
    #[serde(default)]
    line: Option<serde_json::Value>,
    #[serde(default)]
    severity: String,
    #[serde(default, alias = "criterion")]
    wcag: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    impact: Option<String>,
    #[serde(default)]
    recommendation: Option<String>,
}

impl Finding {
    fn into_issue(self, file_path: &str) -> Option<Issue> {
        let description = self.description.trim();
        if description.is_empty() {
            return None;
        }
        let mut issue = Issue::new(
            file_path,
            self.line.as_ref().and_then(line_number),
            IssueCategory::parse_lenient(&self.category),
            Severity::parse_lenient(&self.severity),
            self.wcag.trim(),
            description,
        );
        issue.impact = self.impact.filter(|s| !s.trim().is_empty());
        issue.recommendation = self.recommendation.filter(|s| !s.trim().is_empty());
        Some(issue)
    }
}

/// Accept `12`, `"12"` or `"12-14"` (first line wins).
pub(crate) fn line_number(value: &serde_json::Value) -> Option<u32> {
    let line: Option<u32> = match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| !part.is_empty())
            .and_then(|part| part.parse().ok()),
        _ => None,
    };
    line.filter(|n| *n > 0)
}

pub struct AnalyzeStage {
    intelligence: Arc<dyn Intelligence>,
}

impl AnalyzeStage {
    pub fn new(intelligence: Arc<dyn Intelligence>) -> Self {
        Self { intelligence }
    }
}

#[async_trait]
impl Stage for AnalyzeStage {
    fn kind(&self) -> StageKind {
        StageKind::Analyze
    }

    async fn run(&self, view: &RunStateView) -> StageResult {
        let files = &view.source().files;
        if files.is_empty() {
            return StageResult::Skip("no analyzable source files".to_string());
        }

        let config = view.config();
        let mut delta = RunStateDelta::new();
        let mut analyzed = 0usize;

        for (path, content) in files {
            let excerpt = truncate_chars(content, config.analyze_char_limit);
            let request = CompletionRequest::new(
                Purpose::Analyze,
                path.clone(),
                prompts::analyze(path),
                json!({
                    "file_path": path,
                    "content": excerpt,
                    "truncated": excerpt.len() < content.len(),
                }),
            );

            let reply = call_with_retry(&config.transport, "analyze", || {
                self.intelligence.complete(request.clone())
            })
            .await
            .and_then(|reply| parse_reply::<Vec<Finding>>(&reply));

            match reply {
                Ok(findings) => {
                    analyzed += 1;
                    let before = delta.issues.len();
                    delta
                        .issues
                        .extend(findings.into_iter().filter_map(|f| f.into_issue(path)));
                    debug!(file = %path, issues = delta.issues.len() - before, "file analyzed");
                }
                Err(e) => {
                    warn!(file = %path, error = %e, "analysis failed for file");
                    delta.warnings.push(RunWarning::AnalysisFailed {
                        file_path: path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if analyzed == 0 {
            return StageResult::Fail(format!(
                "none of {} source files could be analyzed",
                files.len()
            ));
        }
        StageResult::Continue(delta)
    }
}
