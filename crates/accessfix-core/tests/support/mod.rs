//! Shared fixtures: a three-file site and a scripted model that knows it.

#![allow(dead_code)]

use accessfix_core::fakes::{MemoryVcs, ScriptedIntelligence};
use accessfix_core::{IntelligenceError, Purpose, RepoRef, RunConfig, TransportPolicy};
use serde_json::json;

pub const PAGE: &str = "<html>\n<body>\n  <img src=\"logo.png\">\n</body>\n</html>\n";
pub const STYLES: &str = ".muted {\n  color: #aaa;\n}\n";
pub const SCRIPT: &str = "const button = document.querySelector('#go');\nbutton.addEventListener('click', go);\n";

pub fn repo() -> RepoRef {
    RepoRef::new("https://github.com/acme/site.git", "acme/site")
}

pub fn site_vcs() -> MemoryVcs {
    MemoryVcs::new()
        .with_file("index.html", PAGE)
        .with_file("styles.css", STYLES)
        .with_file("app.js", SCRIPT)
}

pub fn page_only_vcs() -> MemoryVcs {
    MemoryVcs::new().with_file("index.html", PAGE)
}

/// Defaults with a millisecond backoff so transport retries stay quick.
pub fn fast_config() -> RunConfig {
    RunConfig {
        transport: TransportPolicy {
            max_attempts: 2,
            timeout_secs: 5,
            backoff_ms: 1,
        },
        ..RunConfig::default()
    }
}

pub fn analyze_reply(path: &str) -> String {
    let findings = match path {
        "index.html" => json!([{
            "line": 3,
            "severity": "critical",
            "wcag": "1.1.1",
            "category": "aria",
            "description": "Image lacks a text alternative",
            "recommendation": "Add a descriptive alt attribute"
        }]),
        "styles.css" => json!([{
            "line": 2,
            "severity": "medium",
            "wcag": "1.4.3",
            "category": "contrast",
            "description": "Muted text contrast is 2.3:1"
        }]),
        "app.js" => json!([{
            "line": 2,
            "severity": "low",
            "wcag": "2.1.1",
            "category": "keyboard",
            "description": "Click handler has no keyboard equivalent"
        }]),
        _ => json!([]),
    };
    format!("Here is what I found:\n```json\n{findings}\n```")
}

pub fn snippet_for(path: &str) -> &'static str {
    match path {
        "index.html" => "<img src=\"logo.png\">",
        "styles.css" => "color: #aaa;",
        "app.js" => "button.addEventListener('click', go);",
        _ => "",
    }
}

pub fn fixed_for(path: &str) -> &'static str {
    match path {
        "index.html" => "<img src=\"logo.png\" alt=\"Acme logo\">",
        "styles.css" => "color: #595959;",
        "app.js" => "button.addEventListener('click', go);\nbutton.addEventListener('keydown', onKey);",
        _ => "",
    }
}

pub fn approve() -> String {
    json!({"decision": "approved", "criteria_checked": ["1.1.1"], "rating": 9}).to_string()
}

pub fn revise(feedback: &str) -> String {
    json!({"decision": "revise", "feedback": feedback}).to_string()
}

/// Model for the fixture site. `review` decides each judgment from the
/// attempt number and file path; fix calls for `failing_fix` are rejected.
pub fn scripted<R>(review: R, failing_fix: Option<&'static str>) -> ScriptedIntelligence
where
    R: Fn(u32, &str) -> String + Send + Sync + 'static,
{
    ScriptedIntelligence::new(move |req| match req.purpose {
        Purpose::Analyze => Ok(analyze_reply(&req.subject)),
        Purpose::Locate => {
            let path = req.context["issue"]["file_path"].as_str().unwrap_or_default();
            Ok(json!({
                "exact_line": req.context["issue"]["line_hint"],
                "code_snippet": snippet_for(path),
                "fix_approach": "minimal change"
            })
            .to_string())
        }
        Purpose::Fix(_) => {
            let path = req.context["location"]["file_path"].as_str().unwrap_or_default();
            if failing_fix == Some(path) {
                return Err(IntelligenceError::Rejected("model refused the request".into()));
            }
            Ok(json!({
                "fixed_code": fixed_for(path),
                "explanation": "adds the missing accessible affordance"
            })
            .to_string())
        }
        Purpose::Review => {
            let attempt = req.context["fix"]["attempt_number"].as_u64().unwrap_or(0) as u32;
            let path = req.context["issue"]["file_path"].as_str().unwrap_or_default();
            Ok(review(attempt, path))
        }
    })
}
