//! The language-model collaborator seam.
//!
//! Analyze, locate, every domain handler and the judge talk to the model
//! through [`Intelligence::complete`]. Replies are free text that should
//! contain one JSON value; [`parse_reply`] pulls it out of code fences or
//! surrounding prose before deserializing.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{FixDomain, IntelligenceError};

/// What a completion is for. Adapters may use it to pick a system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "purpose", content = "domain")]
pub enum Purpose {
    Analyze,
    Locate,
    Fix(FixDomain),
    Review,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Purpose::Analyze => write!(f, "analyze"),
            Purpose::Locate => write!(f, "locate"),
            Purpose::Fix(domain) => write!(f, "fix:{domain}"),
            Purpose::Review => write!(f, "review"),
        }
    }
}

/// One model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub purpose: Purpose,
    /// What the call is about: a file path, issue id or location id.
    pub subject: String,
    pub prompt: String,
    /// Structured inputs the prompt refers to.
    pub context: serde_json::Value,
}

impl CompletionRequest {
    pub fn new(
        purpose: Purpose,
        subject: impl Into<String>,
        prompt: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            purpose,
            subject: subject.into(),
            prompt: prompt.into(),
            context,
        }
    }
}

/// Language-model collaborator.
#[async_trait]
pub trait Intelligence: Send + Sync {
    /// Run one completion and return the raw reply text.
    async fn complete(&self, request: CompletionRequest) -> Result<String, IntelligenceError>;
}

/// Locate the JSON value inside a model reply.
///
/// Prefers a ```` ```json ```` fence, then any fence, then the first balanced
/// `{...}` or `[...]` in the text.
pub fn extract_json(reply: &str) -> Option<&str> {
    if let Some(start) = reply.find("```json") {
        let body = &reply[start + 7..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }

    if let Some(start) = reply.find("```") {
        let body = &reply[start + 3..];
        if let Some(end) = body.find("```") {
            let inner = &body[..end];
            if let Some(open) = inner.find(['{', '[']) {
                return balanced(&inner[open..]).or(Some(inner[open..].trim()));
            }
        }
    }

    let open = reply.find(['{', '['])?;
    balanced(&reply[open..])
}

/// The balanced bracket expression at the start of `text`, skipping
/// brackets inside string literals.
fn balanced(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract and deserialize the JSON value in a model reply.
pub fn parse_reply<T: DeserializeOwned>(reply: &str) -> Result<T, IntelligenceError> {
    let json = extract_json(reply).ok_or_else(|| {
        IntelligenceError::MalformedResponse(format!("no JSON found in reply: {}", preview(reply)))
    })?;
    serde_json::from_str(json)
        .map_err(|e| IntelligenceError::MalformedResponse(format!("{e}: {}", preview(json))))
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        out.push_str("...");
    }
    out
}

/// Cut `text` to at most `limit` characters on a char boundary.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        ok: bool,
    }

    #[test]
    fn extracts_fenced_json() {
        let reply = "Here you go:\n```json\n{\"ok\": true}\n```\nThanks";
        assert_eq!(extract_json(reply), Some("{\"ok\": true}"));
    }

    #[test]
    fn extracts_array_from_prose() {
        let reply = "Found these: [{\"a\": 1}, {\"a\": [2]}] and nothing else";
        assert_eq!(extract_json(reply), Some("[{\"a\": 1}, {\"a\": [2]}]"));
    }

    #[test]
    fn brackets_inside_strings_do_not_unbalance() {
        let reply = r#"{"fixed_code": "a { color: red } ]", "n": 1} trailing"#;
        assert_eq!(
            extract_json(reply),
            Some(r#"{"fixed_code": "a { color: red } ]", "n": 1}"#)
        );
    }

    #[test]
    fn unbalanced_reply_is_malformed() {
        let err = parse_reply::<Probe>("{\"ok\": true").unwrap_err();
        assert!(matches!(err, IntelligenceError::MalformedResponse(_)));
    }

    #[test]
    fn parse_reply_deserializes() {
        let probe: Probe = parse_reply("```\n{\"ok\": false}\n```").unwrap();
        assert_eq!(probe, Probe { ok: false });
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn purpose_display() {
        assert_eq!(Purpose::Fix(FixDomain::Css).to_string(), "fix:css");
        assert_eq!(Purpose::Review.to_string(), "review");
    }
}
