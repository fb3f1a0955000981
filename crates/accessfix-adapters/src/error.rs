//! Error types for accessfix-adapters

use accessfix_core::{IntelligenceError, VcsError};
use thiserror::Error;

/// Errors raised while building an adapter.
///
/// Once built, adapters report failures through the collaborator error
/// types in `accessfix_core` so the transport retry can classify them.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Required environment variable is unset or empty
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// Environment variable could not be parsed
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    /// HTTP client construction failed
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        AdapterError::Http(err.to_string())
    }
}

/// Result type for adapter construction.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Map a transport-level reqwest failure onto the model error taxonomy.
pub(crate) fn intelligence_transport_error(err: reqwest::Error) -> IntelligenceError {
    if err.is_decode() {
        IntelligenceError::MalformedResponse(err.to_string())
    } else if err.is_builder() {
        IntelligenceError::Rejected(err.to_string())
    } else {
        IntelligenceError::Unavailable(err.to_string())
    }
}

/// Map an HTTP status and body from the model endpoint.
pub(crate) fn intelligence_status_error(status: u16, body: &str) -> IntelligenceError {
    let detail = format!("HTTP {status}: {}", body.trim());
    match status {
        429 => IntelligenceError::QuotaExceeded(detail),
        408 | 500..=599 => IntelligenceError::Unavailable(detail),
        _ => IntelligenceError::Rejected(detail),
    }
}

/// Map an HTTP status and body from the forge API.
pub(crate) fn forge_status_error(status: u16, body: &str) -> VcsError {
    let detail = format!("HTTP {status}: {}", body.trim());
    match status {
        401 | 403 => VcsError::Auth(detail),
        408 | 429 | 500..=599 => VcsError::Network(detail),
        _ => VcsError::Command(detail),
    }
}

pub(crate) fn forge_transport_error(err: reqwest::Error) -> VcsError {
    if err.is_builder() || err.is_decode() {
        VcsError::Command(err.to_string())
    } else {
        VcsError::Network(err.to_string())
    }
}

/// Classify a failed git invocation from its stderr.
pub(crate) fn git_error(args: &str, stderr: &str) -> VcsError {
    let lowered = stderr.to_lowercase();
    let detail = format!("git {args}: {}", stderr.trim());

    const AUTH: &[&str] = &[
        "authentication failed",
        "permission denied",
        "could not read username",
        "403",
        "invalid username or password",
    ];
    const NETWORK: &[&str] = &[
        "could not resolve host",
        "connection timed out",
        "connection reset",
        "connection refused",
        "failed to connect",
        "early eof",
        "the remote end hung up",
        "operation timed out",
    ];

    if AUTH.iter().any(|needle| lowered.contains(needle)) {
        VcsError::Auth(detail)
    } else if NETWORK.iter().any(|needle| lowered.contains(needle)) {
        VcsError::Network(detail)
    } else {
        VcsError::Command(detail)
    }
}
