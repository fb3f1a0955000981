//! Run configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//!
//! ```toml
//! max_attempts = 3
//! max_parallel_handlers = 4
//! severity_filter = ["critical", "high"]
//!
//! [transport]
//! max_attempts = 2
//! timeout_secs = 60
//! backoff_ms = 500
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{ConfigError, Severity};
use crate::transport::TransportPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Review-loop ceiling: attempts per location before forced abandonment.
    pub max_attempts: u32,
    /// Concurrent per-location pipelines.
    pub max_parallel_handlers: usize,
    /// Severities that proceed past analysis. Empty means all.
    pub severity_filter: BTreeSet<Severity>,
    pub branch_name: String,
    pub base_branch: String,
    pub pull_request_title: String,
    /// Characters of file content sent with an analyze request.
    pub analyze_char_limit: usize,
    /// Characters of file content sent with a locate request.
    pub locate_char_limit: usize,
    pub transport: TransportPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_parallel_handlers: 4,
            severity_filter: BTreeSet::new(),
            branch_name: "accessibility-fixes".to_string(),
            base_branch: "main".to_string(),
            pull_request_title: "Fix accessibility issues".to_string(),
            analyze_char_limit: 8000,
            locate_char_limit: 6000,
            transport: TransportPolicy::default(),
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_parallel_handlers == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_handlers must be at least 1".to_string(),
            ));
        }
        if self.transport.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "transport.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.branch_name.trim().is_empty() || self.base_branch.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "branch names must not be empty".to_string(),
            ));
        }
        if self.branch_name == self.base_branch {
            return Err(ConfigError::Invalid(format!(
                "fix branch '{}' must differ from base branch",
                self.branch_name
            )));
        }
        Ok(())
    }

    /// Whether an issue of this severity proceeds to locate.
    pub fn admits(&self, severity: Severity) -> bool {
        self.severity_filter.is_empty() || self.severity_filter.contains(&severity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RunConfig::from_toml_str("").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.transport.max_attempts, 2);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = RunConfig::from_toml_str(
            r#"
max_parallel_handlers = 8
severity_filter = ["critical", "high"]

[transport]
timeout_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.max_parallel_handlers, 8);
        assert!(config.admits(Severity::Critical));
        assert!(!config.admits(Severity::Low));
        assert_eq!(config.transport.timeout_secs, 5);
        assert_eq!(config.transport.max_attempts, 2);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = RunConfig::from_toml_str("max_attempts = 0").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn branch_must_differ_from_base() {
        let config = RunConfig {
            branch_name: "main".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_output_parses_back() {
        let config = RunConfig::default();
        let raw = config.to_toml_string().unwrap();
        assert_eq!(RunConfig::from_toml_str(&raw).unwrap(), config);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accessfix.toml");
        std::fs::write(&path, "branch_name = \"a11y\"").unwrap();
        assert_eq!(RunConfig::load(&path).unwrap().branch_name, "a11y");
    }
}
