//! Domain model: issues, locations, fix attempts, verdicts and errors.

pub mod error;
pub mod fix;
pub mod issue;
pub mod location;
pub mod verdict;

pub use error::{
    ConfigError, HandlerError, IntelligenceError, OrchestratorError, Result, StateError,
    Transient, VcsError,
};
pub use fix::{FixAttempt, FixDomain, FixId};
pub use issue::{Issue, IssueCategory, IssueId, Severity};
pub use location::{LineRange, Location, LocationId};
pub use verdict::{Decision, Verdict};
