//! Concrete collaborators for accessfix.
//!
//! - [`ChatCompletionsClient`]: [`accessfix_core::Intelligence`] over an
//!   OpenAI-compatible chat-completions endpoint (Groq by default)
//! - [`GitCliClient`]: [`accessfix_core::VersionControlClient`] using the
//!   `git` CLI, with [`GitHubClient`] for pull requests

pub mod chat;
pub mod error;
pub mod git;
pub mod github;

pub use chat::{ChatCompletionsClient, IntelligenceConfig};
pub use error::{AdapterError, Result};
pub use git::{collect_sources, GitCliClient, GitIdentity};
pub use github::{GitHubClient, GitHubConfig};
