//! GitHub API client and effect interpreter.
//!
//! Implements [`GitHubInterpreter`](crate::effects::GitHubInterpreter) on top
//! of octocrab, with exponential backoff for transient failures.

mod client;
mod error;
mod interpreter;
mod retry;

pub use client::OctocrabClient;
pub use error::{GitHubApiError, GitHubErrorKind, classify};
pub use interpreter::interpret_github_effect;
pub use retry::{RetryConfig, RetryPolicy, retry_with_backoff};
