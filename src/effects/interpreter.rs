//! Effect interpreter trait.
//!
//! The trait-based design enables:
//! - Mock interpreters for testing
//! - Logging/tracing interpreters

use std::future::Future;

use super::github::{GitHubEffect, GitHubResponse};

/// Interprets GitHub effects against the GitHub API.
///
/// Implementations are constructed for one repository, so all effects
/// executed through a single interpreter instance are scoped to it.
///
/// # Example (mock for testing)
///
/// ```ignore
/// struct AlwaysConflicts;
///
/// impl GitHubInterpreter for AlwaysConflicts {
///     type Error = std::convert::Infallible;
///
///     async fn interpret(&self, effect: GitHubEffect) -> Result<GitHubResponse, Self::Error> {
///         match effect {
///             GitHubEffect::Merge { .. } => Ok(GitHubResponse::MergeConflict),
///             _ => Ok(GitHubResponse::RefUpdated),
///         }
///     }
/// }
/// ```
pub trait GitHubInterpreter {
    /// The error type returned by this interpreter.
    type Error;

    /// Execute a GitHub effect and return its response.
    fn interpret(
        &self,
        effect: GitHubEffect,
    ) -> impl Future<Output = Result<GitHubResponse, Self::Error>> + Send;
}
