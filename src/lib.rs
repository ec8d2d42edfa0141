//! Merge Queue Bot - a comment-driven merge queue for GitHub repositories.
//!
//! Reviewers approve pull requests with commands such as `@bors r+`; the bot
//! tests each approved pull request merged onto its base branch, one at a
//! time per repository, and fast-forwards the base branch when the build
//! passes. The pure core ([`state`], [`scheduler`]) describes every side
//! effect as data; the [`engine`] carries them out.

pub mod auth;
pub mod commands;
pub mod comments;
pub mod config;
pub mod effects;
pub mod engine;
pub mod github;
pub mod labels;
pub mod persistence;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod types;
pub mod webhooks;
pub mod worker;

#[cfg(test)]
pub mod test_utils;
