//! Command types for bot commands.
//!
//! These commands are parsed from pull request comments addressed to the bot.

use serde::{Deserialize, Serialize};

use crate::comments::StateComment;
use crate::types::RollupMode;

/// Flavour of a ping reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingKind {
    /// `ping` or `hello?`
    Standard,
    /// The literal phrase `are you still there?`
    Portal,
}

/// A parsed command from a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// `r+`, `r=<user>`, optionally followed by a commit id.
    ///
    /// `sha` is the explicitly pinned commit, or the commit the comment was
    /// made on; `None` means "the current head".
    Approve {
        approver: String,
        sha: Option<String>,
    },

    /// `r-`
    Unapprove,

    /// `p=<n>`
    Prioritize { priority: i64 },

    /// `delegate=<user>`
    Delegate { to: String },

    /// `delegate-`
    Undelegate,

    /// `delegate+`
    DelegateAuthor,

    /// `retry`
    Retry,

    /// `try`
    Try,

    /// `try-`
    Untry,

    /// `rollup`, `rollup-`, `rollup=never|iffy|maybe|always`
    Rollup { mode: RollupMode },

    /// `force`
    Force,

    /// `clean`
    Clean,

    /// `ping`, `hello?`, `are you still there?`
    Ping { kind: PingKind },

    /// `treeclosed=<n>`
    TreeClosed { threshold: i64 },

    /// `treeclosed-`
    TreeOpen,

    /// A configured hook name, optionally `name=extra`.
    Hook { name: String, extra: Option<String> },

    /// A state fragment from one of the bot's own comments.
    Resync { comment: StateComment },
}

/// Maps a rollup keyword to its mode.
pub fn rollup_mode_for(word: &str) -> Option<RollupMode> {
    match word {
        "rollup" | "rollup=always" => Some(RollupMode::Always),
        "rollup-" | "rollup=maybe" => Some(RollupMode::Default),
        "rollup=never" => Some(RollupMode::Never),
        "rollup=iffy" => Some(RollupMode::Iffy),
        _ => None,
    }
}
