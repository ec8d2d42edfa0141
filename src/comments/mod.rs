//! Comments posted by the bot.
//!
//! State-changing comments ([`StateComment`]) carry a machine-readable
//! fragment so that replaying a pull request's comment history rebuilds its
//! state. Informational comments are plain text.

pub mod format;
pub mod fragment;
pub mod messages;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Sha;

pub use fragment::{FRAGMENT_END, FRAGMENT_START, ParseError, extract_fragments};

/// A state-changing event announced in a comment.
///
/// The serialized form is a de facto wire protocol: field names are stable
/// and every variant is tagged by `type`. Fields added after the first
/// release are optional so that older comments still parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateComment {
    Approved {
        sha: Sha,
        approver: String,
        #[serde(default)]
        queue: String,
    },
    ApprovalIgnoredWip {
        sha: Sha,
        /// Shown in the text, not part of the fragment.
        #[serde(skip)]
        wip_keyword: String,
    },
    Delegated {
        delegator: String,
        delegate: String,
    },
    BuildStarted {
        head_sha: Sha,
        merge_sha: Sha,
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
    },
    TryBuildStarted {
        head_sha: Sha,
        merge_sha: Sha,
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
    },
    BuildCompleted {
        #[serde(default)]
        approved_by: String,
        #[serde(default)]
        base_ref: String,
        /// Builder name to result URL.
        #[serde(default)]
        builders: BTreeMap<String, String>,
        merge_sha: Sha,
        #[serde(default)]
        ended_at: Option<DateTime<Utc>>,
    },
    TryBuildCompleted {
        #[serde(default)]
        builders: BTreeMap<String, String>,
        merge_sha: Sha,
        #[serde(default)]
        ended_at: Option<DateTime<Utc>>,
    },
    BuildFailed {
        #[serde(default)]
        builder_url: String,
        builder_name: String,
        #[serde(default)]
        merge_sha: Option<Sha>,
        #[serde(default)]
        ended_at: Option<DateTime<Utc>>,
    },
    TryBuildFailed {
        #[serde(default)]
        builder_url: String,
        builder_name: String,
        #[serde(default)]
        merge_sha: Option<Sha>,
        #[serde(default)]
        ended_at: Option<DateTime<Utc>>,
    },
    TimedOut {
        #[serde(default)]
        merge_sha: Option<Sha>,
        #[serde(default)]
        ended_at: Option<DateTime<Utc>>,
    },
}

impl StateComment {
    /// The `type` tag used in the fragment.
    pub fn kind(&self) -> &'static str {
        match self {
            StateComment::Approved { .. } => "Approved",
            StateComment::ApprovalIgnoredWip { .. } => "ApprovalIgnoredWip",
            StateComment::Delegated { .. } => "Delegated",
            StateComment::BuildStarted { .. } => "BuildStarted",
            StateComment::TryBuildStarted { .. } => "TryBuildStarted",
            StateComment::BuildCompleted { .. } => "BuildCompleted",
            StateComment::TryBuildCompleted { .. } => "TryBuildCompleted",
            StateComment::BuildFailed { .. } => "BuildFailed",
            StateComment::TryBuildFailed { .. } => "TryBuildFailed",
            StateComment::TimedOut { .. } => "TimedOut",
        }
    }
}

/// A comment the caller should post on the pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "comment", rename_all = "snake_case")]
pub enum Comment {
    State(StateComment),
    Plain(String),
}

impl Comment {
    pub fn plain(text: impl Into<String>) -> Self {
        Comment::Plain(text.into())
    }

    /// Renders the final markdown body.
    pub fn render(&self, bot_name: &str) -> String {
        match self {
            Comment::Plain(text) => text.clone(),
            Comment::State(state) => format::render_state_comment(state, bot_name),
        }
    }
}

impl From<StateComment> for Comment {
    fn from(state: StateComment) -> Self {
        Comment::State(state)
    }
}
