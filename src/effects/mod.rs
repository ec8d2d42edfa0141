//! Effects-as-data.
//!
//! The state machine and scheduler never perform I/O. They describe what
//! should happen as [`Effect`]s and [`GitHubEffect`]s, which the engine
//! executes. This keeps the core deterministic and lets tests assert on
//! literal values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::comments::Comment;
use crate::labels::LabelEvent;
use crate::types::Sha;

pub mod github;
pub mod interpreter;

pub use github::{
    CommentData, CommitData, CommitState, GitHubEffect, GitHubResponse, PullData, StatusData,
};
pub use interpreter::GitHubInterpreter;

/// The commit that caused a mergeability check, used to blame conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCause {
    pub sha: Sha,
    /// First line of the commit message.
    pub title: String,
}

/// An audit record of a `retry` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub number: u64,
    pub actor: String,
    pub at: DateTime<Utc>,
    /// Link to the comment that asked for the retry, if known.
    #[serde(default)]
    pub source: Option<String>,
    pub body: String,
}

/// A side effect requested by the state machine for one pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    /// Set the bot's own commit status on `sha`.
    SetCommitStatus {
        sha: Sha,
        state: CommitState,
        description: String,
        #[serde(default)]
        target_url: Option<String>,
    },

    /// Start the test timeout for the build of `merge_sha`.
    ArmTimeout { merge_sha: Sha },

    /// Stop any running test timeout.
    CancelTimeout,

    RecordRetry(RetryRecord),

    /// Ask the mergeability worker to re-resolve the `mergeable` flag.
    RefreshMergeability {
        #[serde(default)]
        cause: Option<MergeCause>,
    },

    /// Change the repository's tree-closed threshold.
    UpdateTreeClosed {
        threshold: i64,
        #[serde(default)]
        source: Option<String>,
    },

    TriggerHook {
        name: String,
        #[serde(default)]
        extra: Option<String>,
        body: String,
    },

    /// Move the base branch to a tested merge commit.
    FastForward { base_ref: String, merge_sha: Sha },

    /// Re-read the pull request's head from the hosting platform.
    RefreshHead,
}

/// Outcome of feeding one event or command into the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeResult {
    /// Whether the stored state differs and must be persisted.
    pub changed: bool,
    pub comments: Vec<Comment>,
    pub label_events: Vec<LabelEvent>,
    pub effects: Vec<Effect>,
}

impl ChangeResult {
    pub fn unchanged() -> Self {
        ChangeResult::default()
    }

    pub fn changed() -> Self {
        ChangeResult {
            changed: true,
            ..ChangeResult::default()
        }
    }

    pub fn mark_changed(&mut self, changed: bool) {
        self.changed |= changed;
    }

    pub fn comment(&mut self, comment: impl Into<Comment>) {
        self.comments.push(comment.into());
    }

    pub fn label(&mut self, event: LabelEvent) {
        self.label_events.push(event);
    }

    pub fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Appends everything from `other`, keeping order.
    pub fn absorb(&mut self, other: ChangeResult) {
        self.changed |= other.changed;
        self.comments.extend(other.comments);
        self.label_events.extend(other.label_events);
        self.effects.extend(other.effects);
    }

    /// Drops user-visible output, as done while replaying history.
    pub fn silence(&mut self) {
        self.comments.clear();
        self.label_events.clear();
    }

    pub fn is_noop(&self) -> bool {
        !self.changed
            && self.comments.is_empty()
            && self.label_events.is_empty()
            && self.effects.is_empty()
    }
}
