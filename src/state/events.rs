//! Events consumed by the pull request state machine.

use serde::{Deserialize, Serialize};

use crate::effects::MergeCause;
use crate::types::Sha;

/// A comment addressed to the pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingComment {
    pub author: String,
    pub body: String,
    /// Link to the comment, recorded in the retry log.
    #[serde(default)]
    pub url: Option<String>,
    /// Opaque position of the comment in the pull request's history.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// A repository event concerning one pull request.
///
/// Every kind of input the bot receives maps to one of these variants.
/// Kinds with no effect on state are [`Event::Ignored`]; kinds the bot has
/// never seen are [`Event::Unknown`]. Neither is an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// New commits were pushed to the head branch.
    CommitPushed { sha: Sha },

    /// The head branch was rewritten.
    ForcePushed { sha: Sha },

    BaseRefChanged { base_ref: String },

    IssueComment(IncomingComment),

    /// A review comment, made on commit `commit_id`.
    ReviewComment {
        comment: IncomingComment,
        commit_id: Sha,
    },

    TitleRenamed { title: String },

    DescriptionEdited { body: String },

    AssigneeChanged {
        #[serde(default)]
        assignee: Option<String>,
    },

    Merged,

    Closed,

    Reopened,

    /// A CI builder reported on a merge commit.
    BuildResult {
        merge_sha: Sha,
        builder: String,
        success: bool,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        run_id: Option<u64>,
    },

    /// The build of `merge_sha` ran past the repository timeout.
    TimedOut { merge_sha: Sha },

    /// Something changed that may affect mergeability (a push to the base
    /// branch, for example).
    MergeabilityInvalidated {
        #[serde(default)]
        cause: Option<MergeCause>,
    },

    /// The mergeability worker resolved the flag.
    MergeabilityResolved {
        mergeable: Option<bool>,
        #[serde(default)]
        cause: Option<MergeCause>,
    },

    /// A known kind with no state impact (reviews, labels, mentions...).
    Ignored { kind: String },

    Unknown { kind: String },
}

impl Event {
    /// Short name for logging.
    pub fn name(&self) -> &str {
        match self {
            Event::CommitPushed { .. } => "commit_pushed",
            Event::ForcePushed { .. } => "force_pushed",
            Event::BaseRefChanged { .. } => "base_ref_changed",
            Event::IssueComment(_) => "issue_comment",
            Event::ReviewComment { .. } => "review_comment",
            Event::TitleRenamed { .. } => "title_renamed",
            Event::DescriptionEdited { .. } => "description_edited",
            Event::AssigneeChanged { .. } => "assignee_changed",
            Event::Merged => "merged",
            Event::Closed => "closed",
            Event::Reopened => "reopened",
            Event::BuildResult { .. } => "build_result",
            Event::TimedOut { .. } => "timed_out",
            Event::MergeabilityInvalidated { .. } => "mergeability_invalidated",
            Event::MergeabilityResolved { .. } => "mergeability_resolved",
            Event::Ignored { kind } | Event::Unknown { kind } => kind,
        }
    }

    /// Maps a timeline item type name to an event with no payload.
    ///
    /// Returns `Unknown` for names the bot does not recognise.
    pub fn from_kind(kind: &str) -> Event {
        match kind {
            "MergedEvent" => Event::Merged,
            "ClosedEvent" => Event::Closed,
            "ReopenedEvent" => Event::Reopened,
            "PullRequestReview" | "SubscribedEvent" | "MentionedEvent" | "LabeledEvent"
            | "UnlabeledEvent" | "ReferencedEvent" | "CrossReferencedEvent" => Event::Ignored {
                kind: kind.to_string(),
            },
            _ => Event::Unknown {
                kind: kind.to_string(),
            },
        }
    }
}
