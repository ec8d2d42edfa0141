//! Typed webhook payloads.
//!
//! Only the deliveries the bot acts on have a variant here. The parser
//! returns `None` for everything else.

use serde::{Deserialize, Serialize};

use crate::effects::{CommitState, MergeCause, PullData};
use crate::state::IncomingComment;
use crate::types::{PrNumber, RepoId, Sha};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GitHubEvent {
    /// A comment on the pull request's conversation tab.
    IssueComment(CommentEvent),

    /// A comment on a line of the diff.
    ReviewComment(ReviewCommentEvent),

    PullRequest(PullRequestEvent),

    /// Commits were pushed to a branch of the repository.
    Push(PushEvent),

    /// A commit status changed (legacy Status API).
    Status(StatusEvent),

    /// A check run finished.
    CheckRun(CheckRunEvent),
}

impl GitHubEvent {
    pub fn repo_id(&self) -> &RepoId {
        match self {
            GitHubEvent::IssueComment(e) => &e.repo,
            GitHubEvent::ReviewComment(e) => &e.repo,
            GitHubEvent::PullRequest(e) => &e.repo,
            GitHubEvent::Push(e) => &e.repo,
            GitHubEvent::Status(e) => &e.repo,
            GitHubEvent::CheckRun(e) => &e.repo,
        }
    }

    /// The `X-GitHub-Event` name this event was parsed from.
    pub fn kind(&self) -> &'static str {
        match self {
            GitHubEvent::IssueComment(_) => "issue_comment",
            GitHubEvent::ReviewComment(_) => "pull_request_review_comment",
            GitHubEvent::PullRequest(_) => "pull_request",
            GitHubEvent::Push(_) => "push",
            GitHubEvent::Status(_) => "status",
            GitHubEvent::CheckRun(_) => "check_run",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentEvent {
    pub repo: RepoId,
    pub pr: PrNumber,
    /// Title and description of the pull request at the time of the comment.
    pub title: String,
    pub body: String,
    pub comment: IncomingComment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewCommentEvent {
    pub repo: RepoId,
    pub pr: PrNumber,
    pub title: String,
    pub body: String,
    /// The commit the comment was originally made on.
    pub commit_id: Sha,
    pub comment: IncomingComment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrAction {
    Opened,
    Reopened,
    /// New commits on the head branch.
    Synchronize,
    Closed,
    Edited,
    Assigned,
    Unassigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub repo: RepoId,
    pub action: PrAction,
    pub pull: PullData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub repo: RepoId,
    /// Branch name without `refs/heads/`.
    pub branch: String,
    pub before: Sha,
    pub after: Sha,
    /// The newest pushed commit, blamed if a pull request becomes unmergeable.
    pub head_commit: Option<MergeCause>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub repo: RepoId,
    pub sha: Sha,
    pub context: String,
    pub state: CommitState,
    pub target_url: Option<String>,
    /// Branches whose head is `sha`.
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRunEvent {
    pub repo: RepoId,
    pub id: u64,
    pub name: String,
    pub head_sha: Sha,
    /// `None` until the run has finished.
    pub conclusion: Option<String>,
    pub details_url: Option<String>,
}

impl CheckRunEvent {
    /// Whether the run's conclusion should be recorded as a builder result.
    ///
    /// Skipped runs were never meant to run and count as neither outcome.
    pub fn is_reportable(&self) -> bool {
        matches!(self.conclusion.as_deref(), Some(c) if c != "skipped")
    }

    pub fn succeeded(&self) -> bool {
        self.conclusion.as_deref() == Some("success")
    }
}
