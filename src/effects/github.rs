//! GitHub API effect types.
//!
//! These types describe GitHub API operations as data, without executing
//! them. Effects are repo-scoped: the interpreter is constructed for one
//! repository, so effects don't name it.

use serde::{Deserialize, Serialize};

use crate::types::{GithubState, PrNumber, Sha};

/// State of a commit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }

    pub fn from_api_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommitState::Pending),
            "success" => Some(CommitState::Success),
            "failure" => Some(CommitState::Failure),
            "error" => Some(CommitState::Error),
            _ => None,
        }
    }
}

/// A GitHub API effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GitHubEffect {
    // ─── Pull requests ────────────────────────────────────────────────────────
    GetPull { pr: PrNumber },

    ListOpenPulls,

    /// Open a pull request from `head` (a branch of this repository) into `base`.
    CreatePull {
        title: String,
        head: String,
        base: String,
        body: String,
    },

    // ─── Comments and labels ──────────────────────────────────────────────────
    PostComment { pr: PrNumber, body: String },

    /// List all issue comments on a PR, oldest first.
    ListComments { pr: PrNumber },

    GetLabels { pr: PrNumber },

    ReplaceLabels { pr: PrNumber, labels: Vec<String> },

    // ─── Commit statuses ──────────────────────────────────────────────────────
    CreateStatus {
        sha: Sha,
        state: CommitState,
        context: String,
        description: String,
        target_url: Option<String>,
    },

    /// Latest status per context on a commit.
    ListStatuses { sha: Sha },

    // ─── Refs and commits ─────────────────────────────────────────────────────
    GetBranchHead { branch: String },

    /// Point `heads/<branch>` at `sha`.
    ///
    /// Without `force` the update must be a fast-forward.
    SetRef {
        branch: String,
        sha: Sha,
        force: bool,
    },

    /// Merge `head` into `base` on the server, creating a merge commit.
    Merge {
        base: String,
        head: Sha,
        message: String,
    },

    GetCommit { sha: Sha },

    /// How far `head` is ahead of and behind `base`.
    Compare { base: Sha, head: Sha },

    // ─── Permissions and checks ───────────────────────────────────────────────
    ListCollaborators,

    RerequestCheckRun { run_id: u64 },
}

/// Pull request data returned from the GitHub API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullData {
    pub number: PrNumber,
    pub head_sha: Sha,
    /// `owner:branch` of the head.
    pub head_ref: String,
    pub base_ref: String,
    pub title: String,
    pub body: String,
    pub author: String,
    pub assignee: Option<String>,
    pub state: GithubState,
    pub mergeable: Option<bool>,
    /// GitHub's own test merge, present while mergeable.
    pub merge_commit_sha: Option<Sha>,
}

/// An issue comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentData {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    pub context: String,
    pub state: CommitState,
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitData {
    pub sha: Sha,
    pub parents: Vec<Sha>,
    pub message: String,
}

/// Response from a GitHub effect.
///
/// Each variant corresponds to the response from a particular effect type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GitHubResponse {
    /// Response to `GetPull`.
    Pull(PullData),

    /// Response to `ListOpenPulls`.
    PullList(Vec<PullData>),

    /// Response to `CreatePull`.
    PullCreated { number: PrNumber, html_url: String },

    CommentPosted,

    /// Response to `ListComments`.
    Comments(Vec<CommentData>),

    /// Response to `GetLabels`.
    Labels(Vec<String>),

    LabelsReplaced,

    StatusCreated,

    /// Response to `ListStatuses`.
    Statuses(Vec<StatusData>),

    /// Response to `GetBranchHead`.
    BranchHead(Sha),

    RefUpdated,

    /// Response to `Merge` when a merge commit was created.
    Merged { sha: Sha },

    /// Response to `Merge` when the branches conflict.
    MergeConflict,

    /// Response to `GetCommit`.
    Commit(CommitData),

    /// Response to `Compare`.
    Comparison { ahead_by: u64, behind_by: u64 },

    /// Response to `ListCollaborators`: logins.
    Collaborators(Vec<String>),

    CheckRunRerequested,
}
