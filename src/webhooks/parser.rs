//! GitHub webhook payload parser.
//!
//! The event type comes from the `X-GitHub-Event` header. Deliveries the
//! bot has no use for (other event types, other actions, comments on plain
//! issues) parse to `Ok(None)`. Only malformed payloads are errors.

use serde::Deserialize;
use thiserror::Error;

use crate::effects::{CommitState, MergeCause, PullData};
use crate::state::IncomingComment;
use crate::types::{GithubState, PrNumber, RepoId, Sha};

use super::events::{
    CheckRunEvent, CommentEvent, GitHubEvent, PrAction, PullRequestEvent, PushEvent,
    ReviewCommentEvent, StatusEvent,
};

#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON deserialization failed (includes missing required fields).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid field value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Parses a webhook payload into a typed event.
pub fn parse_webhook(event_type: &str, payload: &[u8]) -> Result<Option<GitHubEvent>, ParseError> {
    match event_type {
        "issue_comment" => Ok(parse_issue_comment(payload)?.map(GitHubEvent::IssueComment)),
        "pull_request_review_comment" => {
            Ok(parse_review_comment(payload)?.map(GitHubEvent::ReviewComment))
        }
        "pull_request" => Ok(parse_pull_request(payload)?.map(GitHubEvent::PullRequest)),
        "push" => Ok(parse_push(payload)?.map(GitHubEvent::Push)),
        "status" => Ok(Some(GitHubEvent::Status(parse_status(payload)?))),
        "check_run" => Ok(parse_check_run(payload)?.map(GitHubEvent::CheckRun)),
        _ => Ok(None),
    }
}

/// Reads only the repository of a delivery, to pick the secret that
/// verifies it.
pub fn peek_repository(payload: &[u8]) -> Result<RepoId, ParseError> {
    #[derive(Deserialize)]
    struct Envelope {
        repository: RawRepository,
    }
    let envelope: Envelope = serde_json::from_slice(payload)?;
    Ok(envelope.repository.id())
}

// ============================================================================
// Shared payload pieces
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawRepository {
    owner: RawOwner,
    name: String,
}

impl RawRepository {
    fn id(self) -> RepoId {
        RepoId::new(self.owner.login.or(self.owner.name).unwrap_or_default(), self.name)
    }
}

/// Push payloads carry `name` instead of `login` for the owner.
#[derive(Debug, Deserialize)]
struct RawOwner {
    login: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    #[serde(default)]
    id: Option<u64>,
    body: Option<String>,
    user: RawUser,
    html_url: Option<String>,
    #[serde(default)]
    original_commit_id: Option<String>,
}

impl RawComment {
    fn into_incoming(self) -> IncomingComment {
        IncomingComment {
            author: self.user.login,
            body: self.body.unwrap_or_default(),
            url: self.html_url,
            cursor: None,
        }
    }

    /// Issue comments share one id sequence with the listing used to
    /// replay history, so their id marks a position in it.
    fn into_positioned(self) -> IncomingComment {
        let cursor = self.id.map(|id| id.to_string());
        IncomingComment {
            cursor,
            ..self.into_incoming()
        }
    }
}

fn sha(field: &'static str, value: &str) -> Result<Sha, ParseError> {
    if value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(Sha::new(value.to_ascii_lowercase()))
    } else {
        Err(ParseError::InvalidField {
            field,
            value: value.to_string(),
        })
    }
}

// ============================================================================
// issue_comment / pull_request_review_comment
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawIssueCommentPayload {
    action: String,
    comment: RawComment,
    issue: RawIssue,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    number: u64,
    title: Option<String>,
    body: Option<String>,
    // Present only when the issue is a pull request
    pull_request: Option<serde_json::Value>,
}

fn parse_issue_comment(payload: &[u8]) -> Result<Option<CommentEvent>, ParseError> {
    let raw: RawIssueCommentPayload = serde_json::from_slice(payload)?;
    if raw.action != "created" || raw.issue.pull_request.is_none() {
        return Ok(None);
    }
    Ok(Some(CommentEvent {
        repo: raw.repository.id(),
        pr: PrNumber(raw.issue.number),
        title: raw.issue.title.unwrap_or_default(),
        body: raw.issue.body.unwrap_or_default(),
        comment: raw.comment.into_positioned(),
    }))
}

#[derive(Debug, Deserialize)]
struct RawReviewCommentPayload {
    action: String,
    comment: RawComment,
    pull_request: RawPullRequest,
    repository: RawRepository,
}

fn parse_review_comment(payload: &[u8]) -> Result<Option<ReviewCommentEvent>, ParseError> {
    let raw: RawReviewCommentPayload = serde_json::from_slice(payload)?;
    if raw.action != "created" {
        return Ok(None);
    }
    let commit_id = match raw.comment.original_commit_id.as_deref() {
        Some(id) => sha("comment.original_commit_id", id)?,
        None => sha("pull_request.head.sha", &raw.pull_request.head.sha)?,
    };
    Ok(Some(ReviewCommentEvent {
        repo: raw.repository.id(),
        pr: PrNumber(raw.pull_request.number),
        title: raw.pull_request.title.clone().unwrap_or_default(),
        body: raw.pull_request.body.clone().unwrap_or_default(),
        commit_id,
        comment: raw.comment.into_incoming(),
    }))
}

// ============================================================================
// pull_request
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawPullRequestPayload {
    action: String,
    pull_request: RawPullRequest,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    number: u64,
    state: String,
    #[serde(default)]
    merged: Option<bool>,
    title: Option<String>,
    body: Option<String>,
    user: RawUser,
    assignee: Option<RawUser>,
    head: RawRef,
    base: RawRef,
    mergeable: Option<bool>,
    merge_commit_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRef {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
    /// Absent when the fork was deleted.
    repo: Option<RawHeadRepository>,
}

#[derive(Debug, Deserialize)]
struct RawHeadRepository {
    owner: RawOwner,
}

impl RawPullRequest {
    fn into_pull_data(self) -> Result<PullData, ParseError> {
        let head_sha = sha("pull_request.head.sha", &self.head.sha)?;
        let owner = self
            .head
            .repo
            .and_then(|r| r.owner.login.or(r.owner.name))
            .unwrap_or_default();
        let state = if self.merged.unwrap_or(false) {
            GithubState::Merged
        } else if self.state == "closed" {
            GithubState::Closed
        } else {
            GithubState::Open
        };
        Ok(PullData {
            number: PrNumber(self.number),
            head_sha,
            head_ref: format!("{}:{}", owner, self.head.ref_name),
            base_ref: self.base.ref_name,
            title: self.title.unwrap_or_default(),
            body: self.body.unwrap_or_default(),
            author: self.user.login,
            assignee: self.assignee.map(|u| u.login),
            state,
            mergeable: self.mergeable,
            merge_commit_sha: self.merge_commit_sha.map(Sha::new),
        })
    }
}

fn parse_pull_request(payload: &[u8]) -> Result<Option<PullRequestEvent>, ParseError> {
    let raw: RawPullRequestPayload = serde_json::from_slice(payload)?;
    let action = match raw.action.as_str() {
        "opened" => PrAction::Opened,
        "reopened" => PrAction::Reopened,
        "synchronize" => PrAction::Synchronize,
        "closed" => PrAction::Closed,
        "edited" => PrAction::Edited,
        "assigned" => PrAction::Assigned,
        "unassigned" => PrAction::Unassigned,
        // Labels, review requests, drafts and the like carry nothing we track
        _ => return Ok(None),
    };
    Ok(Some(PullRequestEvent {
        repo: raw.repository.id(),
        action,
        pull: raw.pull_request.into_pull_data()?,
    }))
}

// ============================================================================
// push
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawPushPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    before: String,
    after: String,
    head_commit: Option<RawHeadCommit>,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawHeadCommit {
    id: String,
    message: String,
}

fn parse_push(payload: &[u8]) -> Result<Option<PushEvent>, ParseError> {
    let raw: RawPushPayload = serde_json::from_slice(payload)?;
    // Tags never matter
    let Some(branch) = raw.ref_name.strip_prefix("refs/heads/") else {
        return Ok(None);
    };
    let head_commit = raw.head_commit.map(|c| MergeCause {
        sha: Sha::new(c.id),
        title: c.message.lines().next().unwrap_or_default().to_string(),
    });
    Ok(Some(PushEvent {
        branch: branch.to_string(),
        before: sha("before", &raw.before)?,
        after: sha("after", &raw.after)?,
        head_commit,
        repo: raw.repository.id(),
    }))
}

// ============================================================================
// status
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawStatusPayload {
    sha: String,
    state: String,
    context: String,
    target_url: Option<String>,
    #[serde(default)]
    branches: Vec<RawBranch>,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawBranch {
    name: String,
}

fn parse_status(payload: &[u8]) -> Result<StatusEvent, ParseError> {
    let raw: RawStatusPayload = serde_json::from_slice(payload)?;
    let state = CommitState::from_api_str(&raw.state).ok_or_else(|| ParseError::InvalidField {
        field: "state",
        value: raw.state.clone(),
    })?;
    Ok(StatusEvent {
        sha: sha("sha", &raw.sha)?,
        state,
        context: raw.context,
        target_url: raw.target_url,
        branches: raw.branches.into_iter().map(|b| b.name).collect(),
        repo: raw.repository.id(),
    })
}

// ============================================================================
// check_run
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawCheckRunPayload {
    action: String,
    check_run: RawCheckRun,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawCheckRun {
    id: u64,
    name: String,
    head_sha: String,
    status: String,
    conclusion: Option<String>,
    details_url: Option<String>,
}

fn parse_check_run(payload: &[u8]) -> Result<Option<CheckRunEvent>, ParseError> {
    let raw: RawCheckRunPayload = serde_json::from_slice(payload)?;
    if raw.action != "completed" || raw.check_run.status != "completed" {
        return Ok(None);
    }
    Ok(Some(CheckRunEvent {
        id: raw.check_run.id,
        head_sha: sha("check_run.head_sha", &raw.check_run.head_sha)?,
        name: raw.check_run.name,
        conclusion: raw.check_run.conclusion,
        details_url: raw.check_run.details_url,
        repo: raw.repository.id(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const HEAD: &str = "065151f8b2c31d9e4ddd34aaf8d3263a997f5cfe";
    const OTHER: &str = "1111111111111111111111111111111111111111";

    fn repository() -> serde_json::Value {
        json!({ "owner": { "login": "octo" }, "name": "widgets" })
    }

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn pull_request(action: &str) -> Vec<u8> {
        bytes(json!({
            "action": action,
            "number": 12,
            "pull_request": {
                "number": 12,
                "state": "open",
                "merged": false,
                "title": "Fix the widget",
                "body": null,
                "user": { "login": "carol" },
                "assignee": { "login": "dave" },
                "head": { "sha": HEAD, "ref": "fix", "repo": { "owner": { "login": "carol" } } },
                "base": { "sha": OTHER, "ref": "main", "repo": { "owner": { "login": "octo" } } },
                "mergeable": null,
                "merge_commit_sha": null
            },
            "repository": repository()
        }))
    }

    #[test]
    fn issue_comment_on_pull_request() {
        let payload = bytes(json!({
            "action": "created",
            "comment": {
                "id": 1,
                "body": "@bors r+",
                "user": { "login": "alice" },
                "html_url": "https://github.com/octo/widgets/pull/12#issuecomment-1"
            },
            "issue": { "number": 12, "title": "Fix", "body": "Desc", "pull_request": {} },
            "repository": repository()
        }));
        let Some(GitHubEvent::IssueComment(event)) = parse_webhook("issue_comment", &payload).unwrap() else {
            panic!("expected a comment");
        };
        assert_eq!(event.repo, RepoId::new("octo", "widgets"));
        assert_eq!(event.pr, PrNumber(12));
        assert_eq!(event.comment.author, "alice");
        assert_eq!(event.comment.body, "@bors r+");
        assert!(event.comment.url.unwrap().ends_with("issuecomment-1"));
        assert_eq!(event.comment.cursor.as_deref(), Some("1"));
    }

    #[test]
    fn comment_on_plain_issue_is_ignored() {
        let payload = bytes(json!({
            "action": "created",
            "comment": { "body": "@bors r+", "user": { "login": "alice" } },
            "issue": { "number": 3 },
            "repository": repository()
        }));
        assert_eq!(parse_webhook("issue_comment", &payload).unwrap(), None);
    }

    #[test]
    fn edited_comment_is_ignored() {
        let payload = bytes(json!({
            "action": "edited",
            "comment": { "body": "@bors r+", "user": { "login": "alice" } },
            "issue": { "number": 3, "pull_request": {} },
            "repository": repository()
        }));
        assert_eq!(parse_webhook("issue_comment", &payload).unwrap(), None);
    }

    #[test]
    fn review_comment_keeps_original_commit() {
        let payload = bytes(json!({
            "action": "created",
            "comment": {
                "body": "@bors r+",
                "user": { "login": "alice" },
                "original_commit_id": OTHER
            },
            "pull_request": {
                "number": 12, "state": "open", "title": "Fix", "body": "",
                "user": { "login": "carol" }, "assignee": null,
                "head": { "sha": HEAD, "ref": "fix" },
                "base": { "sha": OTHER, "ref": "main" },
                "mergeable": true, "merge_commit_sha": null
            },
            "repository": repository()
        }));
        let Some(GitHubEvent::ReviewComment(event)) =
            parse_webhook("pull_request_review_comment", &payload).unwrap()
        else {
            panic!("expected a review comment");
        };
        assert_eq!(event.commit_id, Sha::new(OTHER));
    }

    #[test]
    fn pull_request_fields() {
        let Some(GitHubEvent::PullRequest(event)) =
            parse_webhook("pull_request", &pull_request("opened")).unwrap()
        else {
            panic!("expected a pull request event");
        };
        assert_eq!(event.action, PrAction::Opened);
        assert_eq!(event.pull.head_ref, "carol:fix");
        assert_eq!(event.pull.base_ref, "main");
        assert_eq!(event.pull.assignee.as_deref(), Some("dave"));
        assert_eq!(event.pull.body, "");
        assert_eq!(event.pull.state, GithubState::Open);
    }

    #[test]
    fn irrelevant_pull_request_actions_are_ignored() {
        for action in ["labeled", "review_requested", "converted_to_draft"] {
            assert_eq!(parse_webhook("pull_request", &pull_request(action)).unwrap(), None);
        }
    }

    #[test]
    fn push_to_branch_with_head_commit() {
        let payload = bytes(json!({
            "ref": "refs/heads/main",
            "before": OTHER,
            "after": HEAD,
            "head_commit": { "id": HEAD, "message": "Auto merge of #4 - x, r=y\n\nmore" },
            "repository": { "owner": { "name": "octo" }, "name": "widgets" }
        }));
        let Some(GitHubEvent::Push(event)) = parse_webhook("push", &payload).unwrap() else {
            panic!("expected a push");
        };
        assert_eq!(event.repo, RepoId::new("octo", "widgets"));
        assert_eq!(event.branch, "main");
        assert_eq!(event.head_commit.unwrap().title, "Auto merge of #4 - x, r=y");
    }

    #[test]
    fn tag_push_is_ignored() {
        let payload = bytes(json!({
            "ref": "refs/tags/v1",
            "before": OTHER,
            "after": HEAD,
            "repository": repository()
        }));
        assert_eq!(parse_webhook("push", &payload).unwrap(), None);
    }

    #[test]
    fn status_with_branches() {
        let payload = bytes(json!({
            "sha": HEAD,
            "state": "failure",
            "context": "ci/travis",
            "target_url": "https://ci.example.com/1",
            "branches": [{ "name": "auto" }],
            "repository": repository()
        }));
        let Some(GitHubEvent::Status(event)) = parse_webhook("status", &payload).unwrap() else {
            panic!("expected a status");
        };
        assert_eq!(event.state, CommitState::Failure);
        assert_eq!(event.branches, vec!["auto".to_string()]);
    }

    #[test]
    fn unknown_status_state_is_an_error() {
        let payload = bytes(json!({
            "sha": HEAD, "state": "exploded", "context": "ci", "repository": repository()
        }));
        assert!(matches!(
            parse_webhook("status", &payload),
            Err(ParseError::InvalidField { field: "state", .. })
        ));
    }

    #[test]
    fn check_run_only_when_completed() {
        let run = |action: &str, status: &str, conclusion: Option<&str>| {
            bytes(json!({
                "action": action,
                "check_run": {
                    "id": 99, "name": "test", "head_sha": HEAD, "status": status,
                    "conclusion": conclusion, "details_url": "https://ci.example.com/99"
                },
                "repository": repository()
            }))
        };
        assert_eq!(parse_webhook("check_run", &run("created", "queued", None)).unwrap(), None);

        let Some(GitHubEvent::CheckRun(event)) =
            parse_webhook("check_run", &run("completed", "completed", Some("skipped"))).unwrap()
        else {
            panic!("expected a check run");
        };
        assert!(!event.is_reportable());

        let Some(GitHubEvent::CheckRun(event)) =
            parse_webhook("check_run", &run("completed", "completed", Some("success"))).unwrap()
        else {
            panic!("expected a check run");
        };
        assert!(event.is_reportable() && event.succeeded());
        assert_eq!(event.id, 99);
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        assert_eq!(parse_webhook("watch", b"{}").unwrap(), None);
        assert_eq!(parse_webhook("pull_request_review", b"not json").unwrap(), None);
    }

    #[test]
    fn peek_reads_only_the_repository() {
        let payload = bytes(json!({ "zen": "Keep it simple", "repository": repository() }));
        assert_eq!(peek_repository(&payload).unwrap(), RepoId::new("octo", "widgets"));
    }

    #[test]
    fn bad_sha_is_rejected() {
        let payload = bytes(json!({
            "sha": "nothex", "state": "success", "context": "ci", "repository": repository()
        }));
        assert!(parse_webhook("status", &payload).is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(
            event in prop::sample::select(vec![
                "issue_comment", "pull_request_review_comment", "pull_request",
                "push", "status", "check_run",
            ]),
            payload in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let _ = parse_webhook(event, &payload);
        }
    }
}
