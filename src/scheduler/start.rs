//! Starting builds: merge creation on the test branch.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::RepoConfig;
use crate::effects::{ChangeResult, GitHubEffect, GitHubInterpreter, GitHubResponse};
use crate::state::builds;
use crate::types::{PullRequestState, Sha};

use super::exemption::try_status_exemption;
use super::rebuild::{RebuildOutcome, try_rebuild};
use super::{SchedulerError, request, unexpected};

/// Result of trying to start a build for one pull request.
#[derive(Debug)]
pub enum StartOutcome {
    /// The build (or exemption) went ahead; the repository's slot is used.
    Started(ChangeResult),
    /// Nothing started; the scheduler moves on to the next candidate.
    NotStarted(ChangeResult),
}

/// Commit message of the test merge.
pub fn merge_message(state: &PullRequestState) -> String {
    let approver = if state.is_try {
        "<try>"
    } else {
        state.approved_by.as_str()
    };
    format!(
        "Auto merge of #{} - {}, r={}\n\n{}\n\n{}",
        state.number.0, state.head_ref, approver, state.title, state.body
    )
}

/// Re-runs only failed builders when possible, otherwise starts a full build.
pub async fn start_build_or_rebuild<I>(
    github: &I,
    repo: &RepoConfig,
    state: &mut PullRequestState,
    now: DateTime<Utc>,
) -> Result<StartOutcome, SchedulerError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    match try_rebuild(github, state, now).await? {
        RebuildOutcome::Started(result) => Ok(StartOutcome::Started(result)),
        RebuildOutcome::NotApplicable => start_build(github, repo, state, now).await,
        RebuildOutcome::Failed(mut result) => {
            match start_build(github, repo, state, now).await? {
                StartOutcome::Started(started) => {
                    result.absorb(started);
                    Ok(StartOutcome::Started(result))
                }
                StartOutcome::NotStarted(other) => {
                    result.absorb(other);
                    Ok(StartOutcome::NotStarted(result))
                }
            }
        }
    }
}

/// Creates the test merge for the active track and begins the build.
pub async fn start_build<I>(
    github: &I,
    repo: &RepoConfig,
    state: &mut PullRequestState,
    now: DateTime<Utc>,
) -> Result<StartOutcome, SchedulerError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    let track = state.active_track();
    let builders = repo.builders(track);
    if builders.is_empty() {
        return Err(SchedulerError::InvalidConfiguration {
            repo: repo.id().to_string(),
            reason: "no builders configured".to_string(),
        });
    }
    debug!(pr = %state.number, ?track, builders = builders.len(), "Starting build");

    if !refresh(github, state).await? {
        return Ok(StartOutcome::NotStarted(ChangeResult::unchanged()));
    }

    if repo.only_status_builders() && state.is_approved() && repo.status_based_exemption {
        match try_status_exemption(github, repo, state).await {
            Ok(Some((merge_sha, reason))) => {
                info!(pr = %state.number, sha = %merge_sha, reason, "Test exempted");
                return Ok(StartOutcome::Started(builds::exempt(state, merge_sha, reason)));
            }
            Ok(None) => {}
            Err(SchedulerError::MergeConflict) => {
                return Ok(StartOutcome::NotStarted(builds::merge_conflict(state)));
            }
            Err(e) => return Err(e),
        }
    }

    let branch = repo.branch_for(track).to_string();
    match create_merge(github, state, &branch).await {
        Ok(merge_sha) => {
            info!(pr = %state.number, branch = %branch, sha = %merge_sha, "Merge created");
            Ok(StartOutcome::Started(builds::begin_build(state, merge_sha, now)))
        }
        Err(SchedulerError::MergeConflict) => {
            warn!(pr = %state.number, branch = %branch, "Merge conflict");
            Ok(StartOutcome::NotStarted(builds::merge_conflict(state)))
        }
        Err(e) => Err(e),
    }
}

/// Refreshes title and body from the hosting platform. Returns false when
/// the head moved on; the push event will reset the pull request.
async fn refresh<I>(github: &I, state: &mut PullRequestState) -> Result<bool, SchedulerError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    const OP: &str = "fetch pull request";
    let pull = match request(github, OP, GitHubEffect::GetPull { pr: state.number }).await? {
        GitHubResponse::Pull(pull) => pull,
        other => return Err(unexpected(OP, other)),
    };
    if pull.head_sha != state.head_sha {
        warn!(
            pr = %state.number,
            expected = %state.head_sha,
            actual = %pull.head_sha,
            "Head moved before the build started"
        );
        return Ok(false);
    }
    state.title = pull.title;
    state.body = pull.body;
    if !pull.head_ref.is_empty() {
        state.head_ref = pull.head_ref;
    }
    Ok(true)
}

/// Current head of `branch`.
pub(crate) async fn branch_head<I>(github: &I, branch: &str) -> Result<Sha, SchedulerError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    const OP: &str = "read branch head";
    let effect = GitHubEffect::GetBranchHead {
        branch: branch.to_string(),
    };
    match request(github, OP, effect).await? {
        GitHubResponse::BranchHead(sha) => Ok(sha),
        other => Err(unexpected(OP, other)),
    }
}

/// Merges the pull request's head onto the current base, on `branch`.
///
/// When `branch` is not the base branch it is first reset to the base head.
pub(crate) async fn create_merge<I>(
    github: &I,
    state: &PullRequestState,
    branch: &str,
) -> Result<Sha, SchedulerError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    const OP: &str = "create merge";
    let base_sha = branch_head(github, &state.base_ref).await?;

    if branch != state.base_ref {
        let reset = GitHubEffect::SetRef {
            branch: branch.to_string(),
            sha: base_sha,
            force: true,
        };
        match request(github, "reset test branch", reset).await? {
            GitHubResponse::RefUpdated => {}
            other => return Err(unexpected("reset test branch", other)),
        }
    }

    let merge = GitHubEffect::Merge {
        base: branch.to_string(),
        head: state.head_sha.clone(),
        message: merge_message(state),
    };
    match request(github, OP, merge).await? {
        GitHubResponse::Merged { sha } => Ok(sha),
        GitHubResponse::MergeConflict => Err(SchedulerError::MergeConflict),
        other => Err(unexpected(OP, other)),
    }
}
