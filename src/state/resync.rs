//! Rebuilding state from the bot's own comments.
//!
//! Each state comment is applied as a fact that already happened. Applying
//! the same comment twice leaves the state as after the first time, so
//! history may be replayed over partially restored state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::comments::StateComment;
use crate::effects::ChangeResult;
use crate::types::{
    AttemptState, BuildAttempt, BuildState, BuildTrack, BuilderResult, PullRequestState, Sha,
    sha_cmp,
};

/// Applies one state comment found in the pull request's history.
pub fn apply_state_comment(
    state: &mut PullRequestState,
    comment: &StateComment,
    now: DateTime<Utc>,
) -> ChangeResult {
    let changed = match comment {
        StateComment::Approved { sha, approver, .. } => approve(state, sha, approver),
        StateComment::ApprovalIgnoredWip { .. } => false,
        StateComment::Delegated { delegate, .. } => {
            let changed = state.delegate != *delegate;
            state.delegate = delegate.clone();
            changed
        }
        StateComment::BuildStarted {
            head_sha,
            merge_sha,
            started_at,
        } => started(state, BuildTrack::Build, head_sha, merge_sha, started_at.unwrap_or(now)),
        StateComment::TryBuildStarted {
            head_sha,
            merge_sha,
            started_at,
        } => started(state, BuildTrack::Try, head_sha, merge_sha, started_at.unwrap_or(now)),
        StateComment::BuildCompleted {
            builders,
            merge_sha,
            ended_at,
            ..
        } => completed(state, BuildTrack::Build, builders, merge_sha, ended_at.unwrap_or(now)),
        StateComment::TryBuildCompleted {
            builders,
            merge_sha,
            ended_at,
        } => completed(state, BuildTrack::Try, builders, merge_sha, ended_at.unwrap_or(now)),
        StateComment::BuildFailed {
            builder_url,
            builder_name,
            merge_sha,
            ended_at,
        } => failed(
            state,
            BuildTrack::Build,
            builder_name,
            builder_url,
            merge_sha.as_ref(),
            ended_at.unwrap_or(now),
        ),
        StateComment::TryBuildFailed {
            builder_url,
            builder_name,
            merge_sha,
            ended_at,
        } => failed(
            state,
            BuildTrack::Try,
            builder_name,
            builder_url,
            merge_sha.as_ref(),
            ended_at.unwrap_or(now),
        ),
        StateComment::TimedOut { merge_sha, ended_at } => {
            timed_out(state, merge_sha.as_ref(), ended_at.unwrap_or(now))
        }
    };

    debug!(pr = %state.number, kind = comment.kind(), changed, "Replayed state comment");
    if changed {
        ChangeResult::changed()
    } else {
        ChangeResult::unchanged()
    }
}

fn approve(state: &mut PullRequestState, sha: &Sha, approver: &str) -> bool {
    if !sha_cmp(sha.as_str(), state.head_sha.as_str()) {
        return false;
    }
    let changed = state.approved_by != approver || state.is_try;
    state.approved_by = approver.to_string();
    state.is_try = false;
    changed
}

fn started(
    state: &mut PullRequestState,
    track: BuildTrack,
    head_sha: &Sha,
    merge_sha: &Sha,
    started_at: DateTime<Utc>,
) -> bool {
    // A build of an older head says nothing about the current one.
    if head_sha != &state.head_sha {
        return false;
    }
    if state
        .history(track)
        .iter()
        .any(|attempt| &attempt.merge_sha == merge_sha)
    {
        return false;
    }

    if let Some(previous) = state.pending_attempt_mut(track) {
        previous.close(AttemptState::Cancelled, started_at);
    }
    state
        .history_mut(track)
        .push(BuildAttempt::start(head_sha.clone(), merge_sha.clone(), started_at));
    state.is_try = track == BuildTrack::Try;
    state.set_track_state(track, BuildState::Pending);
    state.merge_sha = Some(merge_sha.clone());
    true
}

/// The pending attempt of `track` building `merge_sha`, if any.
fn pending_for<'a>(
    state: &'a mut PullRequestState,
    track: BuildTrack,
    merge_sha: Option<&Sha>,
) -> Option<&'a mut BuildAttempt> {
    state
        .pending_attempt_mut(track)
        .filter(|attempt| merge_sha.is_none_or(|sha| &attempt.merge_sha == sha))
}

fn completed(
    state: &mut PullRequestState,
    track: BuildTrack,
    builders: &BTreeMap<String, String>,
    merge_sha: &Sha,
    ended_at: DateTime<Utc>,
) -> bool {
    let Some(attempt) = pending_for(state, track, Some(merge_sha)) else {
        return false;
    };
    for (name, url) in builders {
        attempt.builder_results.insert(
            name.clone(),
            BuilderResult {
                success: true,
                url: Some(url.clone()).filter(|u| !u.is_empty()),
                run_id: None,
            },
        );
    }
    attempt.close(AttemptState::Success, ended_at);
    state.set_track_state(track, BuildState::Success);
    true
}

fn failed(
    state: &mut PullRequestState,
    track: BuildTrack,
    builder_name: &str,
    builder_url: &str,
    merge_sha: Option<&Sha>,
    ended_at: DateTime<Utc>,
) -> bool {
    let Some(attempt) = pending_for(state, track, merge_sha) else {
        return false;
    };
    attempt.builder_results.insert(
        builder_name.to_string(),
        BuilderResult {
            success: false,
            url: Some(builder_url.to_string()).filter(|u| !u.is_empty()),
            run_id: None,
        },
    );
    attempt.close(AttemptState::Failure, ended_at);
    state.set_track_state(track, BuildState::Failure);
    true
}

fn timed_out(state: &mut PullRequestState, merge_sha: Option<&Sha>, ended_at: DateTime<Utc>) -> bool {
    let track = state.active_track();
    let Some(attempt) = pending_for(state, track, merge_sha) else {
        return false;
    };
    attempt.close(AttemptState::TimedOut, ended_at);
    state.set_track_state(track, BuildState::Failure);
    state.merge_sha = None;
    true
}
