//! Build lifecycle transitions.
//!
//! `begin_*`, `merge_conflict` and `exempt` are the writes the scheduler is
//! allowed to make when it starts work. The rest react to CI results,
//! timeouts and mergeability checks.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::comments::{Comment, StateComment, messages};
use crate::config::RepoConfig;
use crate::effects::{ChangeResult, CommitState, Effect, MergeCause};
use crate::labels::LabelEvent;
use crate::types::{
    AttemptState, BuildAttempt, BuildState, BuildTrack, BuilderResult, PullRequestState, Sha,
};

/// Context of the commit status the bot maintains on pull request heads.
pub const STATUS_CONTEXT: &str = "homu";

fn set_status(result: &mut ChangeResult, sha: &Sha, state: CommitState, description: String) {
    set_status_with_url(result, sha, state, description, None);
}

fn set_status_with_url(
    result: &mut ChangeResult,
    sha: &Sha,
    state: CommitState,
    description: String,
    target_url: Option<String>,
) {
    result.effect(Effect::SetCommitStatus {
        sha: sha.clone(),
        state,
        description,
        target_url,
    });
}

/// Cancels whatever is pending on `track`. Returns true if anything was.
pub(crate) fn cancel_pending(
    state: &mut PullRequestState,
    track: BuildTrack,
    now: DateTime<Utc>,
    result: &mut ChangeResult,
) -> bool {
    let cancelled = state
        .pending_attempt_mut(track)
        .is_some_and(|attempt| attempt.close(AttemptState::Cancelled, now));
    if cancelled {
        result.effect(Effect::CancelTimeout);
        result.mark_changed(true);
    }
    cancelled
}

/// Records that a build of `merge_sha` has started on the active track.
pub fn begin_build(state: &mut PullRequestState, merge_sha: Sha, now: DateTime<Utc>) -> ChangeResult {
    let mut result = ChangeResult::changed();
    let track = state.active_track();
    cancel_pending(state, track, now, &mut result);

    let attempt = BuildAttempt::start(state.head_sha.clone(), merge_sha.clone(), now);
    state.history_mut(track).push(attempt);
    state.set_track_state(track, BuildState::Pending);
    state.merge_sha = Some(merge_sha.clone());

    let verb = match track {
        BuildTrack::Build => "Testing",
        BuildTrack::Try => "Trying",
    };
    set_status(
        &mut result,
        &state.head_sha,
        CommitState::Pending,
        format!("{} commit {} with merge {}...", verb, state.head_sha, merge_sha),
    );
    result.effect(Effect::ArmTimeout {
        merge_sha: merge_sha.clone(),
    });

    let head_sha = state.head_sha.clone();
    let started_at = Some(now);
    result.comment(match track {
        BuildTrack::Build => StateComment::BuildStarted {
            head_sha,
            merge_sha,
            started_at,
        },
        BuildTrack::Try => StateComment::TryBuildStarted {
            head_sha,
            merge_sha,
            started_at,
        },
    });
    if track == BuildTrack::Try {
        result.label(LabelEvent::Try);
    }
    result
}

/// Starts a new attempt on the current merge commit that keeps `reused`
/// results and waits for `rerun` builders only.
pub fn begin_rebuild(
    state: &mut PullRequestState,
    reused: BTreeMap<String, BuilderResult>,
    rerun: &[(String, String)],
    now: DateTime<Utc>,
) -> ChangeResult {
    let Some(merge_sha) = state.merge_sha.clone() else {
        return ChangeResult::unchanged();
    };
    let mut result = ChangeResult::changed();
    let track = state.active_track();
    cancel_pending(state, track, now, &mut result);

    let reused_links: Vec<(String, String)> = reused
        .iter()
        .map(|(name, res)| (name.clone(), res.url.clone().unwrap_or_default()))
        .collect();

    let mut attempt = BuildAttempt::start(state.head_sha.clone(), merge_sha.clone(), now);
    attempt.builder_results = reused;
    state.history_mut(track).push(attempt);
    state.set_track_state(track, BuildState::Pending);

    set_status(
        &mut result,
        &state.head_sha,
        CommitState::Pending,
        "Previous build results are reusable. Rebuilding...".to_string(),
    );
    result.effect(Effect::ArmTimeout { merge_sha });
    result.comment(Comment::plain(messages::rebuilding(&reused_links, rerun)));
    result
}

/// Applies one builder's report for `merge_sha`.
pub fn record_builder_result(
    state: &mut PullRequestState,
    repo: &RepoConfig,
    merge_sha: &Sha,
    builder: &str,
    outcome: BuilderResult,
    now: DateTime<Utc>,
) -> ChangeResult {
    let Some(track) = state.track_for_merge_sha(merge_sha) else {
        debug!(pr = %state.number, sha = %merge_sha, "Build result for a stale merge commit");
        return ChangeResult::unchanged();
    };
    let Some(attempt) = state
        .pending_attempt_mut(track)
        .filter(|attempt| &attempt.merge_sha == merge_sha)
    else {
        debug!(pr = %state.number, builder, "Build result with no pending attempt");
        return ChangeResult::unchanged();
    };

    let success = outcome.success;
    let url = outcome.url.clone().unwrap_or_default();
    attempt.builder_results.insert(builder.to_string(), outcome);

    let mut result = ChangeResult::changed();

    if !success {
        attempt.close(AttemptState::Failure, now);
        state.set_track_state(track, BuildState::Failure);
        result.effect(Effect::CancelTimeout);
        set_status_with_url(
            &mut result,
            &state.head_sha,
            CommitState::Failure,
            "Test failed".to_string(),
            Some(url.clone()).filter(|u| !u.is_empty()),
        );
        let builder_name = builder.to_string();
        let merge_sha = Some(merge_sha.clone());
        let ended_at = Some(now);
        match track {
            BuildTrack::Build => {
                result.comment(StateComment::BuildFailed {
                    builder_url: url,
                    builder_name,
                    merge_sha,
                    ended_at,
                });
                result.label(LabelEvent::Failed);
            }
            BuildTrack::Try => {
                result.comment(StateComment::TryBuildFailed {
                    builder_url: url,
                    builder_name,
                    merge_sha,
                    ended_at,
                });
                result.label(LabelEvent::TryFailed);
            }
        }
        return result;
    }

    let all_passed = repo.builders(track).iter().all(|spec| {
        attempt
            .builder_results
            .get(spec.name())
            .is_some_and(|res| res.success)
    });
    if !all_passed {
        return result;
    }

    let builders: BTreeMap<String, String> = attempt
        .builder_results
        .iter()
        .map(|(name, res)| (name.clone(), res.url.clone().unwrap_or_default()))
        .collect();
    attempt.close(AttemptState::Success, now);
    state.set_track_state(track, BuildState::Success);
    result.effect(Effect::CancelTimeout);
    set_status_with_url(
        &mut result,
        &state.head_sha,
        CommitState::Success,
        "Test successful".to_string(),
        Some(url).filter(|u| !u.is_empty()),
    );

    match track {
        BuildTrack::Build if state.is_approved() => {
            result.comment(StateComment::BuildCompleted {
                approved_by: state.approved_by.clone(),
                base_ref: state.base_ref.clone(),
                builders,
                merge_sha: merge_sha.clone(),
                ended_at: Some(now),
            });
            result.label(LabelEvent::Succeed);
            result.effect(Effect::FastForward {
                base_ref: state.base_ref.clone(),
                merge_sha: merge_sha.clone(),
            });
        }
        BuildTrack::Build => {
            debug!(pr = %state.number, "Build passed after approval was withdrawn; not landing");
        }
        BuildTrack::Try => {
            result.comment(StateComment::TryBuildCompleted {
                builders,
                merge_sha: merge_sha.clone(),
                ended_at: Some(now),
            });
            result.label(LabelEvent::TrySucceed);
        }
    }
    result
}

/// The build of `merge_sha` ran out of time.
pub fn time_out(state: &mut PullRequestState, merge_sha: &Sha, now: DateTime<Utc>) -> ChangeResult {
    let Some(track) = state.track_for_merge_sha(merge_sha) else {
        return ChangeResult::unchanged();
    };
    let closed = state
        .pending_attempt_mut(track)
        .filter(|attempt| &attempt.merge_sha == merge_sha)
        .is_some_and(|attempt| attempt.close(AttemptState::TimedOut, now));
    if !closed {
        return ChangeResult::unchanged();
    }

    state.set_track_state(track, BuildState::Failure);
    state.merge_sha = None;

    let mut result = ChangeResult::changed();
    set_status(
        &mut result,
        &state.head_sha,
        CommitState::Failure,
        "Test timed out".to_string(),
    );
    result.comment(StateComment::TimedOut {
        merge_sha: Some(merge_sha.clone()),
        ended_at: Some(now),
    });
    result.label(LabelEvent::TimedOut);
    result
}

/// Creating the merge commit failed because of conflicts.
pub fn merge_conflict(state: &mut PullRequestState) -> ChangeResult {
    let mut result = ChangeResult::changed();
    state.set_status(BuildState::Error);
    set_status(
        &mut result,
        &state.head_sha,
        CommitState::Error,
        "Merge conflict".to_string(),
    );
    result.comment(Comment::plain(messages::merge_conflict(
        &state.base_ref,
        &state.head_ref,
    )));
    result.label(LabelEvent::Conflict);
    result
}

/// Testing was skipped because `merge_sha` was already landed on the base
/// branch with passing statuses.
pub fn exempt(state: &mut PullRequestState, merge_sha: Sha, reason: &str) -> ChangeResult {
    let mut result = ChangeResult::changed();
    state.set_status(BuildState::Success);
    state.merge_sha = Some(merge_sha);
    set_status(
        &mut result,
        &state.head_sha,
        CommitState::Success,
        "Test exempted".to_string(),
    );
    result.comment(Comment::plain(messages::exempted(reason)));
    result.label(LabelEvent::Exempted);
    result
}

/// A successful build could not be pushed to the base branch.
pub fn fast_forward_failed(state: &mut PullRequestState, error: &str) -> ChangeResult {
    let mut result = ChangeResult::changed();
    state.set_track_state(BuildTrack::Build, BuildState::Error);
    set_status(
        &mut result,
        &state.head_sha,
        CommitState::Error,
        format!("Test was successful, but fast-forwarding failed: {}", error),
    );
    result.comment(Comment::plain(messages::fast_forward_failed(error)));
    result
}

/// Which pull request or commit most likely broke mergeability.
pub fn blame(cause: &MergeCause) -> String {
    static PULL_REF: OnceLock<Regex> = OnceLock::new();
    let re = PULL_REF.get_or_init(|| Regex::new(r"(?i)merge (?:of|pull request) #([0-9]+)").unwrap());

    match re.captures(&cause.title).and_then(|c| c.get(1)) {
        Some(number) => format!("#{}", number.as_str()),
        None => cause.sha.to_string(),
    }
}

/// Stores a resolved mergeability flag, complaining if the pull request
/// just stopped being mergeable.
pub fn set_mergeable(
    state: &mut PullRequestState,
    mergeable: Option<bool>,
    cause: Option<&MergeCause>,
) -> ChangeResult {
    let mut result = ChangeResult::unchanged();
    if state.mergeable == Some(true) && mergeable == Some(false) {
        let blame = cause.map(blame).unwrap_or_default();
        result.comment(Comment::plain(messages::unmergeable(&blame)));
        result.label(LabelEvent::Conflict);
    }
    result.mark_changed(state.mergeable != mergeable);
    state.mergeable = mergeable;
    result
}
