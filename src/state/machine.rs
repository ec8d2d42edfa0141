//! Event processing for one pull request.
//!
//! [`process_event`] is the single entry point through which repository
//! events mutate a [`PullRequestState`]. It never performs I/O: everything
//! the caller should do afterwards is described by the returned
//! [`ChangeResult`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::auth::PermissionSource;
use crate::comments::messages::{self, PendingContext};
use crate::comments::Comment;
use crate::commands::{CommentSource, parse_commands};
use crate::config::{HookConfig, RepoConfig};
use crate::effects::{ChangeResult, Effect};
use crate::labels::LabelEvent;
use crate::types::{BuildState, BuildTrack, BuilderResult, GithubState, PullRequestState, RepositoryRecord, Sha};

use super::builds;
use super::commands::process_command;
use super::events::{Event, IncomingComment};

/// Everything the state machine may consult besides the state itself.
pub struct EventContext<'a> {
    pub bot_name: &'a str,
    pub repo: &'a RepoConfig,
    pub repository: &'a RepositoryRecord,
    pub max_priority: i64,
    pub hooks: &'a BTreeMap<String, HookConfig>,
    pub permissions: &'a dyn PermissionSource,
    /// Which pull request of the repository is currently being tested,
    /// relative to the one being processed.
    pub pending: PendingContext,
    /// Link to the repository's queue page; may be empty.
    pub queue_url: &'a str,
    pub now: DateTime<Utc>,
    /// False while replaying history.
    pub realtime: bool,
}

impl EventContext<'_> {
    pub fn hook_names(&self) -> Vec<String> {
        self.hooks.keys().cloned().collect()
    }

    pub fn is_bot(&self, login: &str) -> bool {
        login.eq_ignore_ascii_case(self.bot_name)
    }
}

/// Applies one event to a pull request.
pub fn process_event(
    state: &mut PullRequestState,
    event: &Event,
    ctx: &EventContext<'_>,
) -> ChangeResult {
    match event {
        Event::CommitPushed { sha } | Event::ForcePushed { sha } => head_advanced(state, sha, ctx),

        Event::BaseRefChanged { base_ref } => base_ref_changed(state, base_ref, ctx),

        Event::IssueComment(comment) => process_comment(state, comment, None, ctx),

        Event::ReviewComment { comment, commit_id } => {
            // Commands on outdated diffs refer to code that is gone.
            if commit_id != &state.head_sha {
                debug!(pr = %state.number, "Ignoring review comment on an outdated commit");
                return ChangeResult::unchanged();
            }
            process_comment(state, comment, Some(commit_id), ctx)
        }

        Event::TitleRenamed { title } => {
            let changed = state.title != *title;
            state.title = title.clone();
            changed_if(changed)
        }

        Event::DescriptionEdited { body } => {
            let changed = state.body != *body;
            state.body = body.clone();
            changed_if(changed)
        }

        Event::AssigneeChanged { assignee } => {
            let assignee = assignee.clone().unwrap_or_default();
            let changed = state.assignee != assignee;
            state.assignee = assignee;
            changed_if(changed)
        }

        Event::Merged => {
            let mut result = changed_if(state.github_state != GithubState::Merged);
            state.github_state = GithubState::Merged;
            result.effect(Effect::CancelTimeout);
            result
        }

        Event::Closed => {
            // Merged is terminal.
            if state.github_state != GithubState::Open {
                return ChangeResult::unchanged();
            }
            state.github_state = GithubState::Closed;
            let mut result = ChangeResult::changed();
            result.effect(Effect::CancelTimeout);
            result
        }

        Event::Reopened => {
            let changed = state.github_state != GithubState::Open;
            state.github_state = GithubState::Open;
            changed_if(changed)
        }

        Event::BuildResult {
            merge_sha,
            builder,
            success,
            url,
            run_id,
        } => builds::record_builder_result(
            state,
            ctx.repo,
            merge_sha,
            builder,
            BuilderResult {
                success: *success,
                url: url.clone(),
                run_id: *run_id,
            },
            ctx.now,
        ),

        Event::TimedOut { merge_sha } => builds::time_out(state, merge_sha, ctx.now),

        Event::MergeabilityInvalidated { cause } => {
            let mut result = changed_if(state.mergeable.is_some());
            state.mergeable = None;
            result.effect(Effect::RefreshMergeability {
                cause: cause.clone(),
            });
            result
        }

        Event::MergeabilityResolved { mergeable, cause } => {
            builds::set_mergeable(state, *mergeable, cause.as_ref())
        }

        Event::Ignored { kind } => {
            debug!(pr = %state.number, kind = %kind, "Ignoring event");
            ChangeResult::unchanged()
        }

        Event::Unknown { kind } => {
            debug!(pr = %state.number, kind = %kind, "Unknown event type, ignoring");
            ChangeResult::unchanged()
        }
    }
}

fn changed_if(changed: bool) -> ChangeResult {
    if changed {
        ChangeResult::changed()
    } else {
        ChangeResult::unchanged()
    }
}

/// A new head invalidates approval, in-flight builds and mergeability.
fn head_advanced(state: &mut PullRequestState, sha: &Sha, ctx: &EventContext<'_>) -> ChangeResult {
    if state.head_sha == *sha {
        return ChangeResult::unchanged();
    }

    let mut result = ChangeResult::changed();
    if state.status() != BuildState::None || state.is_approved() {
        result.label(LabelEvent::Pushed);
    }
    for track in [BuildTrack::Build, BuildTrack::Try] {
        builds::cancel_pending(state, track, ctx.now, &mut result);
    }

    state.head_sha = sha.clone();
    state.approved_by.clear();
    state.is_try = false;
    state.build_state = BuildState::None;
    state.try_state = BuildState::None;
    state.merge_sha = None;
    state.mergeable = None;
    result.effect(Effect::RefreshMergeability { cause: None });
    result
}

fn base_ref_changed(
    state: &mut PullRequestState,
    base_ref: &str,
    ctx: &EventContext<'_>,
) -> ChangeResult {
    if state.base_ref == base_ref {
        return ChangeResult::unchanged();
    }
    let mut result = ChangeResult::changed();
    state.base_ref = base_ref.to_string();
    state.mergeable = None;
    result.effect(Effect::RefreshMergeability { cause: None });

    if state.is_approved() || state.status() != BuildState::None {
        for track in [BuildTrack::Build, BuildTrack::Try] {
            builds::cancel_pending(state, track, ctx.now, &mut result);
        }
        state.approved_by.clear();
        state.build_state = BuildState::None;
        state.try_state = BuildState::None;
        result.label(LabelEvent::Pushed);
        result.comment(Comment::plain(messages::base_branch_changed(
            base_ref,
            ctx.bot_name,
        )));
    }
    result
}

fn process_comment(
    state: &mut PullRequestState,
    comment: &IncomingComment,
    pinned_sha: Option<&Sha>,
    ctx: &EventContext<'_>,
) -> ChangeResult {
    let source = CommentSource {
        actor: &comment.author,
        pinned_sha,
    };
    let commands = parse_commands(source, &comment.body, ctx.bot_name, &ctx.hook_names());

    let mut result = ChangeResult::unchanged();
    for command in &commands {
        result.absorb(process_command(state, command, comment, ctx));
    }

    if comment.cursor.is_some() && state.last_event_cursor != comment.cursor {
        state.last_event_cursor = comment.cursor.clone();
        result.mark_changed(true);
    }
    if !ctx.realtime {
        result.silence();
    }
    result
}
