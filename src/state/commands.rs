//! Per-command transitions.

use tracing::{debug, info};

use crate::auth::{AuthLevel, authorize};
use crate::comments::{Comment, StateComment, messages};
use crate::commands::{Command, PingKind};
use crate::effects::{ChangeResult, CommitState, Effect, RetryRecord};
use crate::labels::LabelEvent;
use crate::types::{BuildState, BuildTrack, PullRequestState, TREE_OPEN, sha_cmp};

use super::builds::cancel_pending;
use super::events::IncomingComment;
use super::machine::EventContext;
use super::resync::apply_state_comment;

/// Title prefixes marking a pull request as not ready, matched
/// case-insensitively.
pub const WIP_KEYWORDS: [&str; 5] = ["WIP", "TODO", "[WIP]", "[TODO]", "[DO NOT MERGE]"];

/// The WIP keyword the title starts with, if any.
pub fn wip_keyword(title: &str) -> Option<&'static str> {
    let upper = title.to_uppercase();
    WIP_KEYWORDS
        .iter()
        .find(|keyword| upper.starts_with(*keyword))
        .copied()
}

/// Commands with live side effects that must not run again when history is
/// replayed.
fn realtime_only(command: &Command) -> bool {
    matches!(
        command,
        Command::Retry
            | Command::Try
            | Command::Untry
            | Command::Force
            | Command::Clean
            | Command::Ping { .. }
    )
}

/// Applies one parsed command written by `comment.author`.
pub fn process_command(
    state: &mut PullRequestState,
    command: &Command,
    comment: &IncomingComment,
    ctx: &EventContext<'_>,
) -> ChangeResult {
    if !ctx.realtime && realtime_only(command) {
        return ChangeResult::unchanged();
    }

    let actor = comment.author.as_str();
    let mut result = ChangeResult::unchanged();

    // Returns from `process_command` with the denial comment attached.
    macro_rules! require {
        ($level:expr) => {
            if let Err(e) = authorize(actor, ctx.repo, state, $level, ctx.bot_name, ctx.permissions) {
                info!(pr = %state.number, actor, error = %e, "Command refused");
                result.comment(Comment::plain(e.comment()));
                return result;
            }
        };
    }

    match command {
        Command::Approve { approver, sha } => {
            require!(AuthLevel::Reviewer);
            approve(state, approver, sha.as_deref(), actor, ctx, &mut result);
        }

        Command::Unapprove => {
            let is_author = !state.author.is_empty() && state.author.eq_ignore_ascii_case(actor);
            if !is_author {
                require!(AuthLevel::Reviewer);
            }
            result.mark_changed(state.is_approved());
            state.approved_by.clear();
            result.label(LabelEvent::Rejected);
        }

        Command::Prioritize { priority } => {
            require!(AuthLevel::Try);
            if *priority > ctx.max_priority {
                result.comment(Comment::plain(messages::priority_too_high(ctx.max_priority)));
            } else {
                result.mark_changed(state.priority != *priority);
                state.priority = *priority;
            }
        }

        Command::Delegate { to } => {
            require!(AuthLevel::Reviewer);
            delegate(state, to, actor, &mut result);
        }

        Command::DelegateAuthor => {
            require!(AuthLevel::Reviewer);
            let author = state.author.clone();
            if author.is_empty() {
                debug!(pr = %state.number, "Author unknown, cannot delegate to them");
            } else {
                delegate(state, &author, actor, &mut result);
            }
        }

        Command::Undelegate => {
            require!(AuthLevel::Try);
            result.mark_changed(!state.delegate.is_empty());
            state.delegate.clear();
        }

        Command::Retry => {
            require!(AuthLevel::Try);
            let track = state.active_track();
            cancel_pending(state, track, ctx.now, &mut result);
            state.set_status(BuildState::None);
            result.mark_changed(true);
            result.label(if state.is_try {
                LabelEvent::Try
            } else {
                LabelEvent::Approved
            });
            result.effect(Effect::RecordRetry(RetryRecord {
                number: state.number.0,
                actor: actor.to_string(),
                at: ctx.now,
                source: comment.url.clone(),
                body: comment.body.clone(),
            }));
        }

        Command::Try => {
            require!(AuthLevel::Try);
            if state.is_approved() && !state.is_try && state.build_state == BuildState::Pending {
                result.comment(Comment::plain(messages::try_while_approved()));
                return result;
            }
            cancel_pending(state, BuildTrack::Try, ctx.now, &mut result);
            state.is_try = true;
            state.try_state = BuildState::None;
            state.merge_sha = None;
            result.mark_changed(true);
            result.label(LabelEvent::Try);
        }

        Command::Untry => {
            require!(AuthLevel::Try);
            result.mark_changed(state.is_try || state.merge_sha.is_some());
            state.is_try = false;
            state.merge_sha = None;
        }

        Command::Rollup { mode } => {
            require!(AuthLevel::Try);
            result.mark_changed(state.rollup != *mode);
            state.rollup = *mode;
        }

        Command::Force => {
            require!(AuthLevel::Try);
            let track = state.active_track();
            if cancel_pending(state, track, ctx.now, &mut result) {
                state.set_status(BuildState::None);
                let description = messages::build_interrupted();
                result.effect(Effect::SetCommitStatus {
                    sha: state.head_sha.clone(),
                    state: CommitState::Error,
                    description: description.clone(),
                    target_url: None,
                });
                result.comment(Comment::plain(description));
                result.label(LabelEvent::Interrupted);
            }
        }

        Command::Clean => {
            require!(AuthLevel::Try);
            result.mark_changed(state.merge_sha.is_some());
            state.merge_sha = None;
        }

        Command::Ping { kind } => {
            let text = match kind {
                PingKind::Standard => messages::ping(),
                PingKind::Portal => messages::portal_ping(state.number),
            };
            result.comment(Comment::plain(text));
        }

        Command::TreeClosed { threshold } => {
            require!(AuthLevel::Reviewer);
            result.effect(Effect::UpdateTreeClosed {
                threshold: *threshold,
                source: comment.url.clone(),
            });
        }

        Command::TreeOpen => {
            require!(AuthLevel::Reviewer);
            result.effect(Effect::UpdateTreeClosed {
                threshold: TREE_OPEN,
                source: None,
            });
        }

        Command::Hook { name, extra } => {
            let Some(hook) = ctx.hooks.get(name) else {
                return result;
            };
            if hook.realtime && !ctx.realtime {
                return result;
            }
            require!(hook.access);
            result.effect(Effect::TriggerHook {
                name: name.clone(),
                extra: extra.clone(),
                body: comment.body.clone(),
            });
        }

        Command::Resync { comment: state_comment } => {
            if ctx.is_bot(actor) {
                result.absorb(apply_state_comment(state, state_comment, ctx.now));
            }
        }
    }

    result
}

fn delegate(state: &mut PullRequestState, to: &str, actor: &str, result: &mut ChangeResult) {
    result.mark_changed(state.delegate != to);
    state.delegate = to.to_string();
    result.comment(StateComment::Delegated {
        delegator: actor.to_string(),
        delegate: to.to_string(),
    });
}

fn approve(
    state: &mut PullRequestState,
    approver: &str,
    pinned: Option<&str>,
    actor: &str,
    ctx: &EventContext<'_>,
    result: &mut ChangeResult,
) {
    if approver.eq_ignore_ascii_case("me") || approver.is_empty() {
        return;
    }

    if let Some(keyword) = wip_keyword(&state.title) {
        result.comment(StateComment::ApprovalIgnoredWip {
            sha: state.head_sha.clone(),
            wip_keyword: keyword.to_string(),
        });
        return;
    }

    if state.head_sha.is_null() {
        result.comment(Comment::plain(messages::invalid_head_sha(&state.head_sha)));
        result.effect(Effect::RefreshHead);
        return;
    }

    let from_bot = ctx.is_bot(actor);
    if state.is_approved() && !from_bot {
        let previously_failed = matches!(state.status(), BuildState::Failure | BuildState::Error);
        result.comment(Comment::plain(messages::already_approved(
            previously_failed,
            ctx.pending,
        )));
        return;
    }

    let pinned = pinned.unwrap_or(state.head_sha.as_str());
    if !sha_cmp(pinned, state.head_sha.as_str()) {
        if !from_bot {
            result.comment(Comment::plain(messages::invalid_sha(pinned, &state.head_sha)));
        }
        return;
    }

    let track = state.active_track();
    cancel_pending(state, track, ctx.now, result);
    result.mark_changed(state.approved_by != approver || state.is_try || state.status() != BuildState::None);
    state.approved_by = approver.to_string();
    state.is_try = false;
    state.set_status(BuildState::None);

    if !from_bot {
        result.comment(StateComment::Approved {
            sha: state.head_sha.clone(),
            approver: approver.to_string(),
            queue: ctx.queue_url.to_string(),
        });
        if ctx.repository.holds_back(state.priority) {
            result.comment(Comment::plain(messages::tree_closed(ctx.repository.treeclosed)));
        }
        result.label(LabelEvent::Approved);
    }
    debug!(pr = %state.number, approver, "Approved");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoPermissions;
    use crate::comments::messages::PendingContext;
    use crate::config::Config;
    use crate::state::builds::begin_build;
    use crate::types::{AttemptState, PrNumber, RepoLabel, RepositoryRecord, RollupMode, Sha};
    use chrono::Utc;

    const HEAD: &str = "abcdef0123456789abcdef0123456789abcdef01";
    const MERGE: &str = "1234567890123456789012345678901234567890";

    struct Fixture {
        config: Config,
        repository: RepositoryRecord,
    }

    impl Fixture {
        fn new() -> Self {
            let config = Config::from_toml_str(
                r#"
bot_name = "bors"
max_priority = 9001

[repo.r]
owner = "o"
name = "r"
reviewers = ["alice"]
try_users = ["bob"]

[repo.r.status.ci]
context = "ci"

[hooks.deploy]
endpoint = "https://hooks.example.com"
access = "reviewer"

[hooks.live]
endpoint = "https://hooks.example.com/live"
realtime = true
"#,
            )
            .unwrap();
            let id = config.repos[&RepoLabel::new("r")].id();
            Fixture {
                config,
                repository: RepositoryRecord::new(RepoLabel::new("r"), &id),
            }
        }

        fn ctx(&self) -> EventContext<'_> {
            EventContext {
                bot_name: "bors",
                repo: &self.config.repos[&RepoLabel::new("r")],
                repository: &self.repository,
                max_priority: self.config.max_priority,
                hooks: &self.config.hooks,
                permissions: &NoPermissions,
                pending: PendingContext::Idle,
                queue_url: "",
                now: Utc::now(),
                realtime: true,
            }
        }
    }

    fn pr() -> PullRequestState {
        let mut state = PullRequestState::new(PrNumber(1), Sha::new(HEAD));
        state.title = "Add feature".into();
        state.author = "carol".into();
        state
    }

    fn from(author: &str) -> IncomingComment {
        IncomingComment {
            author: author.into(),
            body: String::new(),
            url: Some("https://github.com/o/r/pull/1#issuecomment-1".into()),
            cursor: None,
        }
    }

    fn approve_cmd(approver: &str, sha: Option<&str>) -> Command {
        Command::Approve {
            approver: approver.into(),
            sha: sha.map(str::to_string),
        }
    }

    fn rendered(result: &ChangeResult) -> Vec<String> {
        result.comments.iter().map(|c| c.render("bors")).collect()
    }

    #[test]
    fn reviewer_approves_current_head() {
        let fx = Fixture::new();
        let mut state = pr();
        let result = process_command(&mut state, &approve_cmd("alice", None), &from("alice"), &fx.ctx());
        assert!(result.changed);
        assert_eq!(state.approved_by, "alice");
        assert_eq!(result.label_events, vec![LabelEvent::Approved]);
        assert!(rendered(&result)[0].starts_with(":pushpin: Commit abcdef0 has been approved by `alice`"));
    }

    #[test]
    fn wip_title_blocks_approval() {
        let fx = Fixture::new();
        let mut state = pr();
        state.title = "[WIP] add feature".into();
        let result = process_command(&mut state, &approve_cmd("alice", None), &from("alice"), &fx.ctx());
        assert_eq!(state.approved_by, "");
        assert!(rendered(&result)[0].contains("still in progress"));
    }

    #[test]
    fn wip_matching_is_case_insensitive_prefix() {
        assert_eq!(wip_keyword("wip: thing"), Some("WIP"));
        assert_eq!(wip_keyword("[do not merge] x"), Some("[DO NOT MERGE]"));
        assert_eq!(wip_keyword("Fix WIP handling"), None);
    }

    #[test]
    fn second_approval_only_comments() {
        let fx = Fixture::new();
        let mut state = pr();
        state.approved_by = "alice".into();
        let result = process_command(&mut state, &approve_cmd("dave", None), &from("alice"), &fx.ctx());
        assert!(!result.changed);
        assert_eq!(state.approved_by, "alice");
        assert!(rendered(&result)[0].starts_with(":bulb: This pull request was already approved"));
    }

    #[test]
    fn mismatched_pinned_sha_is_rejected() {
        let fx = Fixture::new();
        let mut state = pr();
        let result =
            process_command(&mut state, &approve_cmd("alice", Some("ffff")), &from("alice"), &fx.ctx());
        assert_eq!(state.approved_by, "");
        assert!(rendered(&result)[0].starts_with(":scream_cat:"));
    }

    #[test]
    fn short_pinned_prefix_approves() {
        let fx = Fixture::new();
        let mut state = pr();
        process_command(&mut state, &approve_cmd("alice", Some("abcd")), &from("alice"), &fx.ctx());
        assert_eq!(state.approved_by, "alice");
    }

    #[test]
    fn null_head_asks_for_refresh() {
        let fx = Fixture::new();
        let mut state = PullRequestState::new(PrNumber(1), Sha::new("0".repeat(40)));
        let result = process_command(&mut state, &approve_cmd("alice", None), &from("alice"), &fx.ctx());
        assert_eq!(state.approved_by, "");
        assert_eq!(result.effects, vec![Effect::RefreshHead]);
    }

    #[test]
    fn bot_approval_is_silent() {
        let fx = Fixture::new();
        let mut state = pr();
        let result = process_command(&mut state, &approve_cmd("alice", Some(HEAD)), &from("bors"), &fx.ctx());
        assert_eq!(state.approved_by, "alice");
        assert!(result.comments.is_empty());
    }

    #[test]
    fn outsiders_are_refused() {
        let fx = Fixture::new();
        let mut state = pr();
        let result = process_command(&mut state, &approve_cmd("eve", None), &from("eve"), &fx.ctx());
        assert_eq!(state.approved_by, "");
        assert_eq!(
            rendered(&result),
            vec!["@eve: :key: Insufficient privileges: Not in reviewers".to_string()]
        );
    }

    #[test]
    fn author_may_unapprove() {
        let fx = Fixture::new();
        let mut state = pr();
        state.approved_by = "alice".into();
        let result = process_command(&mut state, &Command::Unapprove, &from("carol"), &fx.ctx());
        assert!(result.changed);
        assert_eq!(state.approved_by, "");
        assert_eq!(result.label_events, vec![LabelEvent::Rejected]);
    }

    #[test]
    fn strangers_may_not_unapprove() {
        let fx = Fixture::new();
        let mut state = pr();
        state.approved_by = "alice".into();
        process_command(&mut state, &Command::Unapprove, &from("eve"), &fx.ctx());
        assert_eq!(state.approved_by, "alice");
    }

    #[test]
    fn priority_ceiling() {
        let fx = Fixture::new();
        let mut state = pr();
        let result = process_command(
            &mut state,
            &Command::Prioritize { priority: 9002 },
            &from("bob"),
            &fx.ctx(),
        );
        assert_eq!(state.priority, 0);
        assert_eq!(rendered(&result), vec![":stop_sign: Priority higher than 9001 is ignored.".to_string()]);

        process_command(&mut state, &Command::Prioritize { priority: 20 }, &from("bob"), &fx.ctx());
        assert_eq!(state.priority, 20);
    }

    #[test]
    fn delegation_grants_review() {
        let fx = Fixture::new();
        let mut state = pr();
        process_command(&mut state, &Command::DelegateAuthor, &from("alice"), &fx.ctx());
        assert_eq!(state.delegate, "carol");
        process_command(&mut state, &approve_cmd("carol", None), &from("carol"), &fx.ctx());
        assert_eq!(state.approved_by, "carol");
    }

    #[test]
    fn undelegate_needs_only_try() {
        let fx = Fixture::new();
        let mut state = pr();
        state.delegate = "carol".into();
        process_command(&mut state, &Command::Undelegate, &from("bob"), &fx.ctx());
        assert_eq!(state.delegate, "");
    }

    #[test]
    fn retry_cancels_pending_build() {
        let fx = Fixture::new();
        let mut state = pr();
        state.approved_by = "alice".into();
        begin_build(&mut state, Sha::new(MERGE), Utc::now());

        let result = process_command(&mut state, &Command::Retry, &from("bob"), &fx.ctx());
        assert_eq!(state.build_state, BuildState::None);
        assert_eq!(state.build_history[0].state, AttemptState::Cancelled);
        assert_eq!(result.label_events, vec![LabelEvent::Approved]);
        assert!(result.effects.contains(&Effect::CancelTimeout));
        assert!(result.effects.iter().any(|e| matches!(e, Effect::RecordRetry(r) if r.actor == "bob")));
    }

    #[test]
    fn retry_of_try_relabels_try() {
        let fx = Fixture::new();
        let mut state = pr();
        state.is_try = true;
        begin_build(&mut state, Sha::new(MERGE), Utc::now());
        let result = process_command(&mut state, &Command::Retry, &from("bob"), &fx.ctx());
        assert_eq!(state.try_state, BuildState::None);
        assert_eq!(state.try_history[0].state, AttemptState::Cancelled);
        assert_eq!(result.label_events, vec![LabelEvent::Try]);
    }

    #[test]
    fn try_refused_while_approved_build_runs() {
        let fx = Fixture::new();
        let mut state = pr();
        state.approved_by = "alice".into();
        begin_build(&mut state, Sha::new(MERGE), Utc::now());
        let result = process_command(&mut state, &Command::Try, &from("bob"), &fx.ctx());
        assert!(!state.is_try);
        assert!(!result.comments.is_empty());
    }

    #[test]
    fn try_and_untry() {
        let fx = Fixture::new();
        let mut state = pr();
        state.merge_sha = Some(Sha::new(MERGE));
        let result = process_command(&mut state, &Command::Try, &from("bob"), &fx.ctx());
        assert!(state.is_try);
        assert_eq!(state.merge_sha, None);
        assert_eq!(result.label_events, vec![LabelEvent::Try]);

        process_command(&mut state, &Command::Untry, &from("bob"), &fx.ctx());
        assert!(!state.is_try);
    }

    #[test]
    fn replay_skips_live_commands() {
        let fx = Fixture::new();
        let mut state = pr();
        let mut ctx = fx.ctx();
        ctx.realtime = false;
        let result = process_command(&mut state, &Command::Try, &from("bob"), &ctx);
        assert!(result.is_noop());
        assert!(!state.is_try);
    }

    #[test]
    fn rollup_modes() {
        let fx = Fixture::new();
        let mut state = pr();
        process_command(
            &mut state,
            &Command::Rollup {
                mode: RollupMode::Never,
            },
            &from("bob"),
            &fx.ctx(),
        );
        assert_eq!(state.rollup, RollupMode::Never);
    }

    #[test]
    fn force_interrupts_pending_build() {
        let fx = Fixture::new();
        let mut state = pr();
        state.approved_by = "alice".into();
        begin_build(&mut state, Sha::new(MERGE), Utc::now());
        let result = process_command(&mut state, &Command::Force, &from("bob"), &fx.ctx());
        assert_eq!(state.build_state, BuildState::None);
        assert_eq!(result.label_events, vec![LabelEvent::Interrupted]);
    }

    #[test]
    fn tree_closing_needs_reviewer() {
        let fx = Fixture::new();
        let mut state = pr();
        let refused = process_command(&mut state, &Command::TreeClosed { threshold: 5 }, &from("bob"), &fx.ctx());
        assert!(refused.effects.is_empty());

        let result = process_command(&mut state, &Command::TreeClosed { threshold: 5 }, &from("alice"), &fx.ctx());
        assert!(matches!(
            result.effects[..],
            [Effect::UpdateTreeClosed { threshold: 5, .. }]
        ));
    }

    #[test]
    fn hooks_respect_access_and_realtime() {
        let fx = Fixture::new();
        let mut state = pr();
        let deploy = Command::Hook {
            name: "deploy".into(),
            extra: Some("prod".into()),
        };
        assert!(process_command(&mut state, &deploy, &from("bob"), &fx.ctx()).effects.is_empty());
        let result = process_command(&mut state, &deploy, &from("alice"), &fx.ctx());
        assert!(matches!(&result.effects[..], [Effect::TriggerHook { name, .. }] if name == "deploy"));

        let live = Command::Hook {
            name: "live".into(),
            extra: None,
        };
        let mut ctx = fx.ctx();
        ctx.realtime = false;
        assert!(process_command(&mut state, &live, &from("alice"), &ctx).effects.is_empty());
    }

    #[test]
    fn resync_only_from_bot() {
        let fx = Fixture::new();
        let mut state = pr();
        let cmd = Command::Resync {
            comment: StateComment::Approved {
                sha: Sha::new(HEAD),
                approver: "alice".into(),
                queue: String::new(),
            },
        };
        process_command(&mut state, &cmd, &from("mallory"), &fx.ctx());
        assert_eq!(state.approved_by, "");
        process_command(&mut state, &cmd, &from("bors"), &fx.ctx());
        assert_eq!(state.approved_by, "alice");
    }

    #[test]
    fn approval_with_closed_tree_mentions_it() {
        let mut fx = Fixture::new();
        fx.repository.set_treeclosed(10, None);
        let mut state = pr();
        let result = process_command(&mut state, &approve_cmd("alice", None), &from("alice"), &fx.ctx());
        assert!(rendered(&result)[1].starts_with(":evergreen_tree:"));
    }
}
