//! Routing parsed webhooks to pull requests.

use std::collections::VecDeque;
use std::fmt::Display;

use tracing::{debug, info, warn};

use crate::effects::{CommitState, GitHubInterpreter};
use crate::state::Event;
use crate::types::{GithubState, PrNumber, RepoLabel, Sha};
use crate::webhooks::{
    CheckRunEvent, CommentEvent, GitHubEvent, PrAction, PullRequestEvent, PushEvent,
    ReviewCommentEvent, StatusEvent,
};
use crate::worker::MergeabilityJob;

use super::sync::state_from_pull;
use super::{Engine, RepoRuntime, Work};

/// What became of a webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    /// No tracked pull request or configured builder matched.
    Ignored,
}

impl<I> Engine<I>
where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    /// Handles one webhook for the repository configured as `label`.
    pub async fn dispatch(&self, label: &RepoLabel, event: GitHubEvent) -> DispatchOutcome {
        let Some(runtime) = self.repos.get(label) else {
            warn!(repo = %label, "Webhook for an unknown repository");
            return DispatchOutcome::Ignored;
        };
        debug!(repo = %label, kind = event.kind(), "Dispatching webhook");

        let work = match event {
            GitHubEvent::IssueComment(e) => self.comment_work(runtime, e).await,
            GitHubEvent::ReviewComment(e) => self.review_comment_work(runtime, e).await,
            GitHubEvent::PullRequest(e) => return self.pull_request(runtime, e).await,
            GitHubEvent::Push(e) => self.push_work(runtime, e).await,
            GitHubEvent::Status(e) => self.status_work(runtime, e).await,
            GitHubEvent::CheckRun(e) => self.check_run_work(runtime, e).await,
        };

        if work.is_empty() {
            return DispatchOutcome::Ignored;
        }
        self.drain(label, work).await;
        DispatchOutcome::Applied
    }

    async fn is_tracked(&self, runtime: &RepoRuntime<I>, pr: PrNumber) -> bool {
        runtime.state.lock().await.pulls.contains_key(&pr)
    }

    async fn comment_work(&self, runtime: &RepoRuntime<I>, e: CommentEvent) -> VecDeque<Work> {
        if !self.is_tracked(runtime, e.pr).await {
            debug!(repo = %runtime.label, pr = %e.pr, "Comment on an untracked pull request");
            return VecDeque::new();
        }
        let mut work = metadata_work(e.pr, e.title, e.body);
        work.push_back(realtime(e.pr, Event::IssueComment(e.comment)));
        work
    }

    async fn review_comment_work(&self, runtime: &RepoRuntime<I>, e: ReviewCommentEvent) -> VecDeque<Work> {
        if !self.is_tracked(runtime, e.pr).await {
            return VecDeque::new();
        }
        let mut work = metadata_work(e.pr, e.title, e.body);
        work.push_back(realtime(
            e.pr,
            Event::ReviewComment {
                comment: e.comment,
                commit_id: e.commit_id,
            },
        ));
        work
    }

    async fn pull_request(&self, runtime: &RepoRuntime<I>, e: PullRequestEvent) -> DispatchOutcome {
        let label = &runtime.label;
        let pr = e.pull.number;
        let work = match e.action {
            PrAction::Opened | PrAction::Reopened => return self.track(runtime, e).await,

            PrAction::Synchronize => VecDeque::from([realtime(
                pr,
                Event::CommitPushed {
                    sha: e.pull.head_sha,
                },
            )]),

            PrAction::Closed => {
                let event = if e.pull.state == GithubState::Merged {
                    Event::Merged
                } else {
                    Event::Closed
                };
                self.apply(label, pr, event, true).await;
                self.forget(runtime, pr).await;
                return DispatchOutcome::Applied;
            }

            PrAction::Edited => {
                let mut work = VecDeque::from([realtime(
                    pr,
                    Event::BaseRefChanged {
                        base_ref: e.pull.base_ref,
                    },
                )]);
                work.extend(metadata_work(pr, e.pull.title, e.pull.body));
                work
            }

            PrAction::Assigned | PrAction::Unassigned => VecDeque::from([realtime(
                pr,
                Event::AssigneeChanged {
                    assignee: e.pull.assignee,
                },
            )]),
        };

        if !self.is_tracked(runtime, pr).await {
            debug!(repo = %label, pr = %pr, action = ?e.action, "Pull request event for an untracked pull request");
            return DispatchOutcome::Ignored;
        }
        self.drain(label, work).await;
        DispatchOutcome::Applied
    }

    /// Starts tracking an opened pull request. A reopened one may have
    /// history, which is replayed.
    async fn track(&self, runtime: &RepoRuntime<I>, e: PullRequestEvent) -> DispatchOutcome {
        let label = &runtime.label;
        let pr = e.pull.number;
        let (state, work) = match e.action {
            PrAction::Reopened => {
                let repository = runtime.state.lock().await.repository.clone();
                match self.restore(runtime, &repository, &e.pull, None).await {
                    Ok(restored) => (restored.state, restored.work),
                    Err(e) => {
                        warn!(repo = %label, pr = %pr, error = %e, "Failed to restore reopened pull request");
                        return DispatchOutcome::Ignored;
                    }
                }
            }
            _ => (state_from_pull(&e.pull), Vec::new()),
        };
        info!(repo = %label, pr = %pr, action = ?e.action, "Tracking pull request");

        self.save_pull(label, &state);
        if state.mergeable.is_none() {
            self.enqueue_mergeability(MergeabilityJob {
                repo: label.clone(),
                pr,
                cause: None,
            });
        }
        runtime.state.lock().await.pulls.insert(pr, state);

        self.drain(label, work.into()).await;
        self.changed.notify_one();
        DispatchOutcome::Applied
    }

    async fn forget(&self, runtime: &RepoRuntime<I>, pr: PrNumber) {
        let removed = runtime.state.lock().await.pulls.remove(&pr);
        if removed.is_none() {
            return;
        }
        self.timeouts.cancel(&runtime.label, pr);
        if let Err(e) = self.store.delete_pull(&runtime.label, pr) {
            warn!(repo = %runtime.label, pr = %pr, error = %e, "Failed to delete stored pull request");
        }
        debug!(repo = %runtime.label, pr = %pr, "Stopped tracking pull request");
        self.changed.notify_one();
    }

    /// A push to a base branch may break every pull request targeting it.
    /// A push to a head branch moves that pull request's head.
    async fn push_work(&self, runtime: &RepoRuntime<I>, e: PushEvent) -> VecDeque<Work> {
        let guard = runtime.state.lock().await;
        let mut work = VecDeque::new();
        for state in guard.pulls.values() {
            if state.base_ref == e.branch {
                work.push_back(realtime(
                    state.number,
                    Event::MergeabilityInvalidated {
                        cause: e.head_commit.clone(),
                    },
                ));
            }
            if state.head_sha == e.before {
                work.push_back(realtime(
                    state.number,
                    Event::CommitPushed {
                        sha: e.after.clone(),
                    },
                ));
            }
        }
        work
    }

    async fn status_work(&self, runtime: &RepoRuntime<I>, e: StatusEvent) -> VecDeque<Work> {
        if e.state == CommitState::Pending {
            return VecDeque::new();
        }
        let Some(repo) = self.config.repos.get(&runtime.label) else {
            return VecDeque::new();
        };

        let guard = runtime.state.lock().await;
        let Some((state, track)) = guard
            .pulls
            .values()
            .find_map(|s| s.track_for_merge_sha(&e.sha).map(|track| (s, track)))
        else {
            return VecDeque::new();
        };
        // Reported on the base branch itself once the merge landed.
        if e.branches.iter().any(|b| *b == state.base_ref) {
            return VecDeque::new();
        }
        let Some(builder) = repo.status_builder_for(&e.context, track) else {
            debug!(repo = %runtime.label, context = %e.context, "Status from a context this build does not wait for");
            return VecDeque::new();
        };
        VecDeque::from([realtime(
            state.number,
            build_result(e.sha, builder, e.state == CommitState::Success, e.target_url, None),
        )])
    }

    async fn check_run_work(&self, runtime: &RepoRuntime<I>, e: CheckRunEvent) -> VecDeque<Work> {
        if !e.is_reportable() {
            return VecDeque::new();
        }
        let Some(repo) = self.config.repos.get(&runtime.label) else {
            return VecDeque::new();
        };

        let guard = runtime.state.lock().await;
        let Some((state, track)) = guard
            .pulls
            .values()
            .find_map(|s| s.track_for_merge_sha(&e.head_sha).map(|track| (s, track)))
        else {
            return VecDeque::new();
        };
        let Some(builder) = repo.checks_builder_for(&e.name, track) else {
            debug!(repo = %runtime.label, run = %e.name, "Check run from an unconfigured builder");
            return VecDeque::new();
        };
        let success = e.succeeded();
        VecDeque::from([realtime(
            state.number,
            build_result(e.head_sha, builder, success, e.details_url, Some(e.id)),
        )])
    }
}

fn realtime(pr: PrNumber, event: Event) -> Work {
    Work::Event {
        pr,
        event,
        realtime: true,
    }
}

/// Comment payloads carry the current title and body; keep them fresh.
fn metadata_work(pr: PrNumber, title: String, body: String) -> VecDeque<Work> {
    VecDeque::from([
        realtime(pr, Event::TitleRenamed { title }),
        realtime(pr, Event::DescriptionEdited { body }),
    ])
}

fn build_result(merge_sha: Sha, builder: String, success: bool, url: Option<String>, run_id: Option<u64>) -> Event {
    Event::BuildResult {
        merge_sha,
        builder,
        success,
        url,
        run_id,
    }
}
