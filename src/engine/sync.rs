//! Startup resynchronization.
//!
//! Persisted state may be stale after downtime: pull requests were pushed
//! to, closed or commented on while nobody listened. Each open pull request
//! is therefore checked against the hosting platform. A stored state whose
//! head still matches is kept and catches up on comments after its cursor;
//! anything else is rebuilt from scratch by replaying the full comment
//! history without realtime side effects.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::comments::messages::PendingContext;
use crate::effects::{
    ChangeResult, CommentData, CommitState, GitHubEffect, GitHubInterpreter, GitHubResponse,
    PullData,
};
use crate::persistence::StoreError;
use crate::state::{Event, EventContext, IncomingComment, STATUS_CONTEXT, process_event};
use crate::types::{BuildState, PrNumber, PullRequestState, RepositoryRecord};
use crate::worker::MergeabilityJob;

use super::{Engine, InternalEvent, RepoRuntime, Work};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{operation} failed: {message}")]
    Hosting {
        operation: &'static str,
        message: String,
    },
}

/// A pull request rebuilt from the hosting platform, with what its replay
/// asked for.
pub(crate) struct Restored {
    pub state: PullRequestState,
    pub work: Vec<Work>,
}

/// A fresh state carrying the pull request's current metadata.
pub(crate) fn state_from_pull(pull: &PullData) -> PullRequestState {
    let mut state = PullRequestState::new(pull.number, pull.head_sha.clone());
    refresh_metadata(&mut state, pull);
    state.base_ref = pull.base_ref.clone();
    state.mergeable = pull.mergeable;
    state.github_state = pull.state;
    state
}

/// Copies fields the bot does not derive anything from.
fn refresh_metadata(state: &mut PullRequestState, pull: &PullData) {
    state.title = pull.title.clone();
    state.body = pull.body.clone();
    state.head_ref = pull.head_ref.clone();
    state.assignee = pull.assignee.clone().unwrap_or_default();
    state.author = pull.author.clone();
}

/// The build state implied by the bot's own commit status.
///
/// A pending status with no build on record belongs to a build the bot no
/// longer knows about, so it counts as nothing.
fn status_from_commit(state: CommitState) -> BuildState {
    match state {
        CommitState::Success => BuildState::Success,
        CommitState::Failure => BuildState::Failure,
        CommitState::Error => BuildState::Error,
        CommitState::Pending => BuildState::None,
    }
}

impl<I> Engine<I>
where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    /// Resynchronizes every repository. A repository that fails is logged
    /// and left empty; the others still come up.
    pub async fn sync(&self) {
        for (label, runtime) in &self.repos {
            match self.sync_repository(runtime).await {
                Ok(count) => info!(repo = %label, pulls = count, "Repository synchronized"),
                Err(e) => error!(repo = %label, error = %e, "Failed to synchronize repository"),
            }
        }
    }

    async fn sync_repository(&self, runtime: &RepoRuntime<I>) -> Result<usize, SyncError> {
        let label = &runtime.label;
        // Replayed approvals are authorized against these.
        if let Some(repo) = self.config.repos.get(label) {
            runtime
                .permissions
                .refresh(repo, runtime.github.as_ref(), self.hooks.http())
                .await;
        }

        let repository = match self.store.load_repository(label)? {
            Some(record) => {
                runtime.state.lock().await.repository = record.clone();
                record
            }
            None => runtime.state.lock().await.repository.clone(),
        };
        let mut stored = self.store.load_pulls(label)?;
        debug!(repo = %label, stored = stored.len(), "Loaded stored pull requests");

        let open = match hosting(runtime, "list open pull requests", GitHubEffect::ListOpenPulls).await? {
            GitHubResponse::PullList(pulls) => pulls,
            other => return Err(unexpected("list open pull requests", other)),
        };

        let mut pulls = BTreeMap::new();
        let mut work = VecDeque::new();
        for pull in &open {
            let restored = match self
                .restore(runtime, &repository, pull, stored.remove(&pull.number))
                .await
            {
                Ok(restored) => restored,
                Err(e) => {
                    warn!(repo = %label, pr = %pull.number, error = %e, "Failed to restore pull request");
                    continue;
                }
            };
            work.extend(restored.work);
            pulls.insert(pull.number, restored.state);
        }

        for gone in stored.keys() {
            debug!(repo = %label, pr = %gone, "Forgetting pull request that is no longer open");
            if let Err(e) = self.store.delete_pull(label, *gone) {
                warn!(repo = %label, pr = %gone, error = %e, "Failed to delete stored pull request");
            }
        }

        for state in pulls.values() {
            self.save_pull(label, state);
            if state.mergeable.is_none() {
                self.enqueue_mergeability(MergeabilityJob {
                    repo: label.clone(),
                    pr: state.number,
                    cause: None,
                });
            }
            self.rearm_timeout(runtime, state);
        }
        let count = pulls.len();
        runtime.state.lock().await.pulls = pulls;

        self.drain(label, work).await;
        Ok(count)
    }

    /// Rebuilds one open pull request. `stored` is kept when its head
    /// still matches.
    pub(crate) async fn restore(
        &self,
        runtime: &RepoRuntime<I>,
        repository: &RepositoryRecord,
        pull: &PullData,
        stored: Option<PullRequestState>,
    ) -> Result<Restored, SyncError> {
        let mut work = Vec::new();
        let (mut state, after) = match stored {
            Some(mut state) if state.head_sha == pull.head_sha => {
                refresh_metadata(&mut state, pull);
                if state.base_ref != pull.base_ref {
                    work.push(Work::Event {
                        pr: pull.number,
                        event: Event::BaseRefChanged {
                            base_ref: pull.base_ref.clone(),
                        },
                        realtime: true,
                    });
                }
                let after = state
                    .last_event_cursor
                    .as_deref()
                    .and_then(|c| c.parse::<u64>().ok());
                (state, after)
            }
            stored => {
                if stored.is_some() {
                    debug!(repo = %runtime.label, pr = %pull.number, "Head moved while away, rebuilding");
                }
                (state_from_pull(pull), None)
            }
        };
        let fresh = after.is_none();

        let op = "list comments";
        let comments = match hosting(runtime, op, GitHubEffect::ListComments { pr: pull.number }).await? {
            GitHubResponse::Comments(comments) => comments,
            other => return Err(unexpected(op, other)),
        };
        for result in self.replay(runtime, repository, &mut state, &comments, after) {
            if !result.is_noop() {
                work.push(Work::Outcome {
                    pr: pull.number,
                    result,
                });
            }
        }

        if fresh && state.status() == BuildState::None {
            let op = "list statuses";
            let effect = GitHubEffect::ListStatuses {
                sha: state.head_sha.clone(),
            };
            match hosting(runtime, op, effect).await? {
                GitHubResponse::Statuses(statuses) => {
                    if let Some(status) = statuses.iter().find(|s| s.context == STATUS_CONTEXT) {
                        state.set_status(status_from_commit(status.state));
                    }
                }
                other => return Err(unexpected(op, other)),
            }
        }

        Ok(Restored { state, work })
    }

    /// Feeds comments after `after` through the state machine without
    /// realtime side effects.
    fn replay(
        &self,
        runtime: &RepoRuntime<I>,
        repository: &RepositoryRecord,
        state: &mut PullRequestState,
        comments: &[CommentData],
        after: Option<u64>,
    ) -> Vec<ChangeResult> {
        let Some(repo) = self.config.repos.get(&runtime.label) else {
            return Vec::new();
        };
        let queue_url = self.config.queue_url(&runtime.label);
        let ctx = EventContext {
            bot_name: &self.config.bot_name,
            repo,
            repository,
            max_priority: self.config.max_priority,
            hooks: &self.config.hooks,
            permissions: &runtime.permissions,
            pending: PendingContext::Idle,
            queue_url: &queue_url,
            now: Utc::now(),
            realtime: false,
        };

        comments
            .iter()
            .filter(|c| after.is_none_or(|after| c.id > after))
            .map(|c| {
                let event = Event::IssueComment(IncomingComment {
                    author: c.author.clone(),
                    body: c.body.clone(),
                    url: Some(c.html_url.clone()),
                    cursor: Some(c.id.to_string()),
                });
                process_event(state, &event, &ctx)
            })
            .collect()
    }

    /// Restarts the timer of a build that was running at shutdown.
    fn rearm_timeout(&self, runtime: &RepoRuntime<I>, state: &PullRequestState) {
        let (BuildState::Pending, Some(merge_sha)) = (state.status(), state.merge_sha.clone()) else {
            return;
        };
        let Some(repo) = self.config.repos.get(&runtime.label) else {
            return;
        };
        let internal = self.internal.clone();
        let (label, pr) = (runtime.label.clone(), state.number);
        self.timeouts.arm(label.clone(), pr, repo.timeout(), move || async move {
            let event = Event::TimedOut { merge_sha };
            if internal.send(InternalEvent { repo: label, pr, event }).is_err() {
                debug!(pr = %pr, "Engine is gone, dropping timeout");
            }
        });
    }
}

async fn hosting<I>(
    runtime: &RepoRuntime<I>,
    operation: &'static str,
    effect: GitHubEffect,
) -> Result<GitHubResponse, SyncError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    runtime
        .github
        .interpret(effect)
        .await
        .map_err(|e| SyncError::Hosting {
            operation,
            message: e.to_string(),
        })
}

fn unexpected(operation: &'static str, response: GitHubResponse) -> SyncError {
    SyncError::Hosting {
        operation,
        message: format!("unexpected response {:?}", response),
    }
}
