//! The imperative shell around the pure core.
//!
//! The engine owns every repository's in-memory state behind a per-repository
//! lock. Incoming events are applied under that lock, persisted, and the
//! resulting [`ChangeResult`] is carried out after the lock is released.
//! Follow-up work produced while carrying out a result (a failed
//! fast-forward, a head that moved under a `retry`) is queued and drained in
//! the same call instead of recursing.
//!
//! # Concurrency
//!
//! - One `tokio::sync::Mutex` per repository guards its record and pulls.
//! - Hosting calls made by effects never run under the lock.
//! - Timers and the mergeability worker feed back through channels.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::effects::{ChangeResult, GitHubInterpreter};
use crate::persistence::StateStore;
use crate::scheduler::{self, RollupError, RollupReport};
use crate::state::{Event, EventContext, process_event};
use crate::types::{PrNumber, PullRequestState, RepoLabel, RepositoryRecord};
use crate::worker::{MergeabilityHost, MergeabilityJob, TimeoutRegistry};

pub mod dispatch;
pub mod effects;
pub mod hooks;
pub mod permissions;
pub mod sync;

pub use dispatch::DispatchOutcome;
pub use hooks::{HookClient, HookError, HookPayload};
pub use permissions::{PermissionCache, PermissionError};
pub use sync::SyncError;

/// Everything held in memory for one repository.
#[derive(Debug)]
pub struct RepoState {
    pub repository: RepositoryRecord,
    pub pulls: BTreeMap<PrNumber, PullRequestState>,
}

pub struct RepoRuntime<I> {
    pub label: RepoLabel,
    pub github: Arc<I>,
    pub permissions: PermissionCache,
    pub state: Mutex<RepoState>,
    /// Held for a whole scheduling pass; `state` is only held around it.
    scheduling: Mutex<()>,
}

/// An event the bot raises for itself, such as an expired test timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalEvent {
    pub repo: RepoLabel,
    pub pr: PrNumber,
    pub event: Event,
}

/// Receiving ends of the engine's feedback channels, handed to the tasks
/// that drain them.
pub struct EngineChannels {
    pub mergeability: mpsc::UnboundedReceiver<MergeabilityJob>,
    pub internal: mpsc::UnboundedReceiver<InternalEvent>,
}

/// Work left over after carrying out a result.
#[derive(Debug)]
pub(crate) enum Work {
    Event {
        pr: PrNumber,
        event: Event,
        realtime: bool,
    },
    Outcome {
        pr: PrNumber,
        result: ChangeResult,
    },
}

pub struct Engine<I> {
    config: Arc<Config>,
    repos: BTreeMap<RepoLabel, RepoRuntime<I>>,
    store: Arc<dyn StateStore>,
    timeouts: TimeoutRegistry,
    mergeability: mpsc::UnboundedSender<MergeabilityJob>,
    internal: mpsc::UnboundedSender<InternalEvent>,
    hooks: HookClient,
    changed: Arc<Notify>,
}

/// One row of a repository's queue listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub number: u64,
    pub status: &'static str,
    pub mergeable: Option<bool>,
    pub title: String,
    pub head_ref: String,
    pub assignee: String,
    pub approved_by: String,
    pub priority: i64,
    pub rollup: &'static str,
    pub is_try: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub label: String,
    pub treeclosed: i64,
    pub treeclosed_source: Option<String>,
    pub pulls: Vec<QueueEntry>,
}

impl QueueEntry {
    fn from_state(state: &PullRequestState) -> Self {
        QueueEntry {
            number: state.number.0,
            status: state.queue_status().as_str(),
            mergeable: state.mergeable,
            title: state.title.clone(),
            head_ref: state.head_ref.clone(),
            assignee: state.assignee.clone(),
            approved_by: state.approved_by.clone(),
            priority: state.priority,
            rollup: state.rollup.as_str(),
            is_try: state.is_try,
        }
    }
}

impl<I> Engine<I>
where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    /// Creates the engine with empty state for every configured repository
    /// that has an interpreter. Call [`Engine::sync`] before serving.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn StateStore>,
        hooks: HookClient,
        mut github: BTreeMap<RepoLabel, Arc<I>>,
    ) -> (Arc<Self>, EngineChannels) {
        let (mergeability, mergeability_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();

        let mut repos = BTreeMap::new();
        for (label, repo) in &config.repos {
            let Some(client) = github.remove(label) else {
                warn!(repo = %label, "No hosting client for repository, skipping");
                continue;
            };
            let runtime = RepoRuntime {
                label: label.clone(),
                github: client,
                permissions: PermissionCache::new(),
                state: Mutex::new(RepoState {
                    repository: RepositoryRecord::new(label.clone(), &repo.id()),
                    pulls: BTreeMap::new(),
                }),
                scheduling: Mutex::new(()),
            };
            repos.insert(label.clone(), runtime);
        }

        let engine = Engine {
            config,
            repos,
            store,
            timeouts: TimeoutRegistry::new(),
            mergeability,
            internal,
            hooks,
            changed: Arc::new(Notify::new()),
        };
        let channels = EngineChannels {
            mergeability: mergeability_rx,
            internal: internal_rx,
        };
        (Arc::new(engine), channels)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self, label: &RepoLabel) -> Option<&RepoRuntime<I>> {
        self.repos.get(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &RepoLabel> {
        self.repos.keys()
    }

    pub fn timeouts(&self) -> &TimeoutRegistry {
        &self.timeouts
    }

    /// Notified whenever state changed and the scheduler should look again.
    pub fn changed(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    /// Applies one event to one pull request and carries out the result.
    pub async fn apply(&self, label: &RepoLabel, pr: PrNumber, event: Event, realtime: bool) {
        self.drain(
            label,
            VecDeque::from([Work::Event {
                pr,
                event,
                realtime,
            }]),
        )
        .await;
    }

    pub(crate) async fn drain(&self, label: &RepoLabel, mut work: VecDeque<Work>) {
        let Some(runtime) = self.repos.get(label) else {
            warn!(repo = %label, "Event for an unknown repository");
            return;
        };

        let mut changed = false;
        while let Some(item) = work.pop_front() {
            let (pr, result) = match item {
                Work::Event {
                    pr,
                    event,
                    realtime,
                } => match self.process(runtime, pr, &event, realtime).await {
                    Some(result) => (pr, result),
                    None => continue,
                },
                Work::Outcome { pr, result } => (pr, result),
            };
            changed |= result.changed;
            work.extend(self.execute(runtime, pr, result).await);
        }

        if changed {
            self.changed.notify_one();
        }
    }

    /// Runs the state machine under the repository lock and persists the
    /// new state. `None` when the pull request is not tracked.
    async fn process(
        &self,
        runtime: &RepoRuntime<I>,
        pr: PrNumber,
        event: &Event,
        realtime: bool,
    ) -> Option<ChangeResult> {
        let repo = self.config.repos.get(&runtime.label)?;
        let queue_url = self.config.queue_url(&runtime.label);

        let mut guard = runtime.state.lock().await;
        let pending = scheduler::pending_context(&guard.pulls, pr);
        let RepoState { repository, pulls } = &mut *guard;
        let Some(pull) = pulls.get_mut(&pr) else {
            debug!(repo = %runtime.label, pr = %pr, event = event.name(), "Event for an untracked pull request");
            return None;
        };

        let ctx = EventContext {
            bot_name: &self.config.bot_name,
            repo,
            repository,
            max_priority: self.config.max_priority,
            hooks: &self.config.hooks,
            permissions: &runtime.permissions,
            pending,
            queue_url: &queue_url,
            now: Utc::now(),
            realtime,
        };
        let result = process_event(pull, event, &ctx);
        debug!(
            repo = %runtime.label,
            pr = %pr,
            event = event.name(),
            changed = result.changed,
            "Event processed"
        );
        if result.changed {
            self.save_pull(&runtime.label, pull);
        }
        Some(result)
    }

    /// One scheduling pass over every repository.
    ///
    /// The pass works on a copy of the repository's pull requests, so events
    /// keep flowing while it waits on the hosting API. A pull request that
    /// changed in the meantime keeps its newer state and the pass's outcome
    /// for it is dropped.
    pub async fn tick(&self) {
        for (label, runtime) in &self.repos {
            let Some(repo) = self.config.repos.get(label) else {
                continue;
            };
            let _pass = runtime.scheduling.lock().await;

            let (repository, before) = {
                let guard = runtime.state.lock().await;
                (guard.repository.clone(), guard.pulls.clone())
            };
            let mut after = before.clone();
            let report = scheduler::process_repository(
                runtime.github.as_ref(),
                repo,
                &repository,
                &mut after,
                Utc::now(),
            )
            .await;

            if let Some(e) = &report.error {
                error!(repo = %label, error = %e, "Scheduling pass failed");
            }

            let mut work = VecDeque::new();
            {
                let mut guard = runtime.state.lock().await;
                let mut stale = BTreeSet::new();
                for (number, updated) in &after {
                    let Some(original) = before.get(number).filter(|o| *o != updated) else {
                        continue;
                    };
                    match guard.pulls.get_mut(number) {
                        Some(current) if current == original => *current = updated.clone(),
                        _ => {
                            warn!(repo = %label, pr = %number, "Pull request changed during scheduling, dropping outcome");
                            stale.insert(*number);
                        }
                    }
                }
                for (number, result) in report.changes {
                    if stale.contains(&number) {
                        continue;
                    }
                    if let Some(pull) = guard.pulls.get(&number).filter(|_| result.changed) {
                        self.save_pull(label, pull);
                    }
                    if report.started == Some(number) {
                        info!(repo = %label, pr = %number, "Started build");
                    }
                    work.push_back(Work::Outcome { pr: number, result });
                }
            }
            self.drain(label, work).await;
        }
    }

    /// Merges the selected pull requests onto a fresh rollup branch and
    /// opens a pull request for it. `None` for an unknown repository.
    pub async fn rollup(
        &self,
        label: &RepoLabel,
        numbers: &[PrNumber],
    ) -> Option<Result<RollupReport, RollupError>> {
        let runtime = self.repos.get(label)?;
        let candidates = {
            let guard = runtime.state.lock().await;
            scheduler::select_candidates(&guard.pulls, numbers)
        };
        let result = match candidates {
            Ok(candidates) => {
                scheduler::create_rollup(runtime.github.as_ref(), &candidates, Utc::now()).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(repo = %label, error = %e, "Rollup not created");
        }
        Some(result)
    }

    /// The repository's open pull requests in queue order.
    pub async fn queue(&self, label: &RepoLabel) -> Option<QueueSnapshot> {
        let runtime = self.repos.get(label)?;
        let guard = runtime.state.lock().await;
        Some(QueueSnapshot {
            label: label.to_string(),
            treeclosed: guard.repository.treeclosed,
            treeclosed_source: guard.repository.treeclosed_source.clone(),
            pulls: scheduler::queue_order(guard.pulls.values())
                .into_iter()
                .map(QueueEntry::from_state)
                .collect(),
        })
    }

    /// Re-reads collaborator and team lists for every repository.
    pub async fn refresh_permissions(&self) {
        for (label, runtime) in &self.repos {
            if let Some(repo) = self.config.repos.get(label) {
                runtime
                    .permissions
                    .refresh(repo, runtime.github.as_ref(), self.hooks.http())
                    .await;
            }
        }
    }

    pub(crate) fn save_pull(&self, label: &RepoLabel, pull: &PullRequestState) {
        if let Err(e) = self.store.save_pull(label, pull) {
            error!(repo = %label, pr = %pull.number, error = %e, "Failed to persist pull request");
        }
    }

    pub(crate) fn save_repository(&self, record: &RepositoryRecord) {
        if let Err(e) = self.store.save_repository(record) {
            error!(repo = %record.label, error = %e, "Failed to persist repository");
        }
    }

    pub(crate) fn enqueue_mergeability(&self, job: MergeabilityJob) {
        if self.mergeability.send(job).is_err() {
            debug!("Mergeability worker is gone, dropping job");
        }
    }
}

impl<I> MergeabilityHost for Engine<I>
where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    type GitHub = I;

    async fn prepare(&self, job: &MergeabilityJob) -> Option<Arc<I>> {
        let runtime = self.repos.get(&job.repo)?;
        let guard = runtime.state.lock().await;
        let pull = guard.pulls.get(&job.pr)?;
        // A passed build is about to land; its mergeability no longer matters.
        if pull.status() == crate::types::BuildState::Success {
            return None;
        }
        Some(Arc::clone(&runtime.github))
    }

    async fn resolve(&self, job: MergeabilityJob, mergeable: Option<bool>) {
        let event = Event::MergeabilityResolved {
            mergeable,
            cause: job.cause,
        };
        self.apply(&job.repo, job.pr, event, true).await;
    }
}

/// Applies events raised by timers until `rx` closes or `shutdown` fires.
pub async fn run_internal<I>(
    engine: Arc<Engine<I>>,
    mut rx: mpsc::UnboundedReceiver<InternalEvent>,
    shutdown: CancellationToken,
) where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some(InternalEvent { repo, pr, event }) = next else {
            break;
        };
        engine.apply(&repo, pr, event, true).await;
    }
    debug!("Internal event loop stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::effects::{Effect, GitHubEffect, GitHubResponse};
    use crate::persistence::JsonFileStore;
    use crate::state::IncomingComment;
    use crate::test_utils::MockGitHub;
    use crate::types::{BuildState, Sha};
    use tempfile::TempDir;

    pub(crate) const CONFIG: &str = r#"
bot_name = "bors"

[repo.widgets]
owner = "acme"
name = "widgets"
reviewers = ["alice"]
try_users = ["bob"]
timeout_secs = 60
webhook_secret = "s3cret"

[repo.widgets.status.ci]
context = "ci/test"
"#;

    pub(crate) struct Harness {
        pub engine: Arc<Engine<MockGitHub>>,
        pub github: Arc<MockGitHub>,
        pub store: Arc<JsonFileStore>,
        pub channels: EngineChannels,
        pub label: RepoLabel,
        _dir: TempDir,
    }

    pub(crate) fn harness(github: MockGitHub) -> Harness {
        harness_with_config(CONFIG, github)
    }

    pub(crate) fn harness_with_config(config: &str, github: MockGitHub) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::from_toml_str(config).unwrap());
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let github = Arc::new(github);
        let label = RepoLabel::new("widgets");
        let (engine, channels) = Engine::new(
            config,
            store.clone(),
            HookClient::default(),
            BTreeMap::from([(label.clone(), Arc::clone(&github))]),
        );
        Harness {
            engine,
            github,
            store,
            channels,
            label,
            _dir: dir,
        }
    }

    pub(crate) fn open_pull(number: u64, head: &str) -> PullRequestState {
        let mut pull = PullRequestState::new(PrNumber(number), Sha::new(head));
        pull.title = "Add feature".to_string();
        pull.base_ref = "main".to_string();
        pull.head_ref = "contributor:feature".to_string();
        pull.author = "carol".to_string();
        pull.mergeable = Some(true);
        pull
    }

    impl Harness {
        pub(crate) async fn insert(&self, pull: PullRequestState) {
            let runtime = self.engine.runtime(&self.label).unwrap();
            runtime.state.lock().await.pulls.insert(pull.number, pull);
        }

        pub(crate) async fn pull(&self, number: u64) -> Option<PullRequestState> {
            let runtime = self.engine.runtime(&self.label).unwrap();
            runtime.state.lock().await.pulls.get(&PrNumber(number)).cloned()
        }
    }

    fn comment(author: &str, body: &str) -> Event {
        Event::IssueComment(IncomingComment {
            author: author.to_string(),
            body: body.to_string(),
            url: None,
            cursor: None,
        })
    }

    #[tokio::test]
    async fn approval_is_persisted_and_announced() {
        let h = harness(MockGitHub::permissive());
        h.insert(open_pull(7, &"a".repeat(40))).await;

        h.engine.apply(&h.label, PrNumber(7), comment("alice", "@bors r+"), true).await;

        let pull = h.pull(7).await.unwrap();
        assert_eq!(pull.approved_by, "alice");
        let stored = h.store.load_pulls(&h.label).unwrap();
        assert_eq!(stored[&PrNumber(7)].approved_by, "alice");
        assert!(h
            .github
            .calls()
            .iter()
            .any(|c| matches!(c, GitHubEffect::PostComment { pr, .. } if *pr == PrNumber(7))));
    }

    #[tokio::test]
    async fn unknown_pull_request_is_ignored() {
        let h = harness(MockGitHub::permissive());
        h.engine.apply(&h.label, PrNumber(99), comment("alice", "@bors r+"), true).await;
        assert!(h.github.calls().is_empty());
        assert!(h.store.load_pulls(&h.label).unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_lists_open_pulls_in_order() {
        let h = harness(MockGitHub::permissive());
        let mut low = open_pull(1, &"a".repeat(40));
        low.approved_by = "alice".to_string();
        let mut high = open_pull(2, &"b".repeat(40));
        high.approved_by = "alice".to_string();
        high.priority = 10;
        h.insert(low).await;
        h.insert(high).await;

        let snapshot = h.engine.queue(&h.label).await.unwrap();
        let numbers: Vec<u64> = snapshot.pulls.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![2, 1]);
        assert_eq!(snapshot.pulls[0].status, "approved");
        assert!(h.engine.queue(&RepoLabel::new("nope")).await.is_none());
    }

    #[tokio::test]
    async fn tick_starts_build_and_persists() {
        let merge = "c".repeat(40);
        let merge_for_mock = merge.clone();
        let github = MockGitHub::new(move |effect| {
            Ok(match effect {
                GitHubEffect::GetPull { pr } => {
                    GitHubResponse::Pull(crate::test_utils::pull_data(pr.0, &"a".repeat(40)))
                }
                GitHubEffect::GetBranchHead { .. } => GitHubResponse::BranchHead(Sha::new("d".repeat(40))),
                GitHubEffect::Merge { .. } => GitHubResponse::Merged {
                    sha: Sha::new(merge_for_mock.clone()),
                },
                GitHubEffect::CreateStatus { .. } => GitHubResponse::StatusCreated,
                GitHubEffect::PostComment { .. } => GitHubResponse::CommentPosted,
                GitHubEffect::GetLabels { .. } => GitHubResponse::Labels(Vec::new()),
                GitHubEffect::ListStatuses { .. } => GitHubResponse::Statuses(Vec::new()),
                _ => GitHubResponse::RefUpdated,
            })
        });
        let h = harness(github);
        let mut pull = open_pull(3, &"a".repeat(40));
        pull.approved_by = "alice".to_string();
        h.insert(pull).await;

        h.engine.tick().await;

        let pull = h.pull(3).await.unwrap();
        assert_eq!(pull.build_state, BuildState::Pending);
        assert_eq!(pull.merge_sha, Some(Sha::new(merge)));
        assert!(h.engine.timeouts().is_armed(&h.label, PrNumber(3)));
        let stored = h.store.load_pulls(&h.label).unwrap();
        assert_eq!(stored[&PrNumber(3)].build_state, BuildState::Pending);
        h.engine.timeouts().cancel_all();
    }

    type EngineCell = Arc<std::sync::OnceLock<Arc<Engine<MockGitHub>>>>;

    /// A hosting double that lets a build start and runs `during` against
    /// the engine while the test branch head is being read.
    fn scheduling_github(
        cell: EngineCell,
        during: impl Fn(&Engine<MockGitHub>) + Send + Sync + 'static,
    ) -> MockGitHub {
        MockGitHub::new(move |effect| {
            Ok(match effect {
                GitHubEffect::GetPull { pr } => {
                    GitHubResponse::Pull(crate::test_utils::pull_data(pr.0, &"a".repeat(40)))
                }
                GitHubEffect::GetBranchHead { .. } => {
                    if let Some(engine) = cell.get() {
                        during(engine);
                    }
                    GitHubResponse::BranchHead(Sha::new("d".repeat(40)))
                }
                GitHubEffect::Merge { .. } => GitHubResponse::Merged {
                    sha: Sha::new("c".repeat(40)),
                },
                GitHubEffect::CreateStatus { .. } => GitHubResponse::StatusCreated,
                GitHubEffect::PostComment { .. } => GitHubResponse::CommentPosted,
                GitHubEffect::GetLabels { .. } => GitHubResponse::Labels(Vec::new()),
                GitHubEffect::ListStatuses { .. } => GitHubResponse::Statuses(Vec::new()),
                _ => GitHubResponse::RefUpdated,
            })
        })
    }

    #[tokio::test]
    async fn scheduling_calls_run_without_the_repository_lock() {
        let cell = EngineCell::default();
        let free = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = Arc::clone(&free);
        let h = harness(scheduling_github(Arc::clone(&cell), move |engine| {
            let runtime = engine.runtime(&RepoLabel::new("widgets")).unwrap();
            seen.store(runtime.state.try_lock().is_ok(), std::sync::atomic::Ordering::SeqCst);
        }));
        assert!(cell.set(Arc::clone(&h.engine)).is_ok());
        let mut pull = open_pull(3, &"a".repeat(40));
        pull.approved_by = "alice".to_string();
        h.insert(pull).await;

        h.engine.tick().await;

        assert!(free.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(h.pull(3).await.unwrap().build_state, BuildState::Pending);
        h.engine.timeouts().cancel_all();
    }

    #[tokio::test]
    async fn change_during_scheduling_wins() {
        let cell = EngineCell::default();
        let h = harness(scheduling_github(Arc::clone(&cell), |engine| {
            let runtime = engine.runtime(&RepoLabel::new("widgets")).unwrap();
            if let Ok(mut guard) = runtime.state.try_lock() {
                if let Some(pull) = guard.pulls.get_mut(&PrNumber(3)) {
                    pull.approved_by.clear();
                }
            }
        }));
        assert!(cell.set(Arc::clone(&h.engine)).is_ok());
        let mut pull = open_pull(3, &"a".repeat(40));
        pull.approved_by = "alice".to_string();
        h.insert(pull).await;

        h.engine.tick().await;

        let pull = h.pull(3).await.unwrap();
        assert!(pull.approved_by.is_empty());
        assert_eq!(pull.build_state, BuildState::None);
        assert!(!h.engine.timeouts().is_armed(&h.label, PrNumber(3)));
        assert!(!h
            .github
            .calls()
            .iter()
            .any(|c| matches!(c, GitHubEffect::PostComment { .. })));
    }

    #[tokio::test]
    async fn rollup_uses_tracked_rollup_pulls() {
        let github = MockGitHub::new(|effect| {
            Ok(match effect {
                GitHubEffect::GetBranchHead { .. } => GitHubResponse::BranchHead(Sha::new("d".repeat(40))),
                GitHubEffect::Merge { .. } => GitHubResponse::Merged {
                    sha: Sha::new("e".repeat(40)),
                },
                GitHubEffect::CreatePull { .. } => GitHubResponse::PullCreated {
                    number: PrNumber(50),
                    html_url: "https://github.com/acme/widgets/pull/50".into(),
                },
                _ => GitHubResponse::RefUpdated,
            })
        });
        let h = harness(github);
        let mut rolled = open_pull(2, &"a".repeat(40));
        rolled.approved_by = "alice".to_string();
        rolled.rollup = crate::types::RollupMode::Always;
        h.insert(rolled).await;
        h.insert(open_pull(3, &"b".repeat(40))).await;

        let report = h.engine.rollup(&h.label, &[]).await.unwrap().unwrap();
        assert_eq!(report.pull, 50);
        assert_eq!(report.merged, vec![2]);

        assert!(matches!(
            h.engine.rollup(&h.label, &[PrNumber(3)]).await,
            Some(Err(RollupError::NoCandidates))
        ));
        assert!(h.engine.rollup(&RepoLabel::new("nope"), &[]).await.is_none());
    }

    #[tokio::test]
    async fn mergeability_host_skips_successful_builds() {
        let h = harness(MockGitHub::permissive());
        let mut pull = open_pull(4, &"a".repeat(40));
        pull.build_state = BuildState::Success;
        h.insert(pull).await;
        h.insert(open_pull(5, &"b".repeat(40))).await;

        let job = |pr| MergeabilityJob {
            repo: h.label.clone(),
            pr: PrNumber(pr),
            cause: None,
        };
        assert!(h.engine.prepare(&job(4)).await.is_none());
        assert!(h.engine.prepare(&job(5)).await.is_some());
        assert!(h.engine.prepare(&job(6)).await.is_none());

        h.engine.resolve(job(5), Some(false)).await;
        assert_eq!(h.pull(5).await.unwrap().mergeable, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_timeout_is_applied_through_internal_loop() {
        let Harness {
            engine,
            channels,
            label,
            ..
        } = harness(MockGitHub::permissive());
        let merge = Sha::new("c".repeat(40));
        let mut pull = open_pull(8, &"a".repeat(40));
        pull.build_state = BuildState::Pending;
        pull.merge_sha = Some(merge.clone());
        pull.build_history
            .push(crate::types::BuildAttempt::start(pull.head_sha.clone(), merge.clone(), Utc::now()));
        engine
            .runtime(&label)
            .unwrap()
            .state
            .lock()
            .await
            .pulls
            .insert(pull.number, pull);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_internal(Arc::clone(&engine), channels.internal, shutdown.clone()));

        let result = ChangeResult {
            effects: vec![Effect::ArmTimeout { merge_sha: merge }],
            ..ChangeResult::default()
        };
        engine
            .drain(&label, VecDeque::from([Work::Outcome { pr: PrNumber(8), result }]))
            .await;
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;

        let runtime = engine.runtime(&label).unwrap();
        let mut state = BuildState::Pending;
        for _ in 0..50 {
            state = runtime.state.lock().await.pulls[&PrNumber(8)].build_state;
            if state != BuildState::Pending {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(state, BuildState::Failure);
        shutdown.cancel();
        task.await.unwrap();
    }
}
