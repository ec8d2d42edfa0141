//! The merge-queue scheduler.
//!
//! Once per tick and per repository, pull requests are scanned in queue
//! order and at most one build is started. The ordering and eligibility
//! rules are pure functions; [`process_repository`] performs the hosting
//! calls needed to actually start something.

use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::comments::messages::PendingContext;
use crate::config::RepoConfig;
use crate::effects::{ChangeResult, GitHubEffect, GitHubInterpreter, GitHubResponse};
use crate::types::{BuildState, PrNumber, PullRequestState, RepositoryRecord, RollupMode};

pub mod exemption;
pub mod rebuild;
pub mod rollup;
pub mod start;

pub use rollup::{RollupError, RollupReport, create_rollup, select_candidates};
pub use start::{StartOutcome, start_build, start_build_or_rebuild};

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The repository cannot be tested as configured.
    #[error("invalid configuration for {repo}: {reason}")]
    InvalidConfiguration { repo: String, reason: String },

    /// The hosting platform could not merge the pull request.
    #[error("merge conflict")]
    MergeConflict,

    #[error("{operation} failed: {message}")]
    Hosting {
        operation: &'static str,
        message: String,
    },
}

/// Executes one hosting call, flattening the interpreter's error.
pub(crate) async fn request<I>(
    github: &I,
    operation: &'static str,
    effect: GitHubEffect,
) -> Result<GitHubResponse, SchedulerError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    github
        .interpret(effect)
        .await
        .map_err(|e| SchedulerError::Hosting {
            operation,
            message: e.to_string(),
        })
}

pub(crate) fn unexpected(operation: &'static str, response: GitHubResponse) -> SchedulerError {
    SchedulerError::Hosting {
        operation,
        message: format!("unexpected response {:?}", response),
    }
}

/// Queue position of a pull request; lower sorts first.
///
/// `(status rank, unmergeable, unapproved, rollup=always, -priority, number)`
pub type SortKey = (u8, u8, u8, u8, i64, u64);

pub fn sort_key(state: &PullRequestState) -> SortKey {
    (
        state.queue_status().rank(),
        u8::from(state.mergeable == Some(false)),
        u8::from(!state.is_approved()),
        u8::from(state.rollup == RollupMode::Always),
        -state.priority,
        state.number.0,
    )
}

/// Open pull requests in queue order.
pub fn queue_order<'a>(
    pulls: impl IntoIterator<Item = &'a PullRequestState>,
) -> Vec<&'a PullRequestState> {
    let mut open: Vec<_> = pulls.into_iter().filter(|s| s.is_open()).collect();
    open.sort_by_key(|s| sort_key(s));
    open
}

/// What the first scan does with one pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstPass {
    /// Not a candidate; look at the next one.
    Skip,
    /// A regular build is in flight; no further regular builds this tick.
    Stop,
    /// Try to start a build. `promote_try` turns a successful try into a
    /// regular build first.
    Start { promote_try: bool },
}

pub fn first_pass(state: &PullRequestState, repository: &RepositoryRecord) -> FirstPass {
    if repository.holds_back(state.priority) {
        return FirstPass::Skip;
    }
    match state.status() {
        BuildState::Pending if !state.is_try => FirstPass::Stop,
        _ if state.mergeable == Some(false) => FirstPass::Skip,
        BuildState::None if state.is_approved() => FirstPass::Start { promote_try: false },
        BuildState::Success if state.is_try && state.is_approved() => {
            FirstPass::Start { promote_try: true }
        }
        _ => FirstPass::Skip,
    }
}

/// Whether the second scan should start a try build.
pub fn wants_try(state: &PullRequestState) -> bool {
    state.is_open()
        && state.is_try
        && state.mergeable != Some(false)
        && state.status() == BuildState::None
}

/// Which pull request of the repository holds the regular build slot,
/// relative to `number`.
pub fn pending_context(
    pulls: &BTreeMap<PrNumber, PullRequestState>,
    number: PrNumber,
) -> PendingContext {
    let building = pulls
        .values()
        .find(|s| s.is_open() && !s.is_try && s.build_state == BuildState::Pending);
    match building {
        None => PendingContext::Idle,
        Some(s) if s.number == number => PendingContext::This,
        Some(s) => PendingContext::Other(s.number),
    }
}

/// Outcome of one scheduling pass over a repository.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Every pull request touched, with what the engine must carry out.
    pub changes: Vec<(PrNumber, ChangeResult)>,
    pub started: Option<PrNumber>,
    /// Set when the pass was aborted.
    pub error: Option<SchedulerError>,
}

/// Runs one scheduling pass over a repository's pull requests.
pub async fn process_repository<I>(
    github: &I,
    repo: &RepoConfig,
    repository: &RepositoryRecord,
    pulls: &mut BTreeMap<PrNumber, PullRequestState>,
    now: DateTime<Utc>,
) -> TickReport
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    let mut report = TickReport::default();
    let order: Vec<PrNumber> = queue_order(pulls.values())
        .into_iter()
        .map(|s| s.number)
        .collect();

    for number in &order {
        let Some(state) = pulls.get_mut(number) else {
            continue;
        };
        let promote_try = match first_pass(state, repository) {
            FirstPass::Skip => continue,
            FirstPass::Stop => {
                debug!(repo = %repository.label, pr = %number, "Build already in progress");
                break;
            }
            FirstPass::Start { promote_try } => promote_try,
        };

        let attempt = if promote_try {
            state.is_try = false;
            start_build(github, repo, state, now).await
        } else {
            start_build_or_rebuild(github, repo, state, now).await
        };
        if record(&mut report, *number, promote_try, attempt) {
            return report;
        }
    }

    for number in &order {
        let Some(state) = pulls.get_mut(number) else {
            continue;
        };
        if !wants_try(state) {
            continue;
        }
        let attempt = start_build(github, repo, state, now).await;
        if record(&mut report, *number, false, attempt) {
            return report;
        }
    }

    report
}

/// Adds one start attempt to the report; true when the pass is over.
fn record(
    report: &mut TickReport,
    number: PrNumber,
    promoted: bool,
    attempt: Result<StartOutcome, SchedulerError>,
) -> bool {
    match attempt {
        Ok(StartOutcome::Started(result)) => {
            info!(pr = %number, "Build started");
            report.changes.push((number, result));
            report.started = Some(number);
            true
        }
        Ok(StartOutcome::NotStarted(mut result)) => {
            result.mark_changed(promoted);
            if !result.is_noop() {
                report.changes.push((number, result));
            }
            false
        }
        Err(e) => {
            warn!(pr = %number, error = %e, "Scheduling aborted");
            if promoted {
                report.changes.push((number, ChangeResult::changed()));
            }
            report.error = Some(e);
            true
        }
    }
}
