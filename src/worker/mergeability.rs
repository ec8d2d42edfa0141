//! Background resolution of the `mergeable` flag.
//!
//! GitHub computes mergeability lazily: right after a push the flag reads
//! as unknown. Jobs are drained one at a time by a single consumer; each
//! asks for the pull request, waits once if the answer is still unknown,
//! and hands the result back to the host, which applies it under the
//! repository lock like any other event.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::effects::{GitHubEffect, GitHubInterpreter, GitHubResponse, MergeCause};
use crate::types::{PrNumber, RepoLabel};

/// Delay before asking a second time when GitHub has not decided yet.
pub const RECHECK_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeabilityJob {
    pub repo: RepoLabel,
    pub pr: PrNumber,
    /// The commit that triggered the check, blamed for new conflicts.
    pub cause: Option<MergeCause>,
}

/// What the worker needs from the rest of the bot.
pub trait MergeabilityHost: Send + Sync + 'static {
    type GitHub: GitHubInterpreter + Send + Sync + 'static;

    /// The repository's interpreter, or `None` when the pull request is
    /// gone or already tested successfully.
    fn prepare(
        &self,
        job: &MergeabilityJob,
    ) -> impl Future<Output = Option<Arc<Self::GitHub>>> + Send;

    /// Applies the resolved flag.
    fn resolve(
        &self,
        job: MergeabilityJob,
        mergeable: Option<bool>,
    ) -> impl Future<Output = ()> + Send;
}

/// Reads the flag, asking once more after `delay` if it is still unknown.
pub async fn fetch_mergeable<I>(
    github: &I,
    pr: PrNumber,
    delay: Duration,
) -> Result<Option<bool>, I::Error>
where
    I: GitHubInterpreter,
{
    let first = read(github, pr).await?;
    if first.is_some() {
        return Ok(first);
    }
    debug!(pr = %pr, "Mergeability unknown, asking again");
    tokio::time::sleep(delay).await;
    read(github, pr).await
}

async fn read<I>(github: &I, pr: PrNumber) -> Result<Option<bool>, I::Error>
where
    I: GitHubInterpreter,
{
    match github.interpret(GitHubEffect::GetPull { pr }).await? {
        GitHubResponse::Pull(pull) => Ok(pull.mergeable),
        _ => Ok(None),
    }
}

/// Drains `rx` until it closes or `shutdown` fires.
pub async fn run<H>(
    host: Arc<H>,
    mut rx: mpsc::UnboundedReceiver<MergeabilityJob>,
    delay: Duration,
    shutdown: CancellationToken,
) where
    H: MergeabilityHost,
    <H::GitHub as GitHubInterpreter>::Error: Display,
{
    info!("Mergeability worker started");
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Some(github) = host.prepare(&job).await else {
            debug!(repo = %job.repo, pr = %job.pr, "Skipping mergeability check");
            continue;
        };
        match fetch_mergeable(github.as_ref(), job.pr, delay).await {
            Ok(mergeable) => {
                debug!(repo = %job.repo, pr = %job.pr, ?mergeable, "Mergeability resolved");
                host.resolve(job, mergeable).await;
            }
            Err(e) => {
                warn!(repo = %job.repo, pr = %job.pr, error = %e, "Error while fetching mergeability");
            }
        }
    }
    info!("Mergeability worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockError, MockGitHub, pull_data};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Host {
        github: Arc<MockGitHub>,
        skip: Option<PrNumber>,
        resolved: Mutex<Vec<(PrNumber, Option<bool>)>>,
    }

    impl MergeabilityHost for Host {
        type GitHub = MockGitHub;

        async fn prepare(&self, job: &MergeabilityJob) -> Option<Arc<MockGitHub>> {
            (self.skip != Some(job.pr)).then(|| Arc::clone(&self.github))
        }

        async fn resolve(&self, job: MergeabilityJob, mergeable: Option<bool>) {
            self.resolved.lock().unwrap().push((job.pr, mergeable));
        }
    }

    fn job(pr: u64) -> MergeabilityJob {
        MergeabilityJob {
            repo: RepoLabel::new("r"),
            pr: PrNumber(pr),
            cause: None,
        }
    }

    #[tokio::test]
    async fn unknown_answer_is_asked_twice() {
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);
        let github = MockGitHub::new(move |effect| match effect {
            GitHubEffect::GetPull { pr } => {
                let mut pull = pull_data(pr.0, &"a".repeat(40));
                pull.mergeable = (counter.fetch_add(1, Ordering::SeqCst) > 0).then_some(false);
                Ok(GitHubResponse::Pull(pull))
            }
            other => panic!("unexpected effect {:?}", other),
        });
        let mergeable = fetch_mergeable(&github, PrNumber(1), Duration::ZERO).await.unwrap();
        assert_eq!(mergeable, Some(false));
        assert_eq!(asked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn known_answer_is_asked_once() {
        let github = MockGitHub::new(|effect| match effect {
            GitHubEffect::GetPull { pr } => Ok(GitHubResponse::Pull(pull_data(pr.0, &"a".repeat(40)))),
            other => panic!("unexpected effect {:?}", other),
        });
        let mergeable = fetch_mergeable(&github, PrNumber(1), Duration::ZERO).await.unwrap();
        assert_eq!(mergeable, Some(true));
        assert_eq!(github.calls().len(), 1);
    }

    #[tokio::test]
    async fn worker_resolves_jobs_in_order_and_skips() {
        let github = Arc::new(MockGitHub::new(|effect| match effect {
            GitHubEffect::GetPull { pr } if pr.0 == 3 => Err(MockError("boom".into())),
            GitHubEffect::GetPull { pr } => Ok(GitHubResponse::Pull(pull_data(pr.0, &"a".repeat(40)))),
            other => panic!("unexpected effect {:?}", other),
        }));
        let host = Arc::new(Host {
            github,
            skip: Some(PrNumber(2)),
            resolved: Mutex::new(Vec::new()),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        for pr in [1, 2, 3, 4] {
            tx.send(job(pr)).unwrap();
        }
        drop(tx);
        run(Arc::clone(&host), rx, Duration::ZERO, CancellationToken::new()).await;

        let resolved = host.resolved.lock().unwrap().clone();
        assert_eq!(resolved, vec![(PrNumber(1), Some(true)), (PrNumber(4), Some(true))]);
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker() {
        let host = Arc::new(Host {
            github: Arc::new(MockGitHub::permissive()),
            skip: None,
            resolved: Mutex::new(Vec::new()),
        });
        let (_tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        run(host, rx, Duration::ZERO, shutdown).await;
    }
}
