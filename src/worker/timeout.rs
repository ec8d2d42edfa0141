//! Build timeouts.
//!
//! Arming a timer returns its [`CancellationToken`]. The registry keeps the
//! same token per pull request, so the timer can be cancelled through the
//! handle or by key, and arming again cancels the previous one. A timer that
//! fires only reports; whoever receives the report must check that the same
//! attempt is still pending.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{PrNumber, RepoLabel};

type Key = (RepoLabel, PrNumber);

#[derive(Debug, Default)]
struct Timers {
    next_generation: u64,
    armed: HashMap<Key, (u64, CancellationToken)>,
}

/// Pending build timers, at most one per pull request.
#[derive(Debug, Clone, Default)]
pub struct TimeoutRegistry {
    inner: Arc<Mutex<Timers>>,
}

impl TimeoutRegistry {
    pub fn new() -> Self {
        TimeoutRegistry::default()
    }

    /// Runs `on_fire` after `after` unless cancelled or re-armed first.
    /// Cancelling the returned token cancels the timer.
    ///
    /// Must be called within a tokio runtime.
    pub fn arm<F, Fut>(
        &self,
        repo: RepoLabel,
        pr: PrNumber,
        after: Duration,
        on_fire: F,
    ) -> CancellationToken
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let key = (repo, pr);
        let generation = {
            let Ok(mut timers) = self.inner.lock() else {
                token.cancel();
                return token;
            };
            timers.next_generation += 1;
            let generation = timers.next_generation;
            if let Some((_, previous)) = timers.armed.insert(key.clone(), (generation, token.clone())) {
                previous.cancel();
            }
            generation
        };
        debug!(repo = %key.0, pr = %key.1, secs = after.as_secs(), "Timeout armed");

        let registry = self.clone();
        let handle = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => registry.forget(&key, generation),
                _ = tokio::time::sleep(after) => {
                    registry.forget(&key, generation);
                    debug!(repo = %key.0, pr = %key.1, "Timeout fired");
                    on_fire().await;
                }
            }
        });
        handle
    }

    /// Cancels the pull request's timer. Returns false if none was armed.
    pub fn cancel(&self, repo: &RepoLabel, pr: PrNumber) -> bool {
        let Ok(mut timers) = self.inner.lock() else {
            return false;
        };
        match timers.armed.remove(&(repo.clone(), pr)) {
            Some((_, token)) => {
                token.cancel();
                debug!(repo = %repo, pr = %pr, "Timeout cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, repo: &RepoLabel, pr: PrNumber) -> bool {
        self.inner
            .lock()
            .map(|timers| timers.armed.contains_key(&(repo.clone(), pr)))
            .unwrap_or(false)
    }

    /// Cancels every timer, on shutdown.
    pub fn cancel_all(&self) {
        if let Ok(mut timers) = self.inner.lock() {
            for (_, (_, token)) in timers.armed.drain() {
                token.cancel();
            }
        }
    }

    fn forget(&self, key: &Key, generation: u64) {
        if let Ok(mut timers) = self.inner.lock()
            && timers.armed.get(key).is_some_and(|(g, _)| *g == generation)
        {
            timers.armed.remove(key);
        }
    }
}
