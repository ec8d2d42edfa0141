//! Carrying out a [`ChangeResult`].
//!
//! Every failure here is logged and skipped: the state change that produced
//! the effect is already persisted, and one failed hosting call must not
//! keep the rest of the result from happening.

use std::collections::BTreeSet;
use std::fmt::Display;

use tracing::{debug, info, warn};

use crate::effects::{ChangeResult, Effect, GitHubEffect, GitHubInterpreter, GitHubResponse};
use crate::labels::LabelEvent;
use crate::state::{Event, STATUS_CONTEXT, builds};
use crate::types::{PrNumber, Sha};
use crate::worker::MergeabilityJob;

use super::hooks::HookPayload;
use super::{Engine, InternalEvent, RepoRuntime, Work};

impl<I> Engine<I>
where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    /// Posts comments, updates labels and runs effects, in that order.
    ///
    /// Returns follow-up work for the caller to drain.
    pub(crate) async fn execute(
        &self,
        runtime: &RepoRuntime<I>,
        pr: PrNumber,
        result: ChangeResult,
    ) -> Vec<Work> {
        let mut work = Vec::new();

        for comment in &result.comments {
            let body = comment.render(&self.config.bot_name);
            self.post_comment(runtime, pr, body).await;
        }
        for event in &result.label_events {
            self.update_labels(runtime, pr, *event).await;
        }
        for effect in result.effects {
            if let Some(next) = self.run_effect(runtime, pr, effect).await {
                work.push(next);
            }
        }
        work
    }

    pub(crate) async fn post_comment(&self, runtime: &RepoRuntime<I>, pr: PrNumber, body: String) {
        let effect = GitHubEffect::PostComment { pr, body };
        if let Err(e) = runtime.github.interpret(effect).await {
            warn!(repo = %runtime.label, pr = %pr, error = %e, "Failed to post comment");
        }
    }

    async fn update_labels(&self, runtime: &RepoRuntime<I>, pr: PrNumber, event: LabelEvent) {
        let Some(rule) = self
            .config
            .repos
            .get(&runtime.label)
            .and_then(|repo| repo.label_rule(event))
        else {
            return;
        };

        let current: BTreeSet<String> = match runtime.github.interpret(GitHubEffect::GetLabels { pr }).await {
            Ok(GitHubResponse::Labels(labels)) => labels.into_iter().collect(),
            Ok(other) => {
                warn!(repo = %runtime.label, pr = %pr, response = ?other, "Unexpected response to label query");
                return;
            }
            Err(e) => {
                warn!(repo = %runtime.label, pr = %pr, error = %e, "Failed to read labels");
                return;
            }
        };
        let Some(labels) = rule.apply(&current) else {
            debug!(repo = %runtime.label, pr = %pr, event = event.as_str(), "Labels unchanged");
            return;
        };

        let effect = GitHubEffect::ReplaceLabels {
            pr,
            labels: labels.into_iter().collect(),
        };
        if let Err(e) = runtime.github.interpret(effect).await {
            warn!(repo = %runtime.label, pr = %pr, event = event.as_str(), error = %e, "Failed to update labels");
        }
    }

    async fn run_effect(&self, runtime: &RepoRuntime<I>, pr: PrNumber, effect: Effect) -> Option<Work> {
        let label = &runtime.label;
        match effect {
            Effect::SetCommitStatus {
                sha,
                state,
                description,
                target_url,
            } => {
                let effect = GitHubEffect::CreateStatus {
                    sha,
                    state,
                    context: STATUS_CONTEXT.to_string(),
                    description,
                    target_url,
                };
                if let Err(e) = runtime.github.interpret(effect).await {
                    warn!(repo = %label, pr = %pr, error = %e, "Failed to set commit status");
                }
                None
            }

            Effect::ArmTimeout { merge_sha } => {
                let timeout = self.config.repos.get(label)?.timeout();
                let internal = self.internal.clone();
                let repo = label.clone();
                self.timeouts.arm(label.clone(), pr, timeout, move || async move {
                    let event = Event::TimedOut { merge_sha };
                    if internal.send(InternalEvent { repo, pr, event }).is_err() {
                        debug!(pr = %pr, "Engine is gone, dropping timeout");
                    }
                });
                None
            }

            Effect::CancelTimeout => {
                self.timeouts.cancel(label, pr);
                None
            }

            Effect::RecordRetry(record) => {
                if let Err(e) = self.store.append_retry(label, &record) {
                    warn!(repo = %label, pr = %pr, error = %e, "Failed to record retry");
                }
                None
            }

            Effect::RefreshMergeability { cause } => {
                self.enqueue_mergeability(MergeabilityJob {
                    repo: label.clone(),
                    pr,
                    cause,
                });
                None
            }

            Effect::UpdateTreeClosed { threshold, source } => {
                let mut guard = runtime.state.lock().await;
                if guard.repository.set_treeclosed(threshold, source) {
                    info!(repo = %label, threshold, "Tree-closed threshold updated");
                    self.save_repository(&guard.repository);
                }
                None
            }

            Effect::TriggerHook { name, extra, body } => {
                let hook = self.config.hooks.get(&name)?;
                let payload = HookPayload::new(pr, label, extra.as_deref(), &body);
                match self.hooks.trigger(&name, hook, &payload).await {
                    Ok(Some(text)) => self.post_comment(runtime, pr, text).await,
                    Ok(None) => {}
                    Err(e) => warn!(repo = %label, pr = %pr, hook = %name, error = %e, "Hook failed"),
                }
                None
            }

            Effect::FastForward { base_ref, merge_sha } => {
                self.fast_forward(runtime, pr, base_ref, merge_sha).await
            }

            Effect::RefreshHead => self.refresh_head(runtime, pr).await,
        }
    }

    async fn fast_forward(
        &self,
        runtime: &RepoRuntime<I>,
        pr: PrNumber,
        base_ref: String,
        merge_sha: Sha,
    ) -> Option<Work> {
        let effect = GitHubEffect::SetRef {
            branch: base_ref.clone(),
            sha: merge_sha.clone(),
            force: false,
        };
        let error = match runtime.github.interpret(effect).await {
            Ok(GitHubResponse::RefUpdated) => {
                info!(repo = %runtime.label, pr = %pr, branch = %base_ref, sha = %merge_sha, "Fast-forwarded");
                return None;
            }
            Ok(other) => format!("unexpected response {:?}", other),
            Err(e) => e.to_string(),
        };
        warn!(repo = %runtime.label, pr = %pr, branch = %base_ref, error = %error, "Fast-forward failed");

        let mut guard = runtime.state.lock().await;
        let pull = guard.pulls.get_mut(&pr)?;
        let result = builds::fast_forward_failed(pull, &error);
        self.save_pull(&runtime.label, pull);
        Some(Work::Outcome { pr, result })
    }

    /// Re-reads the head; a head that moved is handled like a push.
    async fn refresh_head(&self, runtime: &RepoRuntime<I>, pr: PrNumber) -> Option<Work> {
        let pull = match runtime.github.interpret(GitHubEffect::GetPull { pr }).await {
            Ok(GitHubResponse::Pull(pull)) => pull,
            Ok(other) => {
                warn!(repo = %runtime.label, pr = %pr, response = ?other, "Unexpected response to pull request query");
                return None;
            }
            Err(e) => {
                warn!(repo = %runtime.label, pr = %pr, error = %e, "Failed to refresh head");
                return None;
            }
        };

        let known = runtime.state.lock().await.pulls.get(&pr)?.head_sha.clone();
        if pull.head_sha == known {
            return None;
        }
        info!(repo = %runtime.label, pr = %pr, head = %pull.head_sha, "Head moved since last seen");
        Some(Work::Event {
            pr,
            event: Event::CommitPushed { sha: pull.head_sha },
            realtime: true,
        })
    }
}
