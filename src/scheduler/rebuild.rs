//! Re-running only the builders that failed.

use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::comments::{Comment, messages};
use crate::effects::{ChangeResult, GitHubEffect, GitHubInterpreter, GitHubResponse};
use crate::state::builds;
use crate::types::{AttemptState, BuilderResult, PullRequestState, Sha};

use super::start::branch_head;
use super::{SchedulerError, request, unexpected};

/// A failed attempt whose failed builders can be re-run in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildPlan {
    pub merge_sha: Sha,
    /// Successful results carried over into the new attempt.
    pub reused: BTreeMap<String, BuilderResult>,
    /// `(builder, url, run id)` of every failed builder.
    pub rerun: Vec<(String, String, u64)>,
}

/// Whether the last attempt of the active track can be rebuilt.
///
/// The attempt must have failed on the current merge commit with at least
/// one success and one failure, every result must link somewhere, and every
/// failure must be re-runnable.
pub fn plan_rebuild(state: &PullRequestState) -> Option<RebuildPlan> {
    let merge_sha = state.merge_sha.clone()?;
    let last = state.history(state.active_track()).last()?;
    if last.state != AttemptState::Failure || last.merge_sha != merge_sha {
        return None;
    }

    let mut reused = BTreeMap::new();
    let mut rerun = Vec::new();
    for (name, result) in &last.builder_results {
        let url = result.url.clone()?;
        if result.success {
            reused.insert(name.clone(), result.clone());
        } else {
            rerun.push((name.clone(), url, result.run_id?));
        }
    }

    if reused.is_empty() || rerun.is_empty() {
        return None;
    }
    Some(RebuildPlan {
        merge_sha,
        reused,
        rerun,
    })
}

#[derive(Debug)]
pub enum RebuildOutcome {
    NotApplicable,
    /// Re-running failed; a full build should be attempted instead.
    Failed(ChangeResult),
    Started(ChangeResult),
}

pub async fn try_rebuild<I>(
    github: &I,
    state: &mut PullRequestState,
    now: DateTime<Utc>,
) -> Result<RebuildOutcome, SchedulerError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    let Some(plan) = plan_rebuild(state) else {
        return Ok(RebuildOutcome::NotApplicable);
    };

    // The reused results only hold while the merge is still on top of the
    // current base.
    let base_sha = branch_head(github, &state.base_ref).await?;
    const COMMIT: &str = "read merge commit";
    let effect = GitHubEffect::GetCommit {
        sha: plan.merge_sha.clone(),
    };
    let commit = match request(github, COMMIT, effect).await? {
        GitHubResponse::Commit(commit) => commit,
        other => return Err(unexpected(COMMIT, other)),
    };
    if !commit.parents.contains(&base_sha) {
        return Ok(RebuildOutcome::NotApplicable);
    }

    for (name, _, run_id) in &plan.rerun {
        let effect = GitHubEffect::RerequestCheckRun { run_id: *run_id };
        if let Err(e) = request(github, "re-run check", effect).await {
            warn!(pr = %state.number, builder = %name, error = %e, "Rebuild failed");
            let mut result = ChangeResult::unchanged();
            result.comment(Comment::plain(messages::rebuild_failed(&e.to_string())));
            return Ok(RebuildOutcome::Failed(result));
        }
    }

    let rerun: Vec<(String, String)> = plan
        .rerun
        .iter()
        .map(|(name, url, _)| (name.clone(), url.clone()))
        .collect();
    info!(pr = %state.number, builders = rerun.len(), "Rebuilding failed builders");
    Ok(RebuildOutcome::Started(builds::begin_rebuild(
        state,
        plan.reused,
        &rerun,
        now,
    )))
}
