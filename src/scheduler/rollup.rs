//! Rollups: several approved pull requests merged onto one branch and
//! submitted together as a single pull request.
//!
//! Candidates are copied out of the repository state first, so the hosting
//! calls run without holding the repository lock.

use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::effects::{GitHubEffect, GitHubInterpreter, GitHubResponse};
use crate::types::{PrNumber, PullRequestState, RollupMode, Sha};

use super::start::branch_head;
use super::{SchedulerError, request, unexpected};

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("invalid pull request number: {0}")]
    UnknownPull(PrNumber),

    #[error("no pull requests are marked as rollup")]
    NoCandidates,

    /// Every candidate conflicted; no pull request was opened.
    #[error("none of the pull requests could be merged")]
    NothingMerged { failed: Vec<PrNumber> },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// What a rollup needs to know about one pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupCandidate {
    pub number: PrNumber,
    pub head_sha: Sha,
    pub head_ref: String,
    pub base_ref: String,
    pub approved_by: String,
    pub title: String,
    pub body: String,
}

impl RollupCandidate {
    fn from_state(state: &PullRequestState) -> Self {
        RollupCandidate {
            number: state.number,
            head_sha: state.head_sha.clone(),
            head_ref: state.head_ref.clone(),
            base_ref: state.base_ref.clone(),
            approved_by: state.approved_by.clone(),
            title: state.title.clone(),
            body: state.body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub branch: String,
    pub pull: u64,
    pub html_url: String,
    pub merged: Vec<u64>,
    pub failed: Vec<u64>,
}

/// Picks the pull requests to roll up, ordered by number.
///
/// With explicit `numbers`, each must be tracked; otherwise every open pull
/// request marked `rollup=always` is considered. Only approved ones are kept.
pub fn select_candidates(
    pulls: &BTreeMap<PrNumber, PullRequestState>,
    numbers: &[PrNumber],
) -> Result<Vec<RollupCandidate>, RollupError> {
    let chosen: Vec<&PullRequestState> = if numbers.is_empty() {
        pulls
            .values()
            .filter(|s| s.is_open() && s.rollup == RollupMode::Always)
            .collect()
    } else {
        numbers
            .iter()
            .map(|n| pulls.get(n).ok_or(RollupError::UnknownPull(*n)))
            .collect::<Result<_, _>>()?
    };

    let mut candidates: Vec<RollupCandidate> = chosen
        .into_iter()
        .filter(|s| s.is_approved())
        .map(RollupCandidate::from_state)
        .collect();
    candidates.sort_by_key(|c| c.number);
    candidates.dedup_by_key(|c| c.number);

    if candidates.is_empty() {
        return Err(RollupError::NoCandidates);
    }
    Ok(candidates)
}

pub fn rollup_message(candidate: &RollupCandidate) -> String {
    format!(
        "Rollup merge of #{} - {}, r={}\n\n{}\n\n{}",
        candidate.number.0,
        candidate.head_ref,
        candidate.approved_by,
        candidate.title,
        candidate.body
    )
}

/// Body of the rollup pull request.
pub fn rollup_body(merged: &[&RollupCandidate], failed: &[&RollupCandidate]) -> String {
    let mut body = String::from("Successful merges:\n\n");
    for c in merged {
        body.push_str(&format!(" - #{} ({})\n", c.number.0, c.title));
    }
    body.push_str("\nFailed merges:\n\n");
    for c in failed {
        body.push_str(&format!(" - #{} ({})\n", c.number.0, c.title));
    }
    body.push_str("\nr? @ghost");
    body
}

pub fn branch_name(now: DateTime<Utc>) -> String {
    format!("rollup-{}", now.format("%Y%m%d%H%M%S"))
}

/// Builds the rollup branch from the first candidate's base and opens the
/// rollup pull request.
///
/// Candidates targeting another base, or conflicting with what was merged
/// before them, are listed as failed merges.
pub async fn create_rollup<I>(
    github: &I,
    candidates: &[RollupCandidate],
    now: DateTime<Utc>,
) -> Result<RollupReport, RollupError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    let Some(first) = candidates.first() else {
        return Err(RollupError::NoCandidates);
    };
    let base_ref = first.base_ref.clone();
    let base_sha = branch_head(github, &base_ref).await?;
    let branch = branch_name(now);

    const RESET: &str = "create rollup branch";
    let reset = GitHubEffect::SetRef {
        branch: branch.clone(),
        sha: base_sha,
        force: true,
    };
    match request(github, RESET, reset).await? {
        GitHubResponse::RefUpdated => {}
        other => return Err(unexpected(RESET, other).into()),
    }

    let mut merged = Vec::new();
    let mut failed = Vec::new();
    for candidate in candidates {
        if candidate.base_ref != base_ref {
            debug!(pr = %candidate.number, base = %candidate.base_ref, "Different base, left out of rollup");
            failed.push(candidate);
            continue;
        }

        const MERGE: &str = "merge into rollup";
        let merge = GitHubEffect::Merge {
            base: branch.clone(),
            head: candidate.head_sha.clone(),
            message: rollup_message(candidate),
        };
        match request(github, MERGE, merge).await? {
            GitHubResponse::Merged { .. } => merged.push(candidate),
            GitHubResponse::MergeConflict => {
                debug!(pr = %candidate.number, "Conflicts with the rollup");
                failed.push(candidate);
            }
            other => return Err(unexpected(MERGE, other).into()),
        }
    }

    if merged.is_empty() {
        return Err(RollupError::NothingMerged {
            failed: failed.iter().map(|c| c.number).collect(),
        });
    }

    const CREATE: &str = "open rollup pull request";
    let create = GitHubEffect::CreatePull {
        title: format!("Rollup of {} pull requests", merged.len()),
        head: branch.clone(),
        base: base_ref,
        body: rollup_body(&merged, &failed),
    };
    let (pull, html_url) = match request(github, CREATE, create).await? {
        GitHubResponse::PullCreated { number, html_url } => (number, html_url),
        other => return Err(unexpected(CREATE, other).into()),
    };

    info!(pr = %pull, branch = %branch, merged = merged.len(), failed = failed.len(), "Rollup opened");
    Ok(RollupReport {
        branch,
        pull: pull.0,
        html_url,
        merged: merged.iter().map(|c| c.number.0).collect(),
        failed: failed.iter().map(|c| c.number.0).collect(),
    })
}
