//! Skipping tests for commits that already passed them.
//!
//! Applies only when every builder is a commit-status builder. A pull
//! request is exempt when either its head is fully rebased onto the base
//! branch and carries passing statuses, or the hosting platform's own test
//! merge has exactly the parents `[base head, pull head]` and carries
//! passing statuses.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use tracing::debug;

use crate::config::RepoConfig;
use crate::effects::{CommitState, GitHubEffect, GitHubInterpreter, GitHubResponse, StatusData};
use crate::types::{PullRequestState, Sha};

use super::start::{branch_head, create_merge};
use super::{SchedulerError, request, unexpected};

pub const REBASED_REASON: &str = "pull fully rebased and already tested";
pub const MERGE_TESTED_REASON: &str = "merge already tested";

/// Contexts among `statuses` that passed, mapped to their required context.
pub fn passing_contexts(
    statuses: &[StatusData],
    equivalences: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    statuses
        .iter()
        .filter(|s| s.state == CommitState::Success)
        .filter_map(|s| equivalences.get(&s.context).cloned())
        .collect()
}

async fn statuses<I>(github: &I, sha: &Sha) -> Result<Vec<StatusData>, SchedulerError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    const OP: &str = "list statuses";
    match request(github, OP, GitHubEffect::ListStatuses { sha: sha.clone() }).await? {
        GitHubResponse::Statuses(statuses) => Ok(statuses),
        other => Err(unexpected(OP, other)),
    }
}

/// Merges the pull request straight onto its base branch when it is exempt.
///
/// Returns the landed merge commit and the reason, or `None` when the pull
/// request still needs testing.
pub async fn try_status_exemption<I>(
    github: &I,
    repo: &RepoConfig,
    state: &PullRequestState,
) -> Result<Option<(Sha, &'static str)>, SchedulerError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    let equivalences = repo.status_equivalences();
    let required: BTreeSet<String> = equivalences.values().cloned().collect();
    if required.is_empty() {
        return Ok(None);
    }

    let head_passing = passing_contexts(&statuses(github, &state.head_sha).await?, &equivalences);
    if head_passing != required {
        debug!(pr = %state.number, "Head statuses incomplete, no exemption");
        return Ok(None);
    }

    let base_sha = branch_head(github, &state.base_ref).await?;

    const COMPARE: &str = "compare commits";
    let compare = GitHubEffect::Compare {
        base: base_sha.clone(),
        head: state.head_sha.clone(),
    };
    let behind_by = match request(github, COMPARE, compare).await? {
        GitHubResponse::Comparison { behind_by, .. } => behind_by,
        other => return Err(unexpected(COMPARE, other)),
    };
    if behind_by == 0 {
        let sha = create_merge(github, state, &state.base_ref).await?;
        return Ok(Some((sha, REBASED_REASON)));
    }

    const PULL: &str = "fetch pull request";
    let pull = match request(github, PULL, GitHubEffect::GetPull { pr: state.number }).await? {
        GitHubResponse::Pull(pull) => pull,
        other => return Err(unexpected(PULL, other)),
    };
    let Some(test_merge) = pull.merge_commit_sha.filter(|_| pull.mergeable == Some(true)) else {
        return Ok(None);
    };

    let merge_passing = passing_contexts(&statuses(github, &test_merge).await?, &equivalences);
    if merge_passing != required {
        return Ok(None);
    }

    const COMMIT: &str = "read commit";
    let commit = match request(github, COMMIT, GitHubEffect::GetCommit { sha: test_merge }).await? {
        GitHubResponse::Commit(commit) => commit,
        other => return Err(unexpected(COMMIT, other)),
    };
    if commit.parents != [base_sha, state.head_sha.clone()] {
        debug!(pr = %state.number, "Test merge is stale, no exemption");
        return Ok(None);
    }

    let sha = create_merge(github, state, &state.base_ref).await?;
    Ok(Some((sha, MERGE_TESTED_REASON)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::effects::CommitData;
    use crate::test_utils::{MockGitHub, pull_data};
    use crate::types::{PrNumber, RepoLabel};

    const HEAD: &str = "065151f8b2c31d9e4ddd34aaf8d3263a997f5cfe";
    const BASE: &str = "1111111111111111111111111111111111111111";
    const TEST_MERGE: &str = "3333333333333333333333333333333333333333";
    const LANDED: &str = "4444444444444444444444444444444444444444";

    fn repo_config() -> Config {
        Config::from_toml_str(
            "bot_name = \"bors\"\n[repo.r]\nowner = \"o\"\nname = \"r\"\n\
             status_based_exemption = true\n\
             [repo.r.status.ci]\ncontext = \"ci/push\"\npr_context = \"ci/pr\"\n",
        )
        .unwrap()
    }

    fn state() -> PullRequestState {
        let mut state = PullRequestState::new(PrNumber(3), Sha::new(HEAD));
        state.base_ref = "main".into();
        state.approved_by = "alice".into();
        state
    }

    fn success(context: &str) -> StatusData {
        StatusData {
            context: context.into(),
            state: CommitState::Success,
            target_url: None,
        }
    }

    #[test]
    fn pr_context_counts_as_required_context() {
        let config = repo_config();
        let equivalences = config.repos[&RepoLabel::new("r")].status_equivalences();
        let passing = passing_contexts(&[success("ci/pr"), success("other")], &equivalences);
        assert_eq!(passing, BTreeSet::from(["ci/push".to_string()]));
    }

    #[tokio::test]
    async fn rebased_and_tested_head_is_merged_directly() {
        let config = repo_config();
        let repo = &config.repos[&RepoLabel::new("r")];
        let github = MockGitHub::new(|effect| match effect {
            GitHubEffect::ListStatuses { .. } => Ok(GitHubResponse::Statuses(vec![success("ci/pr")])),
            GitHubEffect::GetBranchHead { .. } => Ok(GitHubResponse::BranchHead(Sha::new(BASE))),
            GitHubEffect::Compare { .. } => Ok(GitHubResponse::Comparison {
                ahead_by: 1,
                behind_by: 0,
            }),
            GitHubEffect::Merge { .. } => Ok(GitHubResponse::Merged { sha: Sha::new(LANDED) }),
            other => panic!("unexpected effect {:?}", other),
        });

        let exempt = try_status_exemption(&github, repo, &state()).await.unwrap();
        assert_eq!(exempt, Some((Sha::new(LANDED), REBASED_REASON)));
        assert!(github.calls().iter().any(|c| matches!(c, GitHubEffect::Merge { base, .. } if base == "main")));
        assert!(!github.calls().iter().any(|c| matches!(c, GitHubEffect::SetRef { .. })));
    }

    /// Head is tested but behind the base; the test merge reports `merge_context`.
    fn behind_base_github(merge_context: &'static str) -> MockGitHub {
        MockGitHub::new(move |effect| match effect {
            GitHubEffect::ListStatuses { sha } if sha.as_str() == HEAD => {
                Ok(GitHubResponse::Statuses(vec![success("ci/pr")]))
            }
            GitHubEffect::ListStatuses { .. } => {
                Ok(GitHubResponse::Statuses(vec![success(merge_context)]))
            }
            GitHubEffect::GetBranchHead { .. } => Ok(GitHubResponse::BranchHead(Sha::new(BASE))),
            GitHubEffect::Compare { .. } => Ok(GitHubResponse::Comparison {
                ahead_by: 1,
                behind_by: 3,
            }),
            GitHubEffect::GetPull { pr } => {
                let mut pull = pull_data(pr.0, HEAD);
                pull.merge_commit_sha = Some(Sha::new(TEST_MERGE));
                Ok(GitHubResponse::Pull(pull))
            }
            GitHubEffect::GetCommit { sha } => Ok(GitHubResponse::Commit(CommitData {
                sha: sha.clone(),
                parents: vec![Sha::new(BASE), Sha::new(HEAD)],
                message: "Merge".into(),
            })),
            GitHubEffect::Merge { .. } => Ok(GitHubResponse::Merged { sha: Sha::new(LANDED) }),
            other => panic!("unexpected effect {:?}", other),
        })
    }

    #[tokio::test]
    async fn tested_test_merge_with_exact_parents_is_exempt() {
        let config = repo_config();
        let repo = &config.repos[&RepoLabel::new("r")];
        let github = behind_base_github("ci/pr");

        let exempt = try_status_exemption(&github, repo, &state()).await.unwrap();
        assert_eq!(exempt, Some((Sha::new(LANDED), MERGE_TESTED_REASON)));
    }

    #[tokio::test]
    async fn push_context_on_test_merge_does_not_count() {
        let config = repo_config();
        let repo = &config.repos[&RepoLabel::new("r")];
        let github = behind_base_github("ci/push");

        let exempt = try_status_exemption(&github, repo, &state()).await.unwrap();
        assert_eq!(exempt, None);
        assert!(!github.calls().iter().any(|c| matches!(c, GitHubEffect::Merge { .. })));
    }

    #[tokio::test]
    async fn missing_status_needs_testing() {
        let config = repo_config();
        let repo = &config.repos[&RepoLabel::new("r")];
        let github = MockGitHub::new(|effect| match effect {
            GitHubEffect::ListStatuses { .. } => Ok(GitHubResponse::Statuses(vec![StatusData {
                context: "ci/pr".into(),
                state: CommitState::Failure,
                target_url: None,
            }])),
            other => panic!("unexpected effect {:?}", other),
        });
        assert_eq!(try_status_exemption(&github, repo, &state()).await.unwrap(), None);
    }
}
