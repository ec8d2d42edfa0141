//! GitHub effect interpreter using octocrab.
//!
//! Pull requests and comments go through octocrab's typed API; everything
//! else uses the REST routes directly with small response structs, which
//! keeps us independent of octocrab's model coverage.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::effects::{
    CommentData, CommitData, CommitState, GitHubEffect, GitHubInterpreter, GitHubResponse,
    PullData, StatusData,
};
use crate::types::{GithubState, PrNumber, Sha};

use super::client::OctocrabClient;
use super::error::GitHubApiError;
use super::retry::{RetryConfig, RetryPolicy, retry_with_backoff};

const PER_PAGE: u8 = 100;

impl GitHubInterpreter for OctocrabClient {
    type Error = GitHubApiError;

    async fn interpret(&self, effect: GitHubEffect) -> Result<GitHubResponse, Self::Error> {
        interpret_github_effect(
            self,
            effect,
            RetryConfig::DEFAULT,
            RetryPolicy::RetryTransient,
        )
        .await
    }
}

/// Executes `effect` with retries for transient failures.
pub async fn interpret_github_effect(
    client: &OctocrabClient,
    effect: GitHubEffect,
    retry_config: RetryConfig,
    retry_policy: RetryPolicy,
) -> Result<GitHubResponse, GitHubApiError> {
    retry_with_backoff(retry_config, retry_policy, || {
        execute_effect(client, effect.clone())
    })
    .await
}

async fn execute_effect(
    client: &OctocrabClient,
    effect: GitHubEffect,
) -> Result<GitHubResponse, GitHubApiError> {
    match effect {
        GitHubEffect::GetPull { pr } => get_pull(client, pr).await,
        GitHubEffect::ListOpenPulls => list_open_pulls(client).await,
        GitHubEffect::CreatePull {
            title,
            head,
            base,
            body,
        } => create_pull(client, title, head, base, body).await,
        GitHubEffect::PostComment { pr, body } => post_comment(client, pr, body).await,
        GitHubEffect::ListComments { pr } => list_comments(client, pr).await,
        GitHubEffect::GetLabels { pr } => get_labels(client, pr).await,
        GitHubEffect::ReplaceLabels { pr, labels } => replace_labels(client, pr, labels).await,
        GitHubEffect::CreateStatus {
            sha,
            state,
            context,
            description,
            target_url,
        } => create_status(client, sha, state, context, description, target_url).await,
        GitHubEffect::ListStatuses { sha } => list_statuses(client, sha).await,
        GitHubEffect::GetBranchHead { branch } => get_branch_head(client, branch).await,
        GitHubEffect::SetRef { branch, sha, force } => set_ref(client, branch, sha, force).await,
        GitHubEffect::Merge {
            base,
            head,
            message,
        } => merge(client, base, head, message).await,
        GitHubEffect::GetCommit { sha } => get_commit(client, sha).await,
        GitHubEffect::Compare { base, head } => compare(client, base, head).await,
        GitHubEffect::ListCollaborators => list_collaborators(client).await,
        GitHubEffect::RerequestCheckRun { run_id } => rerequest_check_run(client, run_id).await,
    }
}

// ─── Pull requests ────────────────────────────────────────────────────────────

fn pull_data(pull: octocrab::models::pulls::PullRequest) -> PullData {
    let state = if pull.merged_at.is_some() {
        GithubState::Merged
    } else if pull.state == Some(octocrab::models::IssueState::Closed) {
        GithubState::Closed
    } else {
        GithubState::Open
    };

    PullData {
        number: PrNumber(pull.number),
        head_sha: Sha::new(pull.head.sha),
        head_ref: pull.head.ref_field,
        base_ref: pull.base.ref_field,
        title: pull.title.unwrap_or_default(),
        body: pull.body.unwrap_or_default(),
        author: pull.user.map(|u| u.login).unwrap_or_default(),
        assignee: pull.assignee.map(|u| u.login),
        state,
        mergeable: pull.mergeable,
        merge_commit_sha: pull.merge_commit_sha.map(Sha::new),
    }
}

async fn get_pull(client: &OctocrabClient, pr: PrNumber) -> Result<GitHubResponse, GitHubApiError> {
    client
        .inner()
        .pulls(client.owner(), client.repo_name())
        .get(pr.0)
        .await
        .map(|pull| GitHubResponse::Pull(pull_data(pull)))
        .map_err(GitHubApiError::from_octocrab)
}

async fn list_open_pulls(client: &OctocrabClient) -> Result<GitHubResponse, GitHubApiError> {
    let mut page = 1u32;
    let mut all = Vec::new();

    loop {
        let items = client
            .inner()
            .pulls(client.owner(), client.repo_name())
            .list()
            .state(octocrab::params::State::Open)
            .per_page(PER_PAGE)
            .page(page)
            .send()
            .await
            .map_err(GitHubApiError::from_octocrab)?
            .items;

        let is_last_page = items.len() < usize::from(PER_PAGE);
        all.extend(items.into_iter().map(pull_data));
        if is_last_page {
            break;
        }
        page += 1;
    }

    Ok(GitHubResponse::PullList(all))
}

async fn create_pull(
    client: &OctocrabClient,
    title: String,
    head: String,
    base: String,
    body: String,
) -> Result<GitHubResponse, GitHubApiError> {
    let pull = client
        .inner()
        .pulls(client.owner(), client.repo_name())
        .create(title, head, base)
        .body(body)
        .send()
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(GitHubResponse::PullCreated {
        number: PrNumber(pull.number),
        html_url: pull.html_url.map(|url| url.to_string()).unwrap_or_default(),
    })
}

// ─── Comments and labels ──────────────────────────────────────────────────────

async fn post_comment(
    client: &OctocrabClient,
    pr: PrNumber,
    body: String,
) -> Result<GitHubResponse, GitHubApiError> {
    client
        .inner()
        .issues(client.owner(), client.repo_name())
        .create_comment(pr.0, body)
        .await
        .map(|_| GitHubResponse::CommentPosted)
        .map_err(GitHubApiError::from_octocrab)
}

async fn list_comments(
    client: &OctocrabClient,
    pr: PrNumber,
) -> Result<GitHubResponse, GitHubApiError> {
    let mut page = 1u32;
    let mut all = Vec::new();

    loop {
        let items = client
            .inner()
            .issues(client.owner(), client.repo_name())
            .list_comments(pr.0)
            .per_page(PER_PAGE)
            .page(page)
            .send()
            .await
            .map_err(GitHubApiError::from_octocrab)?
            .items;

        let is_last_page = items.len() < usize::from(PER_PAGE);
        all.extend(items.into_iter().map(|comment| CommentData {
            id: comment.id.into_inner(),
            author: comment.user.login,
            body: comment.body.unwrap_or_default(),
            html_url: comment.html_url.to_string(),
        }));
        if is_last_page {
            break;
        }
        page += 1;
    }

    Ok(GitHubResponse::Comments(all))
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    name: String,
}

async fn get_labels(client: &OctocrabClient, pr: PrNumber) -> Result<GitHubResponse, GitHubApiError> {
    let route = client.route(&format!("/issues/{}/labels?per_page=100", pr.0));
    let labels: Vec<LabelResponse> = client
        .inner()
        .get(route, None::<&()>)
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(GitHubResponse::Labels(
        labels.into_iter().map(|l| l.name).collect(),
    ))
}

async fn replace_labels(
    client: &OctocrabClient,
    pr: PrNumber,
    labels: Vec<String>,
) -> Result<GitHubResponse, GitHubApiError> {
    #[derive(Serialize)]
    struct ReplaceRequest {
        labels: Vec<String>,
    }

    let route = client.route(&format!("/issues/{}/labels", pr.0));
    let _: Vec<LabelResponse> = client
        .inner()
        .put(route, Some(&ReplaceRequest { labels }))
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(GitHubResponse::LabelsReplaced)
}

// ─── Commit statuses ──────────────────────────────────────────────────────────

async fn create_status(
    client: &OctocrabClient,
    sha: Sha,
    state: CommitState,
    context: String,
    description: String,
    target_url: Option<String>,
) -> Result<GitHubResponse, GitHubApiError> {
    #[derive(Serialize)]
    struct StatusRequest {
        state: &'static str,
        context: String,
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_url: Option<String>,
    }

    // GitHub rejects descriptions longer than 140 characters.
    let description: String = description.chars().take(140).collect();
    let route = client.route(&format!("/statuses/{}", sha));
    let _: serde_json::Value = client
        .inner()
        .post(
            route,
            Some(&StatusRequest {
                state: state.as_api_str(),
                context,
                description,
                target_url,
            }),
        )
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(GitHubResponse::StatusCreated)
}

#[derive(Debug, Deserialize)]
struct CombinedStatus {
    statuses: Vec<StatusEntry>,
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    context: String,
    state: String,
    target_url: Option<String>,
}

/// The latest status per context, from the combined status endpoint.
async fn list_statuses(client: &OctocrabClient, sha: Sha) -> Result<GitHubResponse, GitHubApiError> {
    let route = client.route(&format!("/commits/{}/status?per_page=100", sha));
    let combined: CombinedStatus = client
        .inner()
        .get(route, None::<&()>)
        .await
        .map_err(GitHubApiError::from_octocrab)?;

    let statuses = combined
        .statuses
        .into_iter()
        .filter_map(|entry| {
            let Some(state) = CommitState::from_api_str(&entry.state) else {
                warn!(context = %entry.context, state = %entry.state, "Unknown commit status state");
                return None;
            };
            Some(StatusData {
                context: entry.context,
                state,
                target_url: entry.target_url,
            })
        })
        .collect();
    Ok(GitHubResponse::Statuses(statuses))
}

// ─── Refs and commits ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

async fn get_branch_head(
    client: &OctocrabClient,
    branch: String,
) -> Result<GitHubResponse, GitHubApiError> {
    let route = client.route(&format!("/git/ref/heads/{}", branch));
    let reference: RefResponse = client
        .inner()
        .get(route, None::<&()>)
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(GitHubResponse::BranchHead(Sha::new(reference.object.sha)))
}

/// Points `branch` at `sha`, creating the branch when it doesn't exist yet.
async fn set_ref(
    client: &OctocrabClient,
    branch: String,
    sha: Sha,
    force: bool,
) -> Result<GitHubResponse, GitHubApiError> {
    #[derive(Serialize)]
    struct UpdateRef<'a> {
        sha: &'a str,
        force: bool,
    }

    #[derive(Serialize)]
    struct CreateRef<'a> {
        #[serde(rename = "ref")]
        reference: String,
        sha: &'a str,
    }

    let route = client.route(&format!("/git/refs/heads/{}", branch));
    let updated: Result<serde_json::Value, _> = client
        .inner()
        .patch(
            route,
            Some(&UpdateRef {
                sha: sha.as_str(),
                force,
            }),
        )
        .await;

    match updated.map_err(GitHubApiError::from_octocrab) {
        Ok(_) => Ok(GitHubResponse::RefUpdated),
        Err(e) if e.status_code == Some(422) && e.message.contains("does not exist") => {
            let _: serde_json::Value = client
                .inner()
                .post(
                    client.route("/git/refs"),
                    Some(&CreateRef {
                        reference: format!("refs/heads/{}", branch),
                        sha: sha.as_str(),
                    }),
                )
                .await
                .map_err(GitHubApiError::from_octocrab)?;
            Ok(GitHubResponse::RefUpdated)
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Deserialize)]
struct MergeCommit {
    sha: String,
}

/// Merges `head` into the `base` branch on the server.
///
/// A conflict is reported as [`GitHubResponse::MergeConflict`]; HTTP 204
/// ("nothing to merge") has no commit to return and is an error.
async fn merge(
    client: &OctocrabClient,
    base: String,
    head: Sha,
    message: String,
) -> Result<GitHubResponse, GitHubApiError> {
    #[derive(Serialize)]
    struct MergeRequest<'a> {
        base: &'a str,
        head: &'a str,
        commit_message: &'a str,
    }

    let result: Result<MergeCommit, _> = client
        .inner()
        .post(
            client.route("/merges"),
            Some(&MergeRequest {
                base: &base,
                head: head.as_str(),
                commit_message: &message,
            }),
        )
        .await;

    match result.map_err(GitHubApiError::from_octocrab) {
        Ok(commit) => Ok(GitHubResponse::Merged {
            sha: Sha::new(commit.sha),
        }),
        Err(e) if e.status_code == Some(409) => Ok(GitHubResponse::MergeConflict),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Deserialize)]
struct GitCommit {
    sha: String,
    message: String,
    parents: Vec<ParentRef>,
}

#[derive(Debug, Deserialize)]
struct ParentRef {
    sha: String,
}

async fn get_commit(client: &OctocrabClient, sha: Sha) -> Result<GitHubResponse, GitHubApiError> {
    let route = client.route(&format!("/git/commits/{}", sha));
    let commit: GitCommit = client
        .inner()
        .get(route, None::<&()>)
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(GitHubResponse::Commit(CommitData {
        sha: Sha::new(commit.sha),
        parents: commit.parents.into_iter().map(|p| Sha::new(p.sha)).collect(),
        message: commit.message,
    }))
}

#[derive(Debug, Deserialize)]
struct Comparison {
    ahead_by: u64,
    behind_by: u64,
}

async fn compare(client: &OctocrabClient, base: Sha, head: Sha) -> Result<GitHubResponse, GitHubApiError> {
    let route = client.route(&format!("/compare/{}...{}", base, head));
    let comparison: Comparison = client
        .inner()
        .get(route, None::<&()>)
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(GitHubResponse::Comparison {
        ahead_by: comparison.ahead_by,
        behind_by: comparison.behind_by,
    })
}

// ─── Permissions and checks ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Collaborator {
    login: String,
}

async fn list_collaborators(client: &OctocrabClient) -> Result<GitHubResponse, GitHubApiError> {
    let mut page = 1u32;
    let mut all = Vec::new();

    loop {
        let route = client.route(&format!("/collaborators?per_page={}&page={}", PER_PAGE, page));
        let items: Vec<Collaborator> = client
            .inner()
            .get(route, None::<&()>)
            .await
            .map_err(GitHubApiError::from_octocrab)?;

        let is_last_page = items.len() < usize::from(PER_PAGE);
        all.extend(items.into_iter().map(|c| c.login));
        if is_last_page {
            break;
        }
        page += 1;
    }

    Ok(GitHubResponse::Collaborators(all))
}

/// Check-run re-requests answer 201 with an empty body, so the raw response
/// is only checked for its status.
async fn rerequest_check_run(
    client: &OctocrabClient,
    run_id: u64,
) -> Result<GitHubResponse, GitHubApiError> {
    let route = client.route(&format!("/check-runs/{}/rerequest", run_id));
    let response = client
        .inner()
        ._post(route, None::<&()>)
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    octocrab::map_github_error(response)
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(GitHubResponse::CheckRunRerequested)
}
