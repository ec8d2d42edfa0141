//! Shared test doubles and arbitrary generators for property-based testing.

use std::sync::Mutex;

use proptest::prelude::*;

use crate::effects::{GitHubEffect, GitHubInterpreter, GitHubResponse, PullData};
use crate::types::{GithubState, PrNumber, Sha};

#[derive(Debug, thiserror::Error)]
#[error("mock failure: {0}")]
pub struct MockError(pub String);

type Handler = Box<dyn Fn(&GitHubEffect) -> Result<GitHubResponse, MockError> + Send + Sync>;

/// An interpreter that answers from a closure and records every call.
pub struct MockGitHub {
    handler: Handler,
    calls: Mutex<Vec<GitHubEffect>>,
}

impl MockGitHub {
    pub fn new(
        handler: impl Fn(&GitHubEffect) -> Result<GitHubResponse, MockError> + Send + Sync + 'static,
    ) -> Self {
        MockGitHub {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every effect with a generic success.
    pub fn permissive() -> Self {
        MockGitHub::new(|effect| {
            Ok(match effect {
                GitHubEffect::PostComment { .. } => GitHubResponse::CommentPosted,
                GitHubEffect::GetLabels { .. } => GitHubResponse::Labels(Vec::new()),
                GitHubEffect::ReplaceLabels { .. } => GitHubResponse::LabelsReplaced,
                GitHubEffect::CreateStatus { .. } => GitHubResponse::StatusCreated,
                GitHubEffect::ListComments { .. } => GitHubResponse::Comments(Vec::new()),
                GitHubEffect::ListStatuses { .. } => GitHubResponse::Statuses(Vec::new()),
                GitHubEffect::ListOpenPulls => GitHubResponse::PullList(Vec::new()),
                GitHubEffect::ListCollaborators => GitHubResponse::Collaborators(Vec::new()),
                GitHubEffect::RerequestCheckRun { .. } => GitHubResponse::CheckRunRerequested,
                GitHubEffect::GetPull { pr } => GitHubResponse::Pull(pull_data(pr.0, &"a".repeat(40))),
                _ => GitHubResponse::RefUpdated,
            })
        })
    }

    pub fn calls(&self) -> Vec<GitHubEffect> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl GitHubInterpreter for MockGitHub {
    type Error = MockError;

    async fn interpret(&self, effect: GitHubEffect) -> Result<GitHubResponse, MockError> {
        let response = (self.handler)(&effect);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(effect);
        }
        response
    }
}

/// An open, mergeable pull request from `feature` into `main`.
pub fn pull_data(number: u64, head: &str) -> PullData {
    PullData {
        number: PrNumber(number),
        head_sha: Sha::new(head),
        head_ref: "contributor:feature".into(),
        base_ref: "main".into(),
        title: "Add feature".into(),
        body: "Adds the feature.".into(),
        author: "carol".into(),
        assignee: None,
        state: GithubState::Open,
        mergeable: Some(true),
        merge_commit_sha: None,
    }
}

pub fn arb_pr_number() -> impl Strategy<Value = PrNumber> {
    (1u64..100_000).prop_map(PrNumber)
}

pub fn arb_sha() -> impl Strategy<Value = Sha> {
    "[0-9a-f]{40}".prop_map(Sha::new)
}
