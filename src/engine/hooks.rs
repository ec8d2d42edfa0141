//! Outgoing calls for configured hook commands.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::HookConfig;
use crate::types::{PrNumber, RepoLabel};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Body POSTed to a hook endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookPayload<'a> {
    pub pull: u64,
    pub repo: &'a str,
    pub extra: Option<&'a str>,
    /// The full comment that triggered the hook.
    pub body: &'a str,
}

impl<'a> HookPayload<'a> {
    pub fn new(pr: PrNumber, repo: &'a RepoLabel, extra: Option<&'a str>, body: &'a str) -> Self {
        HookPayload {
            pull: pr.0,
            repo: repo.as_str(),
            extra,
            body,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HookClient {
    http: reqwest::Client,
}

impl HookClient {
    pub fn new(http: reqwest::Client) -> Self {
        HookClient { http }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Calls the hook. Returns the text to post back on the pull request,
    /// if the hook is configured to answer.
    ///
    /// Only realtime hooks may answer; the others also run while history is
    /// being replayed, where a comment would be posted again on every start.
    pub async fn trigger(
        &self,
        name: &str,
        hook: &HookConfig,
        payload: &HookPayload<'_>,
    ) -> Result<Option<String>, HookError> {
        info!(hook = name, pr = payload.pull, "Triggering hook");
        let response = self
            .http
            .post(&hook.endpoint)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        let text = response.text().await?;
        debug!(hook = name, bytes = text.len(), "Hook answered");

        Ok((hook.has_response && hook.realtime && !text.trim().is_empty()).then_some(text))
    }
}
