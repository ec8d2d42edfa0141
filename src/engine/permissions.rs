//! Cached collaborator and team membership.
//!
//! Authorization runs synchronously inside the state machine, so the
//! network lookups it depends on are done ahead of time and cached here.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::RwLock;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::{AuthLevel, PermissionSource};
use crate::config::RepoConfig;
use crate::effects::{GitHubEffect, GitHubInterpreter, GitHubResponse};

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("listing collaborators failed: {0}")]
    Collaborators(String),

    #[error("team registry request failed: {0}")]
    Registry(#[from] reqwest::Error),
}

/// Logins are stored lowercased.
#[derive(Debug, Default)]
pub struct PermissionCache {
    collaborators: RwLock<BTreeSet<String>>,
    teams: RwLock<BTreeMap<AuthLevel, BTreeSet<String>>>,
}

impl PermissionCache {
    pub fn new() -> Self {
        PermissionCache::default()
    }

    pub fn set_collaborators(&self, logins: impl IntoIterator<Item = String>) {
        if let Ok(mut collaborators) = self.collaborators.write() {
            *collaborators = logins.into_iter().map(|l| l.to_lowercase()).collect();
        }
    }

    pub fn set_team(&self, level: AuthLevel, logins: impl IntoIterator<Item = String>) {
        if let Ok(mut teams) = self.teams.write() {
            teams.insert(level, logins.into_iter().map(|l| l.to_lowercase()).collect());
        }
    }

    /// Re-reads every source the repository is configured to use.
    ///
    /// A failing source keeps its previous contents.
    pub async fn refresh<I>(&self, repo: &RepoConfig, github: &I, http: &reqwest::Client)
    where
        I: GitHubInterpreter,
        I::Error: Display,
    {
        if repo.auth_collaborators {
            match list_collaborators(github).await {
                Ok(logins) => {
                    debug!(repo = %repo.id(), count = logins.len(), "Collaborators refreshed");
                    self.set_collaborators(logins);
                }
                Err(e) => warn!(repo = %repo.id(), error = %e, "Could not refresh collaborators"),
            }
        }

        if let Some(template) = &repo.team_registry {
            for level in [AuthLevel::Try, AuthLevel::Reviewer] {
                let url = registry_url(template, &repo.name, level);
                match fetch_team(http, &url).await {
                    Ok(logins) => self.set_team(level, logins),
                    Err(e) => warn!(repo = %repo.id(), level = level.as_str(), error = %e, "Could not refresh team"),
                }
            }
        }
    }
}

impl PermissionSource for PermissionCache {
    fn is_collaborator(&self, user: &str) -> bool {
        self.collaborators
            .read()
            .is_ok_and(|c| c.contains(&user.to_lowercase()))
    }

    fn in_team(&self, user: &str, level: AuthLevel) -> bool {
        let user = user.to_lowercase();
        // Reviewers may do anything try users may
        self.teams.read().is_ok_and(|teams| {
            teams
                .iter()
                .filter(|(granted, _)| **granted >= level)
                .any(|(_, members)| members.contains(&user))
        })
    }
}

async fn list_collaborators<I>(github: &I) -> Result<Vec<String>, PermissionError>
where
    I: GitHubInterpreter,
    I::Error: Display,
{
    match github.interpret(GitHubEffect::ListCollaborators).await {
        Ok(GitHubResponse::Collaborators(logins)) => Ok(logins),
        Ok(other) => Err(PermissionError::Collaborators(format!("unexpected response {:?}", other))),
        Err(e) => Err(PermissionError::Collaborators(e.to_string())),
    }
}

/// Fills `{repo}` and `{level}` in a registry URL template.
pub fn registry_url(template: &str, repo_name: &str, level: AuthLevel) -> String {
    template
        .replace("{repo}", &urlencoding::encode(repo_name))
        .replace("{level}", &urlencoding::encode(level.as_str()))
}

#[derive(Debug, Deserialize)]
struct TeamResponse {
    #[serde(default)]
    github_users: Vec<String>,
}

async fn fetch_team(http: &reqwest::Client, url: &str) -> Result<Vec<String>, PermissionError> {
    let response: TeamResponse = http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(response.github_users)
}
