//! Authorization of command authors.
//!
//! [`authorize`] is pure: collaborator and team membership come from a
//! [`PermissionSource`], which in production is a cache refreshed by the
//! engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comments::messages;
use crate::config::RepoConfig;
use crate::types::PullRequestState;

/// Privilege levels, from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthLevel {
    None,
    Try,
    Reviewer,
}

impl AuthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthLevel::None => "none",
            AuthLevel::Try => "try",
            AuthLevel::Reviewer => "reviewer",
        }
    }
}

/// External membership lookups.
pub trait PermissionSource {
    /// Whether `user` is a collaborator on the repository.
    fn is_collaborator(&self, user: &str) -> bool;

    /// Whether the team registry grants `user` at least `level`.
    fn in_team(&self, user: &str, level: AuthLevel) -> bool;
}

/// A source that grants nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPermissions;

impl PermissionSource for NoPermissions {
    fn is_collaborator(&self, _user: &str) -> bool {
        false
    }

    fn in_team(&self, _user: &str, _level: AuthLevel) -> bool {
        false
    }
}

/// Why an actor was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    CollaboratorRequired,
    NotInReviewers,
    NotInTryUsers,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DenialReason::CollaboratorRequired => "Collaborator required",
            DenialReason::NotInReviewers => "Not in reviewers",
            DenialReason::NotInTryUsers => "not in try users",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("{actor} has insufficient privileges: {reason}")]
    InsufficientPrivilege { actor: String, reason: DenialReason },
}

impl AuthorizationError {
    /// The reply posted on the pull request.
    pub fn comment(&self) -> String {
        match self {
            AuthorizationError::InsufficientPrivilege { actor, reason } => {
                messages::insufficient_privileges(actor, &reason.to_string())
            }
        }
    }
}

fn in_list(list: &[String], user: &str) -> bool {
    list.iter().any(|name| name.eq_ignore_ascii_case(user))
}

/// Checks that `actor` holds at least `required` on this pull request.
pub fn authorize(
    actor: &str,
    repo: &RepoConfig,
    state: &PullRequestState,
    required: AuthLevel,
    bot_name: &str,
    permissions: &dyn PermissionSource,
) -> Result<(), AuthorizationError> {
    if required == AuthLevel::None || actor.eq_ignore_ascii_case(bot_name) {
        return Ok(());
    }

    let granted = (repo.auth_collaborators && permissions.is_collaborator(actor))
        || (repo.team_registry.is_some() && permissions.in_team(actor, required))
        || (!state.delegate.is_empty() && state.delegate.eq_ignore_ascii_case(actor))
        || in_list(&repo.reviewers, actor)
        || (required == AuthLevel::Try && in_list(&repo.try_users, actor));

    if granted {
        return Ok(());
    }

    let reason = match required {
        AuthLevel::Reviewer if repo.auth_collaborators => DenialReason::CollaboratorRequired,
        AuthLevel::Reviewer => DenialReason::NotInReviewers,
        _ => DenialReason::NotInTryUsers,
    };
    Err(AuthorizationError::InsufficientPrivilege {
        actor: actor.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{PrNumber, RepoLabel, Sha};

    fn repo(extra: &str) -> RepoConfig {
        let text = format!(
            "bot_name = \"bors\"\n[repo.r]\nowner = \"o\"\nname = \"r\"\n\
             reviewers = [\"Alice\"]\ntry_users = [\"bob\"]\n{}",
            extra
        );
        Config::from_toml_str(&text).unwrap().repos[&RepoLabel::new("r")].clone()
    }

    fn pr() -> PullRequestState {
        PullRequestState::new(PrNumber(7), Sha::new("a".repeat(40)))
    }

    struct Collaborators(Vec<&'static str>);

    impl PermissionSource for Collaborators {
        fn is_collaborator(&self, user: &str) -> bool {
            self.0.contains(&user)
        }

        fn in_team(&self, user: &str, level: AuthLevel) -> bool {
            level == AuthLevel::Try && self.0.contains(&user)
        }
    }

    #[test]
    fn bot_is_always_authorized() {
        let result = authorize("BORS", &repo(""), &pr(), AuthLevel::Reviewer, "bors", &NoPermissions);
        assert!(result.is_ok());
    }

    #[test]
    fn reviewers_match_case_insensitively() {
        let result = authorize("alice", &repo(""), &pr(), AuthLevel::Reviewer, "bors", &NoPermissions);
        assert!(result.is_ok());
    }

    #[test]
    fn reviewers_have_try() {
        assert!(authorize("alice", &repo(""), &pr(), AuthLevel::Try, "bors", &NoPermissions).is_ok());
    }

    #[test]
    fn try_users_cannot_review() {
        let err = authorize("bob", &repo(""), &pr(), AuthLevel::Reviewer, "bors", &NoPermissions)
            .unwrap_err();
        assert_eq!(err.comment(), "@bob: :key: Insufficient privileges: Not in reviewers");
        assert!(authorize("bob", &repo(""), &pr(), AuthLevel::Try, "bors", &NoPermissions).is_ok());
    }

    #[test]
    fn strangers_are_not_try_users() {
        let err = authorize("eve", &repo(""), &pr(), AuthLevel::Try, "bors", &NoPermissions)
            .unwrap_err();
        assert_eq!(err.comment(), "@eve: :key: Insufficient privileges: not in try users");
    }

    #[test]
    fn delegate_is_authorized() {
        let mut state = pr();
        state.delegate = "Carol".into();
        assert!(authorize("carol", &repo(""), &state, AuthLevel::Reviewer, "bors", &NoPermissions).is_ok());
    }

    #[test]
    fn collaborators_when_enabled() {
        let cfg = repo("auth_collaborators = true\n");
        let source = Collaborators(vec!["dave"]);
        assert!(authorize("dave", &cfg, &pr(), AuthLevel::Reviewer, "bors", &source).is_ok());

        let err = authorize("eve", &cfg, &pr(), AuthLevel::Reviewer, "bors", &source).unwrap_err();
        assert_eq!(err.comment(), "@eve: :key: Insufficient privileges: Collaborator required");
    }

    #[test]
    fn collaborators_ignored_when_disabled() {
        let source = Collaborators(vec!["dave"]);
        assert!(authorize("dave", &repo(""), &pr(), AuthLevel::Reviewer, "bors", &source).is_err());
    }

    #[test]
    fn team_registry_grants_per_level() {
        let cfg = repo("team_registry = \"https://team.example.com/{repo}/{level}\"\n");
        let source = Collaborators(vec!["frank"]);
        assert!(authorize("frank", &cfg, &pr(), AuthLevel::Try, "bors", &source).is_ok());
        assert!(authorize("frank", &cfg, &pr(), AuthLevel::Reviewer, "bors", &source).is_err());
    }

    #[test]
    fn levels_are_ordered() {
        assert!(AuthLevel::None < AuthLevel::Try);
        assert!(AuthLevel::Try < AuthLevel::Reviewer);
    }
}
