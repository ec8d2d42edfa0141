//! Bot configuration.
//!
//! Everything is loaded once from a TOML file and passed explicitly to the
//! components that need it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::AuthLevel;
use crate::labels::{LabelEvent, LabelRule};
use crate::types::{BuildTrack, RepoId, RepoLabel};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "MERGE_QUEUE_CONFIG";

/// Configuration file used when nothing else is specified.
pub const DEFAULT_CONFIG_PATH: &str = "merge-queue.toml";

/// Environment variable overriding `github.access_token`.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

const DEFAULT_MAX_PRIORITY: i64 = 9001;
const DEFAULT_QUEUE_INTERVAL_SECS: u64 = 60;
const DEFAULT_TIMEOUT_SECS: u64 = 4 * 60 * 60;
const DEFAULT_PORT: u16 = 54856;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Login the bot answers to, without `@`.
    pub bot_name: String,

    #[serde(default = "default_max_priority")]
    pub max_priority: i64,

    /// Where pull request and repository records are stored.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Seconds between scheduler passes when nothing pokes it earlier.
    #[serde(default = "default_queue_interval")]
    pub queue_interval_secs: u64,

    #[serde(default)]
    pub web: WebConfig,

    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default, rename = "repo")]
    pub repos: BTreeMap<RepoLabel, RepoConfig>,

    #[serde(default)]
    pub hooks: BTreeMap<String, HookConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this service, used to link the queue page.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bearer token for `POST /api/v1/rollup/{label}`. Rollups are disabled
    /// without one.
    #[serde(default)]
    pub rollup_token: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        WebConfig {
            host: default_host(),
            port: default_port(),
            base_url: None,
            rollup_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubConfig {
    #[serde(default)]
    pub access_token: String,
}

/// Branches merge commits are pushed to.
#[derive(Debug, Clone, Deserialize)]
pub struct BranchConfig {
    #[serde(default = "default_auto_branch")]
    pub auto: String,
    #[serde(default = "default_try_branch", rename = "try")]
    pub try_branch: String,
}

impl Default for BranchConfig {
    fn default() -> Self {
        BranchConfig {
            auto: default_auto_branch(),
            try_branch: default_try_branch(),
        }
    }
}

/// A builder reported through commit statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusBuilderConfig {
    pub context: String,
    /// Context that counts as equivalent on pull request commits.
    #[serde(default)]
    pub pr_context: Option<String>,
    #[serde(default = "default_true", rename = "try")]
    pub run_on_try: bool,
}

/// A builder reported through check runs.
#[derive(Debug, Clone, Deserialize)]
pub struct ChecksBuilderConfig {
    pub name: String,
    /// Check-run name used for try builds, if it differs.
    #[serde(default)]
    pub try_name: Option<String>,
    #[serde(default = "default_true", rename = "try")]
    pub run_on_try: bool,
}

/// A builder as tracked in build results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuilderSpec {
    Status { name: String, context: String },
    Checks { name: String, run_name: String },
}

impl BuilderSpec {
    pub fn name(&self) -> &str {
        match self {
            BuilderSpec::Status { name, .. } | BuilderSpec::Checks { name, .. } => name,
        }
    }
}

/// Configuration of one repository.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub try_users: Vec<String>,
    /// Treat repository collaborators as reviewers.
    #[serde(default)]
    pub auth_collaborators: bool,
    /// URL template of a team permission registry, with `{repo}` and
    /// `{level}` placeholders.
    #[serde(default)]
    pub team_registry: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub status_based_exemption: bool,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default)]
    pub branch: BranchConfig,
    #[serde(default)]
    pub status: BTreeMap<String, StatusBuilderConfig>,
    #[serde(default)]
    pub checks: BTreeMap<String, ChecksBuilderConfig>,
    #[serde(default)]
    pub labels: BTreeMap<String, LabelRule>,
}

impl RepoConfig {
    pub fn id(&self) -> RepoId {
        RepoId::new(&self.owner, &self.name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn branch_for(&self, track: BuildTrack) -> &str {
        match track {
            BuildTrack::Build => &self.branch.auto,
            BuildTrack::Try => &self.branch.try_branch,
        }
    }

    /// Builders that must report for a build on `track`.
    pub fn builders(&self, track: BuildTrack) -> Vec<BuilderSpec> {
        let is_try = track == BuildTrack::Try;
        let status = self
            .status
            .iter()
            .filter(|(_, cfg)| !is_try || cfg.run_on_try)
            .map(|(key, cfg)| BuilderSpec::Status {
                name: format!("status-{}", key),
                context: cfg.context.clone(),
            });
        let checks = self
            .checks
            .iter()
            .filter(|(_, cfg)| !is_try || cfg.run_on_try)
            .map(|(key, cfg)| BuilderSpec::Checks {
                name: format!("checks-{}", key),
                run_name: match (&cfg.try_name, is_try) {
                    (Some(try_name), true) => try_name.clone(),
                    _ => cfg.name.clone(),
                },
            });
        status.chain(checks).collect()
    }

    /// True when every builder reports through commit statuses.
    pub fn only_status_builders(&self) -> bool {
        !self.status.is_empty() && self.checks.is_empty()
    }

    /// Builder of `track` reporting through the status `context`.
    pub fn status_builder_for(&self, context: &str, track: BuildTrack) -> Option<String> {
        self.builders(track).into_iter().find_map(|builder| match builder {
            BuilderSpec::Status { name, context: c } if c == context => Some(name),
            _ => None,
        })
    }

    /// Builder of `track` reporting through check runs named `run_name`.
    pub fn checks_builder_for(&self, run_name: &str, track: BuildTrack) -> Option<String> {
        self.builders(track).into_iter().find_map(|builder| match builder {
            BuilderSpec::Checks { name, run_name: r } if r == run_name => Some(name),
            _ => None,
        })
    }

    /// Pull-request context to required context, for status exemption.
    pub fn status_equivalences(&self) -> BTreeMap<String, String> {
        self.status
            .values()
            .map(|cfg| {
                let pr_context = cfg.pr_context.clone().unwrap_or_else(|| cfg.context.clone());
                (pr_context, cfg.context.clone())
            })
            .collect()
    }

    pub fn label_rule(&self, event: LabelEvent) -> Option<&LabelRule> {
        self.labels.get(event.as_str())
    }
}

/// A command that calls out to an external endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    pub endpoint: String,
    #[serde(default = "default_hook_access")]
    pub access: AuthLevel,
    /// Post the endpoint's response body as a comment.
    #[serde(default)]
    pub has_response: bool,
    /// Only run for live comments, never while replaying history.
    #[serde(default)]
    pub realtime: bool,
}

impl Config {
    /// Loads configuration from `path`, applying environment overrides.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Config::from_toml_str(&content)?;
        if let Ok(token) = std::env::var(GITHUB_TOKEN_ENV) {
            if !token.is_empty() {
                config.github.access_token = token;
            }
        }
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(content: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the configuration path from an explicit argument, the
    /// environment, or the default.
    pub fn resolve_path(arg: Option<String>) -> PathBuf {
        arg.or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_name.trim().is_empty() {
            return Err(ConfigError::Invalid("bot_name must not be empty".into()));
        }
        for (label, repo) in &self.repos {
            if repo.owner.is_empty() || repo.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "repo.{} needs both owner and name",
                    label
                )));
            }
        }
        for (name, hook) in &self.hooks {
            if hook.endpoint.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "hooks.{} needs an endpoint",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.hooks.keys().cloned().collect()
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_secs(self.queue_interval_secs)
    }

    /// Link to the queue page of a repository, or empty without a base URL.
    pub fn queue_url(&self, label: &RepoLabel) -> String {
        match &self.web.base_url {
            Some(base) => format!("{}/queue/{}", base.trim_end_matches('/'), label),
            None => String::new(),
        }
    }

    /// Finds the configured repository for an owner/name pair.
    pub fn find_repo(&self, owner: &str, name: &str) -> Option<(&RepoLabel, &RepoConfig)> {
        self.repos
            .iter()
            .find(|(_, repo)| repo.id().matches(owner, name))
    }
}

fn default_max_priority() -> i64 {
    DEFAULT_MAX_PRIORITY
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_queue_interval() -> u64 {
    DEFAULT_QUEUE_INTERVAL_SECS
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_auto_branch() -> String {
    "auto".to_string()
}

fn default_try_branch() -> String {
    "try".to_string()
}

fn default_true() -> bool {
    true
}

fn default_hook_access() -> AuthLevel {
    AuthLevel::Try
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
bot_name = "bors"
max_priority = 100

[web]
base_url = "https://bors.example.com/"

[repo.widgets]
owner = "octo"
name = "widgets"
reviewers = ["alice"]
try_users = ["bob"]
status_based_exemption = true

[repo.widgets.status.ci]
context = "ci/full"
pr_context = "ci/pr"

[repo.widgets.status.lint]
context = "lint"
try = false

[repo.widgets.labels.approved]
add = ["S-waiting-on-bors"]
remove = ["S-waiting-on-review"]

[repo.gadgets]
owner = "octo"
name = "gadgets"

[repo.gadgets.checks.gha]
name = "bors build finished"
try_name = "bors try finished"

[hooks.deploy]
endpoint = "https://deploy.example.com/hook"
access = "reviewer"
has_response = true
"#;

    fn sample() -> Config {
        Config::from_toml_str(SAMPLE).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let config = sample();
        assert_eq!(config.max_priority, 100);
        assert_eq!(config.queue_interval_secs, 60);
        assert_eq!(config.web.port, 54856);
        let widgets = &config.repos[&RepoLabel::new("widgets")];
        assert_eq!(widgets.timeout_secs, 14400);
        assert_eq!(widgets.branch.auto, "auto");
        assert_eq!(widgets.branch.try_branch, "try");
    }

    #[test]
    fn try_builds_skip_opted_out_builders() {
        let config = sample();
        let widgets = &config.repos[&RepoLabel::new("widgets")];
        let names = |track| -> Vec<String> {
            widgets
                .builders(track)
                .iter()
                .map(|b| b.name().to_string())
                .collect()
        };
        assert_eq!(names(BuildTrack::Build), vec!["status-ci", "status-lint"]);
        assert_eq!(names(BuildTrack::Try), vec!["status-ci"]);
        assert!(widgets.only_status_builders());
    }

    #[test]
    fn status_lookup_respects_track() {
        let config = sample();
        let widgets = &config.repos[&RepoLabel::new("widgets")];
        assert_eq!(
            widgets.status_builder_for("lint", BuildTrack::Build),
            Some("status-lint".to_string())
        );
        assert_eq!(widgets.status_builder_for("lint", BuildTrack::Try), None);
        assert_eq!(
            widgets.status_builder_for("ci/full", BuildTrack::Try),
            Some("status-ci".to_string())
        );
        assert_eq!(widgets.status_builder_for("ci/pr", BuildTrack::Build), None);
    }

    #[test]
    fn checks_builders_use_try_name() {
        let config = sample();
        let gadgets = &config.repos[&RepoLabel::new("gadgets")];
        assert_eq!(
            gadgets.checks_builder_for("bors try finished", BuildTrack::Try),
            Some("checks-gha".to_string())
        );
        assert_eq!(
            gadgets.checks_builder_for("bors try finished", BuildTrack::Build),
            None
        );
        assert!(!gadgets.only_status_builders());
    }

    #[test]
    fn status_equivalences_map_pr_context() {
        let config = sample();
        let widgets = &config.repos[&RepoLabel::new("widgets")];
        let eq = widgets.status_equivalences();
        assert_eq!(eq.get("ci/pr"), Some(&"ci/full".to_string()));
        assert_eq!(eq.get("lint"), Some(&"lint".to_string()));
    }

    #[test]
    fn label_rules_by_event() {
        let config = sample();
        let widgets = &config.repos[&RepoLabel::new("widgets")];
        assert!(widgets.label_rule(LabelEvent::Approved).is_some());
        assert!(widgets.label_rule(LabelEvent::Rejected).is_none());
    }

    #[test]
    fn queue_url_trims_trailing_slash() {
        let config = sample();
        assert_eq!(
            config.queue_url(&RepoLabel::new("widgets")),
            "https://bors.example.com/queue/widgets"
        );
    }

    #[test]
    fn hooks_are_parsed() {
        let config = sample();
        assert_eq!(config.hook_names(), vec!["deploy".to_string()]);
        assert_eq!(config.hooks["deploy"].access, AuthLevel::Reviewer);
        assert!(!config.hooks["deploy"].realtime);
    }

    #[test]
    fn find_repo_is_case_insensitive() {
        let config = sample();
        let (label, _) = config.find_repo("Octo", "Widgets").unwrap();
        assert_eq!(label.as_str(), "widgets");
    }

    #[test]
    fn missing_owner_is_rejected() {
        let result = Config::from_toml_str("bot_name = \"bors\"\n[repo.x]\nowner = \"\"\nname = \"y\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn empty_bot_name_is_rejected() {
        assert!(matches!(
            Config::from_toml_str("bot_name = \" \""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.bot_name, "bors");
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
