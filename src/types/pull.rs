//! Per-pull-request state and build history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{PrNumber, Sha};

/// State of one build track (regular builds or try builds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    #[default]
    None,
    Pending,
    Success,
    Failure,
    Error,
}

/// Final (or current) state of a single build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    Pending,
    Success,
    Failure,
    Error,
    #[serde(rename = "TIMEDOUT")]
    TimedOut,
    Cancelled,
}

/// State of the pull request on the hosting platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GithubState {
    #[default]
    Open,
    Closed,
    Merged,
}

/// How a pull request may be batched with others.
///
/// Ordered from least to most eager to be rolled up.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RollupMode {
    Never,
    Iffy,
    #[default]
    Default,
    Always,
}

impl RollupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupMode::Never => "never",
            RollupMode::Iffy => "iffy",
            RollupMode::Default => "default",
            RollupMode::Always => "always",
        }
    }
}

/// Which of the two build tracks an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildTrack {
    Build,
    Try,
}

/// Outcome reported by one builder for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderResult {
    pub success: bool,
    #[serde(default)]
    pub url: Option<String>,
    /// Check-run id, when the builder can be re-run through the API.
    #[serde(default)]
    pub run_id: Option<u64>,
}

/// One build or try build.
///
/// Mutable only while `state` is `Pending`; closed attempts are never
/// touched again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAttempt {
    pub head_sha: Sha,
    pub merge_sha: Sha,
    pub state: AttemptState,
    #[serde(default)]
    pub builder_results: BTreeMap<String, BuilderResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl BuildAttempt {
    pub fn start(head_sha: Sha, merge_sha: Sha, started_at: DateTime<Utc>) -> Self {
        BuildAttempt {
            head_sha,
            merge_sha,
            state: AttemptState::Pending,
            builder_results: BTreeMap::new(),
            started_at,
            ended_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == AttemptState::Pending
    }

    /// Closes a pending attempt. Returns false if it was already closed.
    pub fn close(&mut self, state: AttemptState, at: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = state;
        self.ended_at = Some(at);
        true
    }
}

/// Status as seen by the merge queue, combining build state and approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Approved,
    #[serde(rename = "")]
    Unreviewed,
    Error,
    Failure,
    Success,
}

impl QueueStatus {
    /// Position in the queue ordering; lower sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            QueueStatus::Pending => 0,
            QueueStatus::Approved => 1,
            QueueStatus::Unreviewed => 2,
            QueueStatus::Error => 3,
            QueueStatus::Failure => 4,
            QueueStatus::Success => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Approved => "approved",
            QueueStatus::Unreviewed => "",
            QueueStatus::Error => "error",
            QueueStatus::Failure => "failure",
            QueueStatus::Success => "success",
        }
    }
}

/// Everything tracked about one pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestState {
    pub number: PrNumber,
    pub head_sha: Sha,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub base_ref: String,
    #[serde(default)]
    pub head_ref: String,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub author: String,
    /// Empty when nobody holds delegated approval rights.
    #[serde(default)]
    pub delegate: String,
    /// Empty when unapproved.
    #[serde(default)]
    pub approved_by: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub rollup: RollupMode,
    #[serde(default)]
    pub is_try: bool,
    #[serde(default)]
    pub merge_sha: Option<Sha>,
    #[serde(default)]
    pub build_state: BuildState,
    #[serde(default)]
    pub try_state: BuildState,
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default)]
    pub github_state: GithubState,
    #[serde(default)]
    pub build_history: Vec<BuildAttempt>,
    #[serde(default)]
    pub try_history: Vec<BuildAttempt>,
    #[serde(default)]
    pub last_event_cursor: Option<String>,
}

impl PullRequestState {
    /// Creates an open, unapproved pull request at the given head.
    pub fn new(number: PrNumber, head_sha: Sha) -> Self {
        PullRequestState {
            number,
            head_sha,
            title: String::new(),
            body: String::new(),
            base_ref: String::new(),
            head_ref: String::new(),
            assignee: String::new(),
            author: String::new(),
            delegate: String::new(),
            approved_by: String::new(),
            priority: 0,
            rollup: RollupMode::Default,
            is_try: false,
            merge_sha: None,
            build_state: BuildState::None,
            try_state: BuildState::None,
            mergeable: None,
            github_state: GithubState::Open,
            build_history: Vec::new(),
            try_history: Vec::new(),
            last_event_cursor: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        !self.approved_by.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.github_state == GithubState::Open
    }

    /// The track the next build would run on.
    pub fn active_track(&self) -> BuildTrack {
        if self.is_try {
            BuildTrack::Try
        } else {
            BuildTrack::Build
        }
    }

    pub fn track_state(&self, track: BuildTrack) -> BuildState {
        match track {
            BuildTrack::Build => self.build_state,
            BuildTrack::Try => self.try_state,
        }
    }

    pub fn set_track_state(&mut self, track: BuildTrack, state: BuildState) {
        match track {
            BuildTrack::Build => self.build_state = state,
            BuildTrack::Try => self.try_state = state,
        }
    }

    /// State of the active track.
    pub fn status(&self) -> BuildState {
        self.track_state(self.active_track())
    }

    pub fn set_status(&mut self, state: BuildState) {
        self.set_track_state(self.active_track(), state);
    }

    pub fn queue_status(&self) -> QueueStatus {
        match self.status() {
            BuildState::None => {
                if self.is_approved() && self.mergeable != Some(false) {
                    QueueStatus::Approved
                } else {
                    QueueStatus::Unreviewed
                }
            }
            BuildState::Pending => QueueStatus::Pending,
            BuildState::Success => QueueStatus::Success,
            BuildState::Failure => QueueStatus::Failure,
            BuildState::Error => QueueStatus::Error,
        }
    }

    pub fn history(&self, track: BuildTrack) -> &[BuildAttempt] {
        match track {
            BuildTrack::Build => &self.build_history,
            BuildTrack::Try => &self.try_history,
        }
    }

    pub fn history_mut(&mut self, track: BuildTrack) -> &mut Vec<BuildAttempt> {
        match track {
            BuildTrack::Build => &mut self.build_history,
            BuildTrack::Try => &mut self.try_history,
        }
    }

    /// The most recent attempt on `track`, if it is still pending.
    pub fn pending_attempt_mut(&mut self, track: BuildTrack) -> Option<&mut BuildAttempt> {
        self.history_mut(track)
            .last_mut()
            .filter(|attempt| attempt.is_pending())
    }

    /// Builder results of the attempt that produced the current merge commit.
    pub fn builder_results(&self) -> Option<&BTreeMap<String, BuilderResult>> {
        let merge_sha = self.merge_sha.as_ref()?;
        self.history(self.active_track())
            .last()
            .filter(|attempt| &attempt.merge_sha == merge_sha)
            .map(|attempt| &attempt.builder_results)
    }

    /// Which track owns `sha` as its current merge commit.
    pub fn track_for_merge_sha(&self, sha: &Sha) -> Option<BuildTrack> {
        if self.merge_sha.as_ref() != Some(sha) {
            return None;
        }
        Some(self.active_track())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr() -> PullRequestState {
        PullRequestState::new(PrNumber(1), Sha::new("a".repeat(40)))
    }

    #[test]
    fn unapproved_idle_pr_is_unreviewed() {
        assert_eq!(pr().queue_status(), QueueStatus::Unreviewed);
    }

    #[test]
    fn approved_idle_pr_is_approved_unless_unmergeable() {
        let mut state = pr();
        state.approved_by = "alice".into();
        assert_eq!(state.queue_status(), QueueStatus::Approved);

        state.mergeable = Some(false);
        assert_eq!(state.queue_status(), QueueStatus::Unreviewed);
    }

    #[test]
    fn status_follows_active_track() {
        let mut state = pr();
        state.try_state = BuildState::Success;
        assert_eq!(state.status(), BuildState::None);

        state.is_try = true;
        assert_eq!(state.status(), BuildState::Success);
    }

    #[test]
    fn queue_status_ranks_are_ordered() {
        let order = [
            QueueStatus::Pending,
            QueueStatus::Approved,
            QueueStatus::Unreviewed,
            QueueStatus::Error,
            QueueStatus::Failure,
            QueueStatus::Success,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn closing_attempt_only_once() {
        let now = Utc::now();
        let mut attempt = BuildAttempt::start(Sha::new("a"), Sha::new("b"), now);
        assert!(attempt.close(AttemptState::Failure, now));
        assert!(!attempt.close(AttemptState::Success, now));
        assert_eq!(attempt.state, AttemptState::Failure);
    }

    #[test]
    fn builder_results_require_matching_merge_sha() {
        let mut state = pr();
        let now = Utc::now();
        let mut attempt = BuildAttempt::start(state.head_sha.clone(), Sha::new("m1"), now);
        attempt.builder_results.insert(
            "status-ci".into(),
            BuilderResult {
                success: true,
                url: None,
                run_id: None,
            },
        );
        state.build_history.push(attempt);

        assert!(state.builder_results().is_none());
        state.merge_sha = Some(Sha::new("m1"));
        assert_eq!(state.builder_results().map(|r| r.len()), Some(1));
    }

    #[test]
    fn attempt_state_serializes_timedout() {
        let json = serde_json::to_string(&AttemptState::TimedOut).unwrap();
        assert_eq!(json, "\"TIMEDOUT\"");
    }

    #[test]
    fn state_deserializes_with_defaults() {
        let json = r#"{"number": 7, "head_sha": "abcd"}"#;
        let state: PullRequestState = serde_json::from_str(json).unwrap();
        assert_eq!(state.number, PrNumber(7));
        assert_eq!(state.rollup, RollupMode::Default);
        assert!(state.is_open());
    }
}
