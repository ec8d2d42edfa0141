//! Core domain types for the merge queue.
//!
//! Identifiers, per-pull-request state with its build history, and the
//! per-repository record.

pub mod ids;
pub mod pull;
pub mod repo;

pub use ids::{MIN_SHORT_SHA_LEN, PrNumber, RepoId, RepoLabel, Sha, is_sha, sha_cmp};
pub use pull::{
    AttemptState, BuildAttempt, BuildState, BuildTrack, BuilderResult, GithubState,
    PullRequestState, QueueStatus, RollupMode,
};
pub use repo::{RepositoryRecord, TREE_OPEN};
