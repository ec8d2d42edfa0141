//! Per-repository state shared by all of its pull requests.

use serde::{Deserialize, Serialize};

use super::ids::{RepoId, RepoLabel};

/// Threshold value meaning "the tree is open".
pub const TREE_OPEN: i64 = -1;

/// Mutable state owned by one configured repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub label: RepoLabel,
    pub owner: String,
    pub name: String,
    /// Pull requests below this priority are held back; -1 when open.
    #[serde(default = "tree_open")]
    pub treeclosed: i64,
    /// Where the current threshold came from (usually a comment URL).
    #[serde(default)]
    pub treeclosed_source: Option<String>,
}

fn tree_open() -> i64 {
    TREE_OPEN
}

impl RepositoryRecord {
    pub fn new(label: RepoLabel, id: &RepoId) -> Self {
        RepositoryRecord {
            label,
            owner: id.owner.clone(),
            name: id.repo.clone(),
            treeclosed: TREE_OPEN,
            treeclosed_source: None,
        }
    }

    pub fn is_tree_closed(&self) -> bool {
        self.treeclosed >= 0
    }

    /// Returns true if a pull request with `priority` is held back.
    pub fn holds_back(&self, priority: i64) -> bool {
        self.is_tree_closed() && priority < self.treeclosed
    }

    /// Applies a new threshold. A negative threshold opens the tree.
    ///
    /// Returns true if anything changed.
    pub fn set_treeclosed(&mut self, threshold: i64, source: Option<String>) -> bool {
        let (threshold, source) = if threshold < 0 {
            (TREE_OPEN, None)
        } else {
            (threshold, source)
        };
        let changed = self.treeclosed != threshold || self.treeclosed_source != source;
        self.treeclosed = threshold;
        self.treeclosed_source = source;
        changed
    }
}
