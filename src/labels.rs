//! Label transitions triggered by pull request events.
//!
//! The state machine only names the event; which labels it adds or removes
//! is per-repository configuration.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An event that may change a pull request's labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelEvent {
    Approved,
    Rejected,
    Conflict,
    Succeed,
    Failed,
    Try,
    TrySucceed,
    TryFailed,
    Exempted,
    TimedOut,
    Interrupted,
    Pushed,
}

impl LabelEvent {
    /// Key of the event in the `[repo.<label>.labels]` table.
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelEvent::Approved => "approved",
            LabelEvent::Rejected => "rejected",
            LabelEvent::Conflict => "conflict",
            LabelEvent::Succeed => "succeed",
            LabelEvent::Failed => "failed",
            LabelEvent::Try => "try",
            LabelEvent::TrySucceed => "try_succeed",
            LabelEvent::TryFailed => "try_failed",
            LabelEvent::Exempted => "exempted",
            LabelEvent::TimedOut => "timed_out",
            LabelEvent::Interrupted => "interrupted",
            LabelEvent::Pushed => "pushed",
        }
    }
}

impl fmt::Display for LabelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels to add and remove when an event fires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
    /// The rule is skipped entirely while any of these labels is present.
    #[serde(default)]
    pub unless: Vec<String>,
}

impl LabelRule {
    /// Computes the new label set, or `None` if nothing changes.
    pub fn apply(&self, current: &BTreeSet<String>) -> Option<BTreeSet<String>> {
        if self.unless.iter().any(|label| current.contains(label)) {
            return None;
        }

        let mut next = current.clone();
        for label in &self.remove {
            next.remove(label);
        }
        for label in &self.add {
            next.insert(label.clone());
        }

        (next != *current).then_some(next)
    }
}
