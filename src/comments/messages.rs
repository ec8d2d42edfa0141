//! Texts of informational comments.
//!
//! None of these carry a state fragment: replaying them must not change
//! state.

use crate::types::{PrNumber, Sha};

/// Shown when a portal-style ping is answered.
pub const PORTAL_TURRET_DIALOG: [&str; 3] = ["Target acquired", "Activated", "There you are"];

pub const PORTAL_TURRET_IMAGE: &str = "https://cloud.githubusercontent.com/assets/1617736/22222924/c07b2a1c-e16d-11e6-91b3-ac659550585c.png";

pub fn insufficient_privileges(actor: &str, reason: &str) -> String {
    format!("@{}: :key: Insufficient privileges: {}", actor, reason)
}

/// Context for the "already approved" reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingContext {
    /// Nothing is being tested in the repository.
    Idle,
    /// This pull request is the one being tested.
    This,
    /// Another pull request is being tested.
    Other(PrNumber),
}

pub fn already_approved(previously_failed: bool, pending: PendingContext) -> String {
    let mut lines = vec![
        ":bulb: This pull request was already approved, no need to approve it again.".to_string(),
    ];
    let mut details = Vec::new();
    if previously_failed {
        details.push(
            "- This pull request previously failed. You should add more commits to fix the bug, \
             or use `retry` to trigger a build again."
                .to_string(),
        );
    }
    match pending {
        PendingContext::Idle => {}
        PendingContext::This => details.push(
            "- This pull request is currently being tested. If there's no response from the \
             continuous integration service, you may use `retry` to trigger a build again."
                .to_string(),
        ),
        PendingContext::Other(number) => details.push(format!(
            "- There's another pull request that is currently being tested, blocking this pull request: {}",
            number
        )),
    }
    if !details.is_empty() {
        lines.push(String::new());
        lines.extend(details);
    }
    lines.join("\n")
}

pub fn invalid_sha(pinned: &str, head: &Sha) -> String {
    format!(
        ":scream_cat: `{}` is not a valid commit SHA. Please try again with `{}`.",
        pinned,
        head.short()
    )
}

pub fn invalid_head_sha(head: &Sha) -> String {
    format!(":bangbang: Invalid head SHA found, retrying: `{}`", head)
}

pub fn priority_too_high(max_priority: i64) -> String {
    format!(":stop_sign: Priority higher than {} is ignored.", max_priority)
}

pub fn try_while_approved() -> String {
    ":no_entry: This pull request is approved and currently being tested. \
     Unapprove it first (`r-`) to request a try build."
        .to_string()
}

pub fn ping() -> String {
    ":sleepy: I'm awake I'm awake".to_string()
}

/// Picks the dialog line from the pull request number so replies are
/// reproducible.
pub fn portal_ping(number: PrNumber) -> String {
    let dialog = PORTAL_TURRET_DIALOG[(number.0 % PORTAL_TURRET_DIALOG.len() as u64) as usize];
    format!(":cake: {}\n\n![]({})", dialog, PORTAL_TURRET_IMAGE)
}

pub fn merge_conflict(base_ref: &str, head_ref: &str) -> String {
    format!(
        ":lock: Merge conflict\n\n\
         This pull request and the `{base}` branch diverged in a way that cannot be \
         automatically merged. Please rebase on top of the latest `{base}` branch, and \
         let the reviewer approve again.\n\n\
         <details><summary>How do I rebase?</summary>\n\n\
         ```sh\n\
         git fetch origin {base}\n\
         git checkout {head}\n\
         git rebase origin/{base}\n\
         git push --force-with-lease\n\
         ```\n\n\
         </details>",
        base = base_ref,
        head = head_ref,
    )
}

/// `blame` is a PR reference (`#123`) or a commit sha; empty when unknown.
pub fn unmergeable(blame: &str) -> String {
    let blame = if blame.is_empty() {
        String::new()
    } else {
        format!(" (presumably {})", blame)
    };
    format!(
        ":umbrella: The latest upstream changes{} made this pull request unmergeable. \
         Please resolve the merge conflicts.",
        blame
    )
}

pub fn exempted(reason: &str) -> String {
    format!(":zap: Test exempted: {}.", reason)
}

pub fn fast_forward_failed(error: &str) -> String {
    format!(
        ":eyes: Test was successful, but fast-forwarding failed: {}",
        error
    )
}

/// `(builder, url)` pairs for the reused and re-run builders.
pub fn rebuilding(reused: &[(String, String)], rerun: &[(String, String)]) -> String {
    let links = |builders: &[(String, String)]| {
        builders
            .iter()
            .map(|(name, url)| format!("[{}]({})", name, url))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        ":zap: Previous build results for {} are reusable. Rebuilding only {}...",
        links(reused),
        links(rerun)
    )
}

pub fn rebuild_failed(error: &str) -> String {
    format!(":bomb: Failed to start rebuilding: `{}`", error)
}

pub fn tree_closed(threshold: i64) -> String {
    format!(
        ":evergreen_tree: The tree is currently closed for pull requests below priority {}, \
         this pull request will be tested once the tree is reopened",
        threshold
    )
}

/// Ends with a hidden `r-` so that replaying history drops the approval too.
pub fn base_branch_changed(base_ref: &str, bot_name: &str) -> String {
    format!(
        ":warning: The base branch changed to `{}`, and the PR will need to be \
         re-approved.\n\n<!-- @{} r- -->",
        base_ref, bot_name
    )
}

pub fn build_interrupted() -> String {
    ":snowman: The build was interrupted to prioritize another pull request.".to_string()
}
