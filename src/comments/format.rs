//! Markdown rendering of state comments.

use std::collections::BTreeMap;

use super::StateComment;
use super::fragment::format_fragment;

/// Renders the visible text of a state comment followed by its fragment.
pub fn render_state_comment(comment: &StateComment, bot_name: &str) -> String {
    let text = render_text(comment, bot_name);
    match format_fragment(comment) {
        Some(fragment) => format!("{}\n{}", text, fragment),
        None => text,
    }
}

/// Renders only the human-readable part of a state comment.
pub fn render_text(comment: &StateComment, bot_name: &str) -> String {
    match comment {
        StateComment::Approved {
            sha,
            approver,
            queue,
        } => {
            let mut text = format!(
                ":pushpin: Commit {} has been approved by `{}`\n\n",
                sha.short(),
                approver
            );
            if !queue.is_empty() {
                text.push_str(&format!(
                    "It is now in the [queue]({}) for this repository.\n\n",
                    queue
                ));
            }
            // Hidden note-to-self pinning the full head sha.
            text.push_str(&format!("<!-- @{} r={} {} -->", bot_name, approver, sha));
            text
        }
        StateComment::ApprovalIgnoredWip { wip_keyword, .. } => format!(
            ":clipboard: Looks like this PR is still in progress, ignoring approval.\n\n\
             Hint: Remove **{}** from this PR's title when it is ready for review.",
            wip_keyword
        ),
        StateComment::Delegated {
            delegator,
            delegate,
        } => format!(
            ":v: @{delegate}, you can now approve this pull request!\n\n\
             If @{delegator} told you to \"`r=me`\" after making some further change, \
             please make that change, then do `@{bot_name} r=@{delegator}`",
        ),
        StateComment::BuildStarted {
            head_sha,
            merge_sha,
            ..
        } => format!(":hourglass: Testing commit {} with merge {}...", head_sha, merge_sha),
        StateComment::TryBuildStarted {
            head_sha,
            merge_sha,
            ..
        } => format!(":hourglass: Trying commit {} with merge {}...", head_sha, merge_sha),
        StateComment::BuildCompleted {
            approved_by,
            base_ref,
            builders,
            merge_sha,
            ..
        } => format!(
            ":sunny: Test successful - {}\nApproved by: {}\nPushing {} to {}...",
            builder_links(builders),
            approved_by,
            merge_sha,
            base_ref
        ),
        StateComment::TryBuildCompleted {
            builders,
            merge_sha,
            ..
        } => format!(
            ":sunny: Try build successful - {}\nBuild commit: {} (`{}`)",
            builder_links(builders),
            merge_sha,
            merge_sha
        ),
        StateComment::BuildFailed {
            builder_url,
            builder_name,
            ..
        }
        | StateComment::TryBuildFailed {
            builder_url,
            builder_name,
            ..
        } => format!(
            ":broken_heart: Test failed - [{}]({})",
            builder_name, builder_url
        ),
        StateComment::TimedOut { .. } => ":boom: Test timed out".to_string(),
    }
}

/// `[name](url), ...` in builder-name order.
pub fn builder_links(builders: &BTreeMap<String, String>) -> String {
    builders
        .iter()
        .map(|(name, url)| format!("[{}]({})", name, url))
        .collect::<Vec<_>>()
        .join(", ")
}
