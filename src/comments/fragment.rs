//! Machine-readable fragments embedded in bot comments.
//!
//! A fragment is a single-line HTML comment holding the compact JSON of a
//! [`StateComment`]:
//!
//! ```text
//! <!-- homu: {"type":"TryBuildStarted","head_sha":"...","merge_sha":"..."} -->
//! ```

use thiserror::Error;

use super::StateComment;

/// The marker that begins a fragment.
pub const FRAGMENT_START: &str = "<!-- homu: ";

/// The marker that ends a fragment.
pub const FRAGMENT_END: &str = " -->";

/// Errors that can occur when parsing a fragment.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A start marker without a matching end marker.
    #[error("unterminated state fragment")]
    Unterminated,

    /// The JSON portion of the fragment is malformed.
    #[error("invalid JSON in state fragment: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Serializes `comment` into a fragment, or `None` if it cannot be encoded.
pub fn format_fragment(comment: &StateComment) -> Option<String> {
    match serde_json::to_string(comment) {
        Ok(json) => Some(format!("{}{}{}", FRAGMENT_START, json, FRAGMENT_END)),
        Err(e) => {
            tracing::error!(kind = comment.kind(), error = %e, "Failed to encode state fragment");
            None
        }
    }
}

/// Extracts every fragment from a comment body, in order of appearance.
///
/// Each fragment is parsed independently; one malformed fragment does not
/// hide the others.
pub fn extract_fragments(body: &str) -> Vec<Result<StateComment, ParseError>> {
    let mut fragments = Vec::new();
    let mut rest = body;

    while let Some(start) = rest.find(FRAGMENT_START) {
        let json_start = start + FRAGMENT_START.len();
        let Some(end) = rest[json_start..].find(FRAGMENT_END) else {
            fragments.push(Err(ParseError::Unterminated));
            break;
        };
        let json = &rest[json_start..json_start + end];
        fragments.push(serde_json::from_str(json).map_err(ParseError::from));
        rest = &rest[json_start + end + FRAGMENT_END.len()..];
    }

    fragments
}
