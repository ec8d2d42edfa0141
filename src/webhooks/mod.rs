//! Webhook handling for GitHub events.
//!
//! - Signature verification for webhook payloads (HMAC-SHA256)
//! - Parsing of the deliveries the bot acts on

pub mod events;
pub mod parser;
pub mod signature;

pub use events::{
    CheckRunEvent, CommentEvent, GitHubEvent, PrAction, PullRequestEvent, PushEvent,
    ReviewCommentEvent, StatusEvent,
};
pub use parser::{ParseError, parse_webhook, peek_repository};
pub use signature::{SIGNATURE_HEADER, SignatureError, sign, token_matches, verify};
