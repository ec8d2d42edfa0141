//! Command parsing for bot commands.
//!
//! Users drive the bot with short commands following a mention of its name:
//!
//! - `r+`, `r=<user>`, `r+ <sha>` - approve (optionally pinned to a commit)
//! - `r-` - unapprove
//! - `p=<n>` - set priority
//! - `delegate=<user>`, `delegate+`, `delegate-` - manage delegated approval
//! - `try`, `try-`, `retry`, `force`, `clean` - build control
//! - `rollup`, `rollup-`, `rollup=never|iffy|maybe|always` - rollup disposition
//! - `treeclosed=<n>`, `treeclosed-` - close or open the tree
//! - `ping`, `hello?`, `are you still there?` - liveness
//! - `<hook>[=<extra>]` - configured hooks
//!
//! # Example
//!
//! ```
//! use merge_queue::commands::{Command, CommentSource, parse_commands};
//!
//! let source = CommentSource { actor: "alice", pinned_sha: None };
//! let comment = "Looks good to me.\n\n@bors r+";
//! assert_eq!(
//!     parse_commands(source, comment, "bors", &[]),
//!     vec![Command::Approve { approver: "alice".into(), sha: None }]
//! );
//! ```

mod parser;
mod types;

pub use parser::{CommentSource, parse_commands};
pub use types::{Command, PingKind, rollup_mode_for};
