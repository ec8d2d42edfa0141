//! Pure state logic for the merge queue.
//!
//! This module contains the functional core: how events, commands and build
//! results change one pull request. All I/O is described by the returned
//! [`ChangeResult`](crate::effects::ChangeResult) and performed elsewhere.

pub mod builds;
pub mod commands;
pub mod events;
pub mod machine;
pub mod resync;

pub use builds::STATUS_CONTEXT;
pub use commands::{process_command, wip_keyword};
pub use events::{Event, IncomingComment};
pub use machine::{EventContext, process_event};
pub use resync::apply_state_comment;
