//! Background work that runs beside webhook processing.
//!
//! - [`mergeability`]: a single consumer resolving `mergeable` flags
//! - [`timeout`]: cancellable per-pull-request build timers

pub mod mergeability;
pub mod timeout;

pub use mergeability::{MergeabilityHost, MergeabilityJob, RECHECK_DELAY, fetch_mergeable};
pub use timeout::TimeoutRegistry;
