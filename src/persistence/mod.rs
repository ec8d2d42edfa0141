//! Persistence layer.
//!
//! State is saved after every change and reloaded at startup, before the
//! bot resynchronizes with GitHub. All writes are crash-safe: whole files
//! are replaced atomically and the retry log only ever grows.

pub mod atomic;
pub mod store;

pub use atomic::{fsync_dir, write_atomic};
pub use store::{JsonFileStore, SCHEMA_VERSION, StateStore, StoreError};
