//! HTTP server for the merge queue bot.
//!
//! # Endpoints
//!
//! - `POST /webhook` - Accepts GitHub webhook deliveries (returns 202 Accepted)
//! - `GET /api/v1/queue/{label}` - Returns a repository's queue as JSON
//! - `GET /queue/{label}` - Same listing, at the address used in bot comments
//! - `POST /api/v1/rollup/{label}` - Opens a rollup pull request (bearer token)
//! - `GET /health` - Returns 200 if server is running

use std::fmt::Display;
use std::sync::Arc;

use crate::effects::GitHubInterpreter;
use crate::engine::Engine;

pub mod health;
pub mod queue;
pub mod rollup;
pub mod webhook;

pub use health::health_handler;
pub use queue::queue_handler;
pub use rollup::rollup_handler;
pub use webhook::webhook_handler;

/// Shared application state, passed to handlers via axum's `State`
/// extractor.
pub struct AppState<I> {
    engine: Arc<Engine<I>>,
}

// Derived Clone would require `I: Clone`.
impl<I> Clone for AppState<I> {
    fn clone(&self) -> Self {
        AppState {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<I> AppState<I> {
    pub fn new(engine: Arc<Engine<I>>) -> Self {
        AppState { engine }
    }

    pub fn engine(&self) -> &Arc<Engine<I>> {
        &self.engine
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<I>(app_state: AppState<I>) -> axum::Router
where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook", post(webhook_handler::<I>))
        .route("/api/v1/queue/{label}", get(queue_handler::<I>))
        .route("/queue/{label}", get(queue_handler::<I>))
        .route("/api/v1/rollup/{label}", post(rollup_handler::<I>))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
