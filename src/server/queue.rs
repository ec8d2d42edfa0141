//! Queue listing endpoint.

use std::fmt::Display;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use super::AppState;
use crate::effects::GitHubInterpreter;
use crate::engine::QueueSnapshot;
use crate::types::RepoLabel;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no repository configured as {0}")]
    NotFound(String),
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let status = match &self {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, self.to_string()).into_response()
    }
}

/// Returns the repository's open pull requests in the order the scheduler
/// considers them, with the tree-closed threshold.
///
/// ```ignore
/// GET /api/v1/queue/widgets HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: application/json
///
/// {"label": "widgets", "treeclosed": -1, "treeclosed_source": null, "pulls": [...]}
/// ```
pub async fn queue_handler<I>(
    State(app_state): State<AppState<I>>,
    Path(label): Path<String>,
) -> Result<Json<QueueSnapshot>, QueueError>
where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    app_state
        .engine()
        .queue(&RepoLabel::new(label.as_str()))
        .await
        .map(Json)
        .ok_or(QueueError::NotFound(label))
}
