//! Rollup endpoint.

use std::fmt::Display;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use super::AppState;
use crate::effects::GitHubInterpreter;
use crate::scheduler::{RollupError, RollupReport};
use crate::types::{PrNumber, RepoLabel};
use crate::webhooks::token_matches;

/// Optional request body; without `nums` every approved `rollup=always`
/// pull request is rolled up.
#[derive(Debug, Default, Deserialize)]
pub struct RollupRequest {
    #[serde(default)]
    pub nums: Vec<u64>,
}

#[derive(Debug, Error)]
pub enum RollupEndpointError {
    #[error("rollups are disabled")]
    Disabled,

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("no repository configured as {0}")]
    NotFound(String),

    #[error("invalid request body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error(transparent)]
    Rollup(#[from] RollupError),
}

impl IntoResponse for RollupEndpointError {
    fn into_response(self) -> Response {
        let status = match &self {
            RollupEndpointError::Disabled => StatusCode::NOT_FOUND,
            RollupEndpointError::Unauthorized => StatusCode::UNAUTHORIZED,
            RollupEndpointError::NotFound(_) => StatusCode::NOT_FOUND,
            RollupEndpointError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            RollupEndpointError::Rollup(RollupError::Scheduler(_)) => StatusCode::BAD_GATEWAY,
            RollupEndpointError::Rollup(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        (status, self.to_string()).into_response()
    }
}

/// Opens a rollup pull request.
///
/// ```ignore
/// POST /api/v1/rollup/widgets HTTP/1.1
/// Authorization: Bearer <web.rollup_token>
///
/// {"nums": [12, 15]}
///
/// HTTP/1.1 201 Created
/// {"branch": "rollup-20240301123005", "pull": 40, "html_url": "...", "merged": [12, 15], "failed": []}
/// ```
pub async fn rollup_handler<I>(
    State(app_state): State<AppState<I>>,
    Path(label): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<RollupReport>), RollupEndpointError>
where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    let engine = app_state.engine();
    let Some(expected) = engine.config().web.rollup_token.as_deref() else {
        return Err(RollupEndpointError::Disabled);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(RollupEndpointError::Unauthorized)?;
    if !token_matches(presented.trim(), expected) {
        return Err(RollupEndpointError::Unauthorized);
    }

    let request: RollupRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RollupRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };
    let numbers: Vec<PrNumber> = request.nums.into_iter().map(PrNumber).collect();

    let report = engine
        .rollup(&RepoLabel::new(label.as_str()), &numbers)
        .await
        .ok_or(RollupEndpointError::NotFound(label))??;
    info!(pull = report.pull, url = %report.html_url, "Rollup created");
    Ok((StatusCode::CREATED, Json(report)))
}
