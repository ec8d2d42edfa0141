//! Webhook endpoint handler.
//!
//! Accepts GitHub webhook deliveries, validates signatures with the target
//! repository's secret, and hands parsed events to the engine before
//! returning 202 Accepted. Processing continues in the background.

use std::fmt::Display;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::effects::GitHubInterpreter;
use crate::webhooks::{ParseError, SIGNATURE_HEADER, SignatureError, parse_webhook, peek_repository, verify};

/// Header name for GitHub event type.
const HEADER_EVENT: &str = "x-github-event";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] ParseError),

    #[error("repository {0} is not configured")]
    UnknownRepository(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingHeader(_) => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            WebhookError::UnknownRepository(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Webhook handler.
///
/// # Request
///
/// - Method: POST
/// - Required headers:
///   - `X-GitHub-Event`: Event type (e.g., "pull_request", "issue_comment")
///   - `X-Hub-Signature-256`: HMAC-SHA256 signature of the payload
/// - Body: JSON webhook payload
///
/// # Response
///
/// - 202 Accepted: Event handed to the engine, or of a kind the bot ignores
/// - 400 Bad Request: Missing header, malformed payload or unknown repository
/// - 401 Unauthorized: Invalid signature
pub async fn webhook_handler<I>(
    State(app_state): State<AppState<I>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError>
where
    I: GitHubInterpreter + Send + Sync + 'static,
    I::Error: Display + Send,
{
    let event_type = get_header(&headers, HEADER_EVENT)?;

    // The secret is per repository, so the repository is read first.
    let repo = peek_repository(&body)?;
    let engine = app_state.engine();
    let (label, repo_cfg) = engine
        .config()
        .find_repo(&repo.owner, &repo.repo)
        .ok_or_else(|| WebhookError::UnknownRepository(repo.to_string()))?;

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = verify(&body, signature, repo_cfg.webhook_secret.as_bytes()) {
        warn!(repo = %label, event_type = %event_type, error = %e, "Rejected webhook");
        return Err(e.into());
    }

    let Some(event) = parse_webhook(&event_type, &body)? else {
        debug!(repo = %label, event_type = %event_type, "Ignoring webhook");
        return Ok((StatusCode::ACCEPTED, "Ignored"));
    };

    info!(repo = %label, kind = event.kind(), "Webhook accepted");
    let engine = engine.clone();
    let label = label.clone();
    tokio::spawn(async move {
        let outcome = engine.dispatch(&label, event).await;
        debug!(repo = %label, ?outcome, "Webhook handled");
    });
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

/// Extracts a required header value as a string.
fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(WebhookError::MissingHeader(name))
}
