use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced to callers of the request dispatcher.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP status {status} body: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request rejected as unauthorized: {body}")]
    Unauthorized { body: String },
    #[error("session expired, log in again")]
    SessionExpired,
    #[error("invalid request path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
            ApiError::Transport(err) => err.status(),
            _ => None,
        }
    }

    /// The backend's human-readable `detail` message, when it sent one.
    pub fn detail(&self) -> Option<String> {
        match self {
            ApiError::Status { body, .. } | ApiError::Unauthorized { body } => detail_of(body),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct DetailBody {
    detail: serde_json::Value,
}

/// Extract `detail` from a FastAPI-style error body. Validation errors carry a list.
pub(crate) fn detail_of(body: &str) -> Option<String> {
    let parsed: DetailBody = serde_json::from_str(body).ok()?;
    match parsed.detail {
        serde_json::Value::String(text) => Some(text),
        serde_json::Value::Array(items) => {
            let messages: Vec<String> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|msg| msg.as_str()))
                .map(ToOwned::to_owned)
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        }
        _ => None,
    }
}
