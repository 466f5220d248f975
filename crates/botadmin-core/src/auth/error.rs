use thiserror::Error;

use crate::config::ConfigError;
use crate::http::ApiError;

/// Errors surfaced by session management and credential persistence.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{}", .detail.as_deref().unwrap_or("incorrect username or password"))]
    InvalidCredentials { detail: Option<String> },
    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),
}

impl AuthError {
    /// Message suitable for showing next to the login form.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::Api(err) => err.detail().unwrap_or_else(|| "Login failed".to_owned()),
            other => other.to_string(),
        }
    }
}
