use std::sync::Arc;

use reqwest::Client;
use url::Url;

use crate::auth::CredentialStore;
use crate::config::ClientConfig;

use super::{ApiError, ApiResponse, PendingRequest, RequestBody};

/// Outcome of a single send: the response as received plus the access token it carried.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub sent_with: Option<String>,
    pub response: ApiResponse,
}

/// The single path every backend call takes. Attaches the current access token.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    http: Client,
    base_url: Url,
    store: Arc<CredentialStore>,
}

impl Dispatcher {
    pub fn new(config: &ClientConfig, store: Arc<CredentialStore>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            store,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Send the request once. Any status comes back unchanged; only transport
    /// failures are errors at this layer.
    pub async fn dispatch(&self, request: &PendingRequest) -> Result<Dispatched, ApiError> {
        let url = self.resolve(request.path())?;
        let mut builder = self
            .http
            .request(request.method().clone(), url)
            .headers(request.headers().clone());

        if !request.query_pairs().is_empty() {
            builder = builder.query(request.query_pairs());
        }

        builder = match request.body() {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(pairs) => builder.form(pairs),
        };

        // Read right before sending so a renewal that just completed is picked up.
        let sent_with = if request.is_authenticated() {
            self.store.access_token()
        } else {
            None
        };
        if let Some(token) = &sent_with {
            builder = builder.bearer_auth(token);
        }

        tracing::debug!(
            method = %request.method(),
            path = request.path(),
            authenticated = sent_with.is_some(),
            replay = request.is_replay(),
            "dispatching request"
        );

        let response = ApiResponse::read(builder.send().await?).await?;
        tracing::debug!(status = %response.status(), path = request.path(), "response received");
        Ok(Dispatched {
            sent_with,
            response,
        })
    }

    /// Join a path beneath the base URL. Paths resolving to another origin are rejected
    /// so the bearer token never leaves the configured backend.
    fn resolve(&self, path: &str) -> Result<Url, ApiError> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::InvalidPath {
                path: path.to_owned(),
                reason: err.to_string(),
            })?;
        if url.origin() != self.base_url.origin() {
            return Err(ApiError::InvalidPath {
                path: path.to_owned(),
                reason: "path leaves the configured API origin".into(),
            });
        }
        Ok(url)
    }
}
