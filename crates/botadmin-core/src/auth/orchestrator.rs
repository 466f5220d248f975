use std::sync::Arc;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::config::ClientConfig;
use crate::http::{detail_of, ApiError, ApiResponse, Dispatcher, PendingRequest};

use super::renewal::{self, RefreshGate, TokenRenewer};
use super::{AuthError, CredentialStore, FileSessionStorage, Principal, Session, TokenPair};

pub const LOGIN_PATH: &str = "auth/login";
pub const REFRESH_PATH: &str = "auth/refresh";
pub const ME_PATH: &str = "auth/me";
pub const CHANGE_PASSWORD_PATH: &str = "auth/change-password";

/// Session façade: the only component that mutates the credential store.
#[derive(Debug, Clone)]
pub struct AuthManager {
    store: Arc<CredentialStore>,
    dispatcher: Dispatcher,
    refresh_gate: RefreshGate,
}

impl AuthManager {
    pub fn new(config: &ClientConfig, store: CredentialStore) -> Result<Self, AuthError> {
        let store = Arc::new(store);
        let dispatcher = Dispatcher::new(config, store.clone())?;
        Ok(Self {
            store,
            dispatcher,
            refresh_gate: RefreshGate::default(),
        })
    }

    /// Rehydrate the session stored under `config.storage_key` in the user config directory,
    /// or keep it in memory only when that directory is unavailable.
    pub fn with_default_storage(config: &ClientConfig) -> Result<Self, AuthError> {
        let store = match FileSessionStorage::with_default_locator() {
            Ok(storage) => CredentialStore::hydrate(config.storage_key.clone(), storage),
            Err(err) => {
                tracing::warn!(error = %err, "session storage unavailable, keeping session in memory only");
                CredentialStore::in_memory()
            }
        };
        Self::new(config, store)
    }

    pub fn session(&self) -> Session {
        self.store.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    /// Read-only view of the credential store. Writes go through the façade:
    ///
    /// ```compile_fail
    /// # fn logout_behind_the_facade(manager: &botadmin_core::auth::AuthManager) {
    /// manager.store().clear();
    /// # }
    /// ```
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Exchange credentials for a token pair, then load the principal.
    ///
    /// The store is only written once the backend has issued tokens; every failure leaves
    /// it as it was.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let request = PendingRequest::post(LOGIN_PATH)
            .form([("username", username), ("password", password)])
            .anonymous();
        let response = self.dispatcher.dispatch(&request).await?.response;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::info!(username, "login rejected");
            return Err(AuthError::InvalidCredentials {
                detail: detail_of(response.text()),
            });
        }

        let tokens = token_pair(response)?;
        self.store.set(tokens, None);
        tracing::info!(username, "logged in");

        self.fetch_current_principal().await;
        Ok(())
    }

    /// Forget the session locally. The backend is not contacted.
    pub fn logout(&self) {
        self.store.clear();
        tracing::info!("logged out");
    }

    /// Exchange the refresh token for a new pair. Any failure ends the session.
    pub async fn refresh_access_token(&self) -> bool {
        self.refresh_gate
            .exclusive(self.exchange_refresh_token())
            .await
    }

    /// Load the principal. Best effort: failures are logged and otherwise ignored.
    pub async fn fetch_current_principal(&self) {
        let epoch = self.store.epoch();
        let principal = self
            .send(PendingRequest::get(ME_PATH))
            .await
            .and_then(|response| response.json::<Principal>());
        match principal {
            Ok(principal) => {
                if !self.store.set_principal(epoch, principal) {
                    tracing::debug!("session ended before principal arrived");
                }
            }
            Err(err) => tracing::debug!(error = %err, "failed to fetch current principal"),
        }
    }

    pub async fn change_password(&self, current: &str, new: &str) -> Result<(), ApiError> {
        let request = PendingRequest::post(CHANGE_PASSWORD_PATH).json(json!({
            "current_password": current,
            "new_password": new,
        }));
        self.send(request).await?;
        Ok(())
    }

    /// Issue any backend call with the current access token, renewing once on rejection.
    pub async fn send(&self, request: PendingRequest) -> Result<ApiResponse, ApiError> {
        renewal::execute(&self.dispatcher, self, request).await
    }

    async fn exchange_refresh_token(&self) -> bool {
        let Some(refresh_token) = self.store.refresh_token() else {
            tracing::debug!("no refresh token held");
            self.logout();
            return false;
        };

        let epoch = self.store.epoch();
        let request = PendingRequest::post(REFRESH_PATH)
            .json(json!({ "refresh_token": refresh_token }))
            .anonymous();
        let outcome = match self.dispatcher.dispatch(&request).await {
            Ok(dispatched) => token_pair(dispatched.response),
            Err(err) => Err(err.into()),
        };

        match outcome {
            Ok(tokens) => {
                if self.store.rotate_tokens(epoch, tokens) {
                    tracing::info!("access token renewed");
                    true
                } else {
                    tracing::info!("session changed while refreshing, discarding renewed tokens");
                    false
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed");
                if self.store.clear_if(epoch) {
                    tracing::info!("logged out");
                } else {
                    tracing::info!("session changed while refreshing, keeping it");
                }
                false
            }
        }
    }
}

impl TokenRenewer for AuthManager {
    async fn renew(&self, stale: Option<&str>) -> bool {
        self.refresh_gate
            .renew(&self.store, stale, self.exchange_refresh_token())
            .await
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

fn token_pair(response: ApiResponse) -> Result<TokenPair, AuthError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Status {
            status,
            body: response.into_text(),
        }
        .into());
    }

    let payload: TokenResponse = response.json()?;
    if let Some(kind) = &payload.token_type {
        if !kind.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::InvalidTokenResponse(format!(
                "unsupported token type '{kind}'"
            )));
        }
    }
    if payload.access_token.is_empty() || payload.refresh_token.is_empty() {
        return Err(AuthError::InvalidTokenResponse("empty token".into()));
    }
    Ok(TokenPair::new(payload.access_token, payload.refresh_token))
}
