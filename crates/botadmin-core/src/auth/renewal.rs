//! One-retry-on-401 renewal.
//!
//! Every call runs through [`execute`], which walks [`CallState`]:
//!
//! ```text
//! Sent -> Succeeded | FailedOther | FailedUnauthorized
//! FailedUnauthorized -> Refreshing -> Refreshed | RefreshFailed
//! Refreshed -> Replayed -> Succeeded | FailedOther
//! ```
//!
//! A replayed request that is rejected again is terminal, so a call is dispatched at most
//! twice. Concurrent renewals are collapsed by [`RefreshGate`].

use std::future::Future;
use std::sync::Arc;

use reqwest::StatusCode;
use tokio::sync::Mutex;

use crate::http::{ApiError, ApiResponse, Dispatched, Dispatcher, PendingRequest};

use super::CredentialStore;

/// Exchanges the refresh token after a call was rejected.
pub trait TokenRenewer {
    /// `stale` is the access token the rejected call carried. Returns whether a usable
    /// access token is now in the credential store.
    fn renew(&self, stale: Option<&str>) -> impl Future<Output = bool> + Send;
}

/// Position of a single call in the renewal protocol.
#[derive(Debug)]
pub enum CallState {
    Sent,
    Succeeded(ApiResponse),
    FailedOther(ApiError),
    FailedUnauthorized { sent_with: Option<String> },
    Refreshing { sent_with: Option<String> },
    Refreshed,
    RefreshFailed,
    Replayed,
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Sent => "sent",
            CallState::Succeeded(_) => "succeeded",
            CallState::FailedOther(_) => "failed_other",
            CallState::FailedUnauthorized { .. } => "failed_unauthorized",
            CallState::Refreshing { .. } => "refreshing",
            CallState::Refreshed => "refreshed",
            CallState::RefreshFailed => "refresh_failed",
            CallState::Replayed => "replayed",
        }
    }
}

/// Classify the outcome of a dispatch for `request`.
pub fn classify(request: &PendingRequest, outcome: Result<Dispatched, ApiError>) -> CallState {
    let Dispatched {
        sent_with,
        response,
    } = match outcome {
        Ok(dispatched) => dispatched,
        Err(err) => return CallState::FailedOther(err),
    };

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        if request.is_replay() || !request.is_authenticated() {
            return CallState::FailedOther(ApiError::Unauthorized {
                body: response.into_text(),
            });
        }
        return CallState::FailedUnauthorized { sent_with };
    }

    if status.is_success() {
        CallState::Succeeded(response)
    } else {
        CallState::FailedOther(ApiError::Status {
            status,
            body: response.into_text(),
        })
    }
}

/// Dispatch `request`, renewing the session and replaying once if it is rejected.
pub async fn execute<R>(
    dispatcher: &Dispatcher,
    renewer: &R,
    mut request: PendingRequest,
) -> Result<ApiResponse, ApiError>
where
    R: TokenRenewer + Sync,
{
    let mut state = CallState::Sent;
    loop {
        tracing::debug!(state = state.name(), path = request.path(), "renewal protocol");
        state = match state {
            CallState::Sent | CallState::Replayed => {
                classify(&request, dispatcher.dispatch(&request).await)
            }
            CallState::FailedUnauthorized { sent_with } => CallState::Refreshing { sent_with },
            CallState::Refreshing { sent_with } => {
                if renewer.renew(sent_with.as_deref()).await {
                    CallState::Refreshed
                } else {
                    CallState::RefreshFailed
                }
            }
            CallState::Refreshed => {
                request.mark_replay();
                CallState::Replayed
            }
            CallState::RefreshFailed => return Err(ApiError::SessionExpired),
            CallState::Succeeded(response) => return Ok(response),
            CallState::FailedOther(err) => return Err(err),
        };
    }
}

/// Serializes refresh exchanges so concurrent rejections share a single one.
#[derive(Debug, Clone, Default)]
pub struct RefreshGate {
    inflight: Arc<Mutex<()>>,
}

impl RefreshGate {
    /// Run `exchange` with no other exchange in flight.
    pub async fn exclusive<F: Future>(&self, exchange: F) -> F::Output {
        let _inflight = self.inflight.lock().await;
        exchange.await
    }

    /// Renew on behalf of a call rejected while carrying `stale`. If the token changed
    /// while waiting for the gate, another call already renewed and `exchange` is skipped.
    pub async fn renew<F>(&self, store: &CredentialStore, stale: Option<&str>, exchange: F) -> bool
    where
        F: Future<Output = bool>,
    {
        let _inflight = self.inflight.lock().await;
        match store.access_token() {
            Some(current) if stale != Some(current.as_str()) => {
                tracing::debug!("access token already renewed by a concurrent call");
                true
            }
            _ => exchange.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenPair;
    use crate::config::ClientConfig;
    use httpmock::prelude::*;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatched(status: u16, sent_with: Option<&str>) -> Result<Dispatched, ApiError> {
        Ok(Dispatched {
            sent_with: sent_with.map(ToOwned::to_owned),
            response: ApiResponse::new(
                StatusCode::from_u16(status).unwrap(),
                HeaderMap::new(),
                "body".into(),
            ),
        })
    }

    #[test]
    fn first_rejection_enters_renewal() {
        let request = PendingRequest::get("users");
        match classify(&request, dispatched(401, Some("A1"))) {
            CallState::FailedUnauthorized { sent_with } => {
                assert_eq!(sent_with.as_deref(), Some("A1"))
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn rejection_after_replay_is_terminal() {
        let mut request = PendingRequest::get("users");
        request.mark_replay();
        let state = classify(&request, dispatched(401, Some("A2")));
        assert!(matches!(
            state,
            CallState::FailedOther(ApiError::Unauthorized { .. })
        ));
    }

    #[test]
    fn anonymous_rejection_is_terminal() {
        let request = PendingRequest::post("auth/refresh").anonymous();
        let state = classify(&request, dispatched(401, None));
        assert!(matches!(
            state,
            CallState::FailedOther(ApiError::Unauthorized { .. })
        ));
    }

    #[test]
    fn other_statuses_pass_through() {
        let request = PendingRequest::get("users");
        assert!(matches!(
            classify(&request, dispatched(204, Some("A1"))),
            CallState::Succeeded(_)
        ));
        match classify(&request, dispatched(403, Some("A1"))) {
            CallState::FailedOther(ApiError::Status { status, body }) => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "body");
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    struct ScriptedRenewer {
        store: Arc<CredentialStore>,
        next: Option<TokenPair>,
        calls: AtomicUsize,
    }

    impl TokenRenewer for ScriptedRenewer {
        async fn renew(&self, _stale: Option<&str>) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.next {
                Some(tokens) => {
                    self.store.set(tokens.clone(), None);
                    true
                }
                None => {
                    self.store.clear();
                    false
                }
            }
        }
    }

    fn setup(server: &MockServer, next: Option<TokenPair>) -> (Dispatcher, ScriptedRenewer) {
        let store = Arc::new(CredentialStore::in_memory());
        store.set(TokenPair::new("A1", "R1"), None);
        let config = ClientConfig::new(&server.url("/api")).unwrap();
        let dispatcher = Dispatcher::new(&config, store.clone()).unwrap();
        let renewer = ScriptedRenewer {
            store,
            next,
            calls: AtomicUsize::new(0),
        };
        (dispatcher, renewer)
    }

    #[tokio::test]
    async fn replays_with_renewed_token() {
        let server = MockServer::start();
        let expired = server.mock(|when, then| {
            when.method(GET)
                .path("/api/settings")
                .header("authorization", "Bearer A1");
            then.status(401);
        });
        let fresh = server.mock(|when, then| {
            when.method(GET)
                .path("/api/settings")
                .header("authorization", "Bearer A2");
            then.status(200).body("ok");
        });

        let (dispatcher, renewer) = setup(&server, Some(TokenPair::new("A2", "R2")));
        let response = execute(&dispatcher, &renewer, PendingRequest::get("settings"))
            .await
            .unwrap();
        expired.assert();
        fresh.assert();
        assert_eq!(response.text(), "ok");
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn never_loops_on_repeated_rejection() {
        let server = MockServer::start();
        let rejected = server.mock(|when, then| {
            when.method(GET).path("/api/settings");
            then.status(401).body("still no");
        });

        let (dispatcher, renewer) = setup(&server, Some(TokenPair::new("A2", "R2")));
        let err = execute(&dispatcher, &renewer, PendingRequest::get("settings"))
            .await
            .unwrap_err();
        rejected.assert_hits(2);
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
        match err {
            ApiError::Unauthorized { body } => assert_eq!(body, "still no"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_renewal_surfaces_session_expired() {
        let server = MockServer::start();
        let rejected = server.mock(|when, then| {
            when.method(GET).path("/api/settings");
            then.status(401);
        });

        let (dispatcher, renewer) = setup(&server, None);
        let err = execute(&dispatcher, &renewer, PendingRequest::get("settings"))
            .await
            .unwrap_err();
        rejected.assert_hits(1);
        assert!(matches!(err, ApiError::SessionExpired));
        assert!(!renewer.store.is_authenticated());
    }

    #[tokio::test]
    async fn gate_skips_exchange_when_token_already_rotated() {
        let store = CredentialStore::in_memory();
        store.set(TokenPair::new("A2", "R2"), None);
        let gate = RefreshGate::default();
        let exchanged = AtomicUsize::new(0);

        let renewed = gate
            .renew(&store, Some("A1"), async {
                exchanged.fetch_add(1, Ordering::SeqCst);
                true
            })
            .await;
        assert!(renewed);
        assert_eq!(exchanged.load(Ordering::SeqCst), 0);

        let renewed = gate
            .renew(&store, Some("A2"), async {
                exchanged.fetch_add(1, Ordering::SeqCst);
                false
            })
            .await;
        assert!(!renewed);
        assert_eq!(exchanged.load(Ordering::SeqCst), 1);
    }
}
