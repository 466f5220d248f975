//! Session-aware client for the bot administration API.
//!
//! [`auth::AuthManager`] owns the session: it logs in, persists and renews credentials,
//! and sends every backend call through the [`http::Dispatcher`], replaying a call once
//! after a successful renewal when the backend rejects an expired access token.

pub mod auth;
pub mod config;
pub mod http;
