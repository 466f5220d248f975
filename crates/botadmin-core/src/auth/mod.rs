mod credential_store;
mod error;
mod orchestrator;
mod renewal;
mod session;

pub use credential_store::{CredentialStore, FileSessionStorage, SessionStorage};
pub use error::AuthError;
pub use orchestrator::{AuthManager, CHANGE_PASSWORD_PATH, LOGIN_PATH, ME_PATH, REFRESH_PATH};
pub use renewal::{classify, execute, CallState, RefreshGate, TokenRenewer};
pub use session::{Principal, Role, Session, TokenPair};
