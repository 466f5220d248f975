use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::config::{ConfigLocator, DEFAULT_STORAGE_KEY};

use super::{AuthError, Principal, Session, TokenPair};

/// Durable backend for the session snapshot.
pub trait SessionStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Session>, AuthError>;
    fn save(&self, key: &str, session: &Session) -> Result<(), AuthError>;
    fn delete(&self, key: &str) -> Result<(), AuthError>;
}

/// Filesystem-backed session storage located in the user configuration directory.
pub struct FileSessionStorage {
    locator: ConfigLocator,
}

impl FileSessionStorage {
    pub fn new(locator: ConfigLocator) -> Self {
        Self { locator }
    }

    pub fn with_default_locator() -> Result<Self, AuthError> {
        Ok(Self::new(ConfigLocator::new()?))
    }

    fn write_file(path: &Path, payload: &str) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(payload.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = file.metadata()?.permissions();
            perm.set_mode(0o600);
            fs::set_permissions(path, perm)?;
        }

        Ok(())
    }
}

impl SessionStorage for FileSessionStorage {
    fn load(&self, key: &str) -> Result<Option<Session>, AuthError> {
        let path = self.locator.session_file(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let envelope: SessionEnvelope = serde_json::from_str(&raw)?;
        Ok(Some(envelope.session))
    }

    fn save(&self, key: &str, session: &Session) -> Result<(), AuthError> {
        let path = self.locator.session_file(key);
        let envelope = SessionEnvelope {
            version: 1,
            key: key.to_owned(),
            session: session.clone(),
        };
        let payload = serde_json::to_string_pretty(&envelope)?;
        Self::write_file(&path, &payload)
    }

    fn delete(&self, key: &str) -> Result<(), AuthError> {
        let path = self.locator.session_file(key);
        match fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionEnvelope {
    version: u32,
    key: String,
    session: Session,
}

struct State {
    session: Session,
    // Bumped by login and logout; a refresh only commits within the epoch it started in.
    epoch: u64,
}

/// Single source of truth for the current session.
///
/// Writes are synchronous: once a mutation returns, every subsequent reader (and so every
/// subsequently dispatched request) observes it. Each mutation is written through to the
/// [`SessionStorage`] if one is attached; the first storage failure detaches it and the
/// store carries on in memory only.
pub struct CredentialStore {
    key: String,
    state: RwLock<State>,
    storage: Mutex<Option<Box<dyn SessionStorage>>>,
}

impl CredentialStore {
    /// A store that never touches durable storage.
    pub fn in_memory() -> Self {
        Self::with_state(DEFAULT_STORAGE_KEY.to_owned(), Session::default(), None)
    }

    /// Rehydrate the session persisted under `key`. An unreadable entry yields an empty session.
    pub fn hydrate<S>(key: impl Into<String>, storage: S) -> Self
    where
        S: SessionStorage + 'static,
    {
        let key = key.into();
        let session = match storage.load(&key) {
            Ok(Some(session)) => session.normalized(),
            Ok(None) => Session::default(),
            Err(err) => {
                tracing::warn!(error = %err, key = %key, "ignoring unreadable persisted session");
                Session::default()
            }
        };
        tracing::debug!(key = %key, authenticated = session.is_authenticated, "session hydrated");
        Self::with_state(key, session, Some(Box::new(storage)))
    }

    fn with_state(key: String, session: Session, storage: Option<Box<dyn SessionStorage>>) -> Self {
        Self {
            key,
            state: RwLock::new(State { session, epoch: 0 }),
            storage: Mutex::new(storage),
        }
    }

    pub fn get(&self) -> Session {
        self.read(|state| state.session.clone())
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        self.read(|state| state.session.access_token.clone())
    }

    pub(crate) fn refresh_token(&self) -> Option<String> {
        self.read(|state| state.session.refresh_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read(|state| state.session.is_authenticated)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.read(|state| state.epoch)
    }

    /// Whether mutations are still written to durable storage.
    pub fn is_persistent(&self) -> bool {
        self.storage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replace the whole session with a freshly issued token pair.
    pub(crate) fn set(&self, tokens: TokenPair, principal: Option<Principal>) {
        let mut state = self.write();
        state.session = Session::authenticated(tokens, principal);
        state.epoch += 1;
    }

    /// Install a renewed token pair, keeping the principal, unless the session was
    /// replaced or cleared since `expected_epoch`.
    pub(crate) fn rotate_tokens(&self, expected_epoch: u64, tokens: TokenPair) -> bool {
        let mut state = self.write();
        if state.epoch != expected_epoch || !state.session.is_authenticated {
            return false;
        }
        let principal = state.session.principal.take();
        state.session = Session::authenticated(tokens, principal);
        true
    }

    /// Store the principal unless the session was replaced or cleared since `expected_epoch`.
    pub(crate) fn set_principal(&self, expected_epoch: u64, principal: Principal) -> bool {
        let mut state = self.write();
        if state.epoch != expected_epoch || !state.session.is_authenticated {
            return false;
        }
        state.session.principal = Some(principal);
        true
    }

    pub(crate) fn clear(&self) {
        let mut state = self.write();
        state.session = Session::default();
        state.epoch += 1;
    }

    /// Clear the session only if it is still the one observed at `expected_epoch`.
    pub(crate) fn clear_if(&self, expected_epoch: u64) -> bool {
        let mut state = self.write();
        if state.epoch != expected_epoch {
            return false;
        }
        state.session = Session::default();
        state.epoch += 1;
        true
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn write(&self) -> WriteGuard<'_> {
        WriteGuard {
            state: self.state.write().unwrap_or_else(PoisonError::into_inner),
            store: self,
        }
    }

    fn persist(&self, session: &Session) {
        let mut storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(backend) = storage.as_ref() else {
            return;
        };
        let result = if session.is_empty() {
            backend.delete(&self.key)
        } else {
            backend.save(&self.key, session)
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, key = %self.key, "session persistence failed, keeping session in memory only");
            *storage = None;
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("key", &self.key)
            .field("session", &self.get())
            .field("persistent", &self.is_persistent())
            .finish()
    }
}

/// Exclusive access to the session; the mutation is written to storage when dropped,
/// still under the lock so storage sees mutations in order.
struct WriteGuard<'a> {
    state: RwLockWriteGuard<'a, State>,
    store: &'a CredentialStore,
}

impl Deref for WriteGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.state
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        &mut self.state
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.store.persist(&self.state.session);
    }
}
