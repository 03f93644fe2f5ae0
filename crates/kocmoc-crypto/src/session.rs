//! Session registry with per-session exclusive access.
//!
//! Sessions are stored in a concurrent `DashMap` keyed by the ordered pair
//! of identity agreement keys. Each entry owns its own lock, so traffic on
//! one conversation never waits on another.
//!
//! ```text
//! SessionStore
//!   DashMap<SessionId, SessionHandle>
//!                        Arc<Mutex<RatchetState>>
//! ```
//!
//! [`SessionStore::with_exclusive_access`] runs the caller's closure on a
//! staged copy of the state and commits it only when the closure returns
//! `Ok`. A host that persists the session inside the closure therefore
//! never ends up with memory and storage disagreeing.

use std::fmt;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use zeroize::Zeroizing;

use crate::CryptoError;
use crate::ratchet::RatchetState;
use crate::x25519::PublicKey;

/// Identifies one direction-independent conversation between two devices,
/// seen from the local side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId {
    /// Local identity agreement key
    pub local: PublicKey,
    /// Remote identity agreement key
    pub remote: PublicKey,
}

impl SessionId {
    /// Create a session id
    #[must_use]
    pub fn new(local: PublicKey, remote: PublicKey) -> Self {
        Self { local, remote }
    }

    /// The same conversation as seen by the peer
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}",
            hex::encode(self.local.as_bytes()),
            hex::encode(self.remote.as_bytes())
        )
    }
}

/// Shared handle to one session's state.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    inner: Arc<Mutex<RatchetState>>,
}

impl SessionHandle {
    fn new(state: RatchetState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Run `f` on a staged copy of the state under the session lock and
    /// commit the copy only if `f` succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if an earlier holder of the
    /// lock panicked, otherwise whatever `f` returns.
    pub fn with_exclusive_access<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut RatchetState) -> Result<T, E>,
        E: From<CryptoError>,
    {
        let mut guard = self.inner.lock().map_err(|_| {
            tracing::error!("Session lock poisoned");
            E::from(CryptoError::InvalidState)
        })?;

        let mut staged = guard.clone();
        let value = f(&mut staged)?;
        *guard = staged;
        Ok(value)
    }
}

/// Concurrent registry of ratchet sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `id`, creating it with `create` if absent.
    ///
    /// `create` runs with no store lock held, so it may use the store. It is
    /// skipped when `id` already exists. If two callers race on a new id,
    /// both may build a state; the first insert wins and the other state is
    /// dropped (and zeroized).
    ///
    /// # Errors
    ///
    /// Propagates the error from `create`; nothing is inserted in that case.
    pub fn get_or_create<F>(&self, id: SessionId, create: F) -> Result<SessionHandle, CryptoError>
    where
        F: FnOnce() -> Result<RatchetState, CryptoError>,
    {
        if let Some(handle) = self.get(&id) {
            return Ok(handle);
        }

        let state = create()?;
        match self.sessions.entry(id) {
            Entry::Occupied(entry) => {
                tracing::debug!("Session {} created concurrently, discarding ours", id);
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let handle = SessionHandle::new(state);
                entry.insert(handle.clone());
                tracing::debug!("Created session {}", id);
                Ok(handle)
            }
        }
    }

    /// Insert or replace the session for `id`.
    pub fn insert(&self, id: SessionId, state: RatchetState) -> SessionHandle {
        let handle = SessionHandle::new(state);
        if self.sessions.insert(id, handle.clone()).is_some() {
            tracing::debug!("Replaced session {}", id);
        }
        handle
    }

    /// Handle for an existing session
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Run `f` with exclusive access to the session for `id`.
    ///
    /// See [`SessionHandle::with_exclusive_access`] for commit semantics.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownSession`] if no session is registered.
    pub fn with_exclusive_access<T, E, F>(&self, id: &SessionId, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut RatchetState) -> Result<T, E>,
        E: From<CryptoError>,
    {
        // Clone the handle so the map shard is not locked while `f` runs
        let handle = self
            .get(id)
            .ok_or_else(|| E::from(CryptoError::UnknownSession))?;
        handle.with_exclusive_access(f)
    }

    /// Tear down a session. Its keys are zeroized once the last handle drops.
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            tracing::debug!("Removed session {}", id);
        }
        removed
    }

    /// Whether a session exists for `id`
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Serialize a session under its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownSession`] if no session is registered.
    pub fn snapshot(&self, id: &SessionId) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.with_exclusive_access(id, |state| state.to_bytes())
    }

    /// Deserialize a session and register it under `id`, replacing any
    /// existing entry.
    ///
    /// # Errors
    ///
    /// Returns the decoding error from [`RatchetState::from_bytes`].
    pub fn restore(&self, id: SessionId, bytes: &[u8]) -> Result<SessionHandle, CryptoError> {
        let state = RatchetState::from_bytes(bytes)?;
        Ok(self.insert(id, state))
    }
}
