//! Storage backends: where session state lives and how it mutates.
//!
//! The engine never touches state except through [`SessionStore`]. The
//! contract is deliberately small: claim a code, check existence, load a
//! snapshot, and `update`, which runs a closure against current state and
//! persists the result as one indivisible unit. Every multi-field invariant
//! upstream reduces to that one primitive, so a backend that gets `update`
//! right gets the whole engine right.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;

use crate::code::SessionCode;
use crate::session::Session;

/// Operational store failure. Never a domain rejection: these surface to the
/// caller as incidents, not user-facing refusals.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached or refused the operation.
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    /// A stored record exists but cannot be decoded.
    #[error("corrupt session record: {0}")]
    Corrupt(String),
}

/// A home for session state, keyed by session code.
///
/// `update` may run `apply` more than once (optimistic backends retry on
/// contention), so the closure must be a pure function of its argument.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Atomically claim `code` for a fully-built session. Returns false and
    /// stores nothing when the code is already taken.
    async fn insert_if_absent(
        &self,
        code: &SessionCode,
        session: Session,
    ) -> Result<bool, StoreError>;

    /// Whether a session lives under `code`.
    async fn contains(&self, code: &SessionCode) -> Result<bool, StoreError>;

    /// Current state, or `None` for an unknown code. A fresh read every
    /// call; backends never serve a cached copy.
    async fn load(&self, code: &SessionCode) -> Result<Option<Session>, StoreError>;

    /// Read-modify-write as one indivisible unit. Returns the closure's
    /// value, or `None` for an unknown code.
    async fn update<R, F>(&self, code: &SessionCode, apply: F) -> Result<Option<R>, StoreError>
    where
        R: Send + 'static,
        F: FnMut(&mut Session) -> R + Send + 'static;
}
