//! Process-local store backed by a sharded concurrent map.
//!
//! `update` holds the map's entry guard across the closure, which serializes
//! mutations of one session while sessions on other shards proceed
//! untouched. That is exactly the contention scope the engine wants: no
//! global lock around the whole registry.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::code::SessionCode;
use crate::session::Session;

use super::{SessionStore, StoreError};

/// In-process [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: DashMap<SessionCode, Session>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        code: &SessionCode,
        session: Session,
    ) -> Result<bool, StoreError> {
        match self.sessions.entry(code.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(true)
            }
        }
    }

    async fn contains(&self, code: &SessionCode) -> Result<bool, StoreError> {
        Ok(self.sessions.contains_key(code))
    }

    async fn load(&self, code: &SessionCode) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(code).map(|entry| entry.value().clone()))
    }

    async fn update<R, F>(&self, code: &SessionCode, mut apply: F) -> Result<Option<R>, StoreError>
    where
        R: Send + 'static,
        F: FnMut(&mut Session) -> R + Send + 'static,
    {
        Ok(self
            .sessions
            .get_mut(code)
            .map(|mut entry| apply(entry.value_mut())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::join_all;

    use super::*;

    fn code(s: &str) -> SessionCode {
        s.parse().expect("valid test code")
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let store = MemoryStore::new();
        let c = code("AAAABBBB");
        assert!(store.insert_if_absent(&c, Session::new()).await.unwrap());
        assert!(!store.insert_if_absent(&c, Session::new()).await.unwrap());
        assert!(store.contains(&c).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_codes_load_and_update_as_none() {
        let store = MemoryStore::new();
        let c = code("ZZZZYYYY");
        assert!(!store.contains(&c).await.unwrap());
        assert!(store.load(&c).await.unwrap().is_none());
        let touched = store.update(&c, |s| s.add_participant()).await.unwrap();
        assert!(touched.is_none());
    }

    #[tokio::test]
    async fn loads_are_snapshots_not_views() {
        let store = MemoryStore::new();
        let c = code("SNAPSHOT");
        store.insert_if_absent(&c, Session::new()).await.unwrap();
        let before = store.load(&c).await.unwrap().unwrap();
        store.update(&c, |s| s.add_participant()).await.unwrap();
        let after = store.load(&c).await.unwrap().unwrap();
        assert_eq!(before.status(chrono::Utc::now()).participants, 0);
        assert_eq!(after.status(chrono::Utc::now()).participants, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_never_lose_increments() {
        let store = Arc::new(MemoryStore::new());
        let c = code("RACEABLE");
        store.insert_if_absent(&c, Session::new()).await.unwrap();

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = Arc::clone(&store);
                let c = c.clone();
                tokio::spawn(async move {
                    store.update(&c, |s| s.add_participant()).await.unwrap();
                })
            })
            .collect();
        for task in join_all(tasks).await {
            task.unwrap();
        }

        let session = store.load(&c).await.unwrap().unwrap();
        assert_eq!(session.status(chrono::Utc::now()).participants, 64);
    }
}
