//! Shared key-value store backend.
//!
//! One session is one Redis hash with two fields: `rev`, a write counter,
//! and `data`, the JSON-encoded [`Session`]. Mutation is optimistic: read
//! both fields, apply the closure locally, then a server-side script swaps
//! in the new payload only if `rev` is unchanged, bumping it. A lost race
//! re-reads and re-applies. The compare is scoped to one key, so sessions
//! never contend with each other.
//!
//! Scripts execute atomically inside Redis, which keeps the two-field
//! create and the check-and-swap indivisible on a shared multiplexed
//! connection without WATCH/MULTI plumbing.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use crate::code::SessionCode;
use crate::session::Session;

use super::{SessionStore, StoreError};

const DEFAULT_KEY_PREFIX: &str = "classpulse:session:";

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'rev', 0, 'data', ARGV[1])
if tonumber(ARGV[2]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

const SWAP_SCRIPT: &str = r#"
local rev = redis.call('HGET', KEYS[1], 'rev')
if rev == false then
  return -1
end
if rev ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'rev', ARGV[2], 'data', ARGV[3])
if tonumber(ARGV[4]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[4])
end
return 1
"#;

/// [`SessionStore`] living in a shared Redis instance, for deployments
/// where several server processes serve the same classrooms.
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    ttl_seconds: u64,
    create: Script,
    swap: Script,
}

impl RedisStore {
    /// Connect to `url`, e.g. `redis://127.0.0.1/`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl_seconds: 0,
            create: Script::new(CREATE_SCRIPT),
            swap: Script::new(SWAP_SCRIPT),
        }
    }

    /// Namespace keys, e.g. per deployment.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Expire sessions `ttl` after their last write, so abandoned
    /// classrooms age out of the shared store. Zero, the default, keeps
    /// them until deleted.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_seconds = ttl.as_secs();
        self
    }

    fn key(&self, code: &SessionCode) -> String {
        session_key(&self.key_prefix, code)
    }

    fn encode(session: &Session) -> Result<String, StoreError> {
        serde_json::to_string(session).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn decode(data: &str) -> Result<Session, StoreError> {
        serde_json::from_str(data).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

fn session_key(prefix: &str, code: &SessionCode) -> String {
    format!("{prefix}{code}")
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn insert_if_absent(
        &self,
        code: &SessionCode,
        session: Session,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let payload = Self::encode(&session)?;
        let claimed: i64 = self
            .create
            .key(self.key(code))
            .arg(payload)
            .arg(self.ttl_seconds)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed == 1)
    }

    async fn contains(&self, code: &SessionCode) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key(code))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn load(&self, code: &SessionCode) -> Result<Option<Session>, StoreError> {
        let mut conn = self.conn.clone();
        let data: Option<String> = redis::cmd("HGET")
            .arg(self.key(code))
            .arg("data")
            .query_async(&mut conn)
            .await?;
        data.as_deref().map(Self::decode).transpose()
    }

    async fn update<R, F>(&self, code: &SessionCode, mut apply: F) -> Result<Option<R>, StoreError>
    where
        R: Send + 'static,
        F: FnMut(&mut Session) -> R + Send + 'static,
    {
        let key = self.key(code);
        let mut conn = self.conn.clone();
        loop {
            let fields: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(&key)
                .arg("rev")
                .arg("data")
                .query_async(&mut conn)
                .await?;
            let mut fields = fields.into_iter();
            let (rev, data) = match (fields.next().flatten(), fields.next().flatten()) {
                (Some(rev), Some(data)) => (rev, data),
                (None, None) => return Ok(None),
                _ => return Err(StoreError::Corrupt("partial session record".into())),
            };
            let rev: u64 = rev
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("non-numeric rev {rev:?}")))?;

            let mut session = match Self::decode(&data) {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(%code, %err, "undecodable session record");
                    return Err(err);
                }
            };
            let out = apply(&mut session);
            let payload = Self::encode(&session)?;

            let swapped: i64 = self
                .swap
                .key(&key)
                .arg(rev)
                .arg(rev + 1)
                .arg(payload)
                .arg(self.ttl_seconds)
                .invoke_async(&mut conn)
                .await?;
            match swapped {
                1 => return Ok(Some(out)),
                // Deleted between read and swap: same as never found.
                -1 => return Ok(None),
                _ => {
                    tracing::debug!(%code, "lost a session swap race, retrying");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> SessionCode {
        s.parse().expect("valid test code")
    }

    #[test]
    fn keys_carry_the_namespace_prefix() {
        assert_eq!(
            session_key("classpulse:session:", &code("ABCDEFGH")),
            "classpulse:session:ABCDEFGH"
        );
        assert_eq!(session_key("", &code("ABCDEFGH")), "ABCDEFGH");
    }

    async fn test_store() -> RedisStore {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        RedisStore::connect(&url)
            .await
            .expect("redis reachable")
            .with_key_prefix(format!("classpulse:test:{}:", std::process::id()))
    }

    #[tokio::test]
    #[ignore = "requires a reachable redis (set REDIS_URL)"]
    async fn lifecycle_roundtrip() {
        let store = test_store().await;
        let c = code("REDISONE");
        assert!(store.insert_if_absent(&c, Session::new()).await.unwrap());
        assert!(!store.insert_if_absent(&c, Session::new()).await.unwrap());
        assert!(store.contains(&c).await.unwrap());

        let n = store.update(&c, |s| s.add_participant()).await.unwrap();
        assert_eq!(n, Some(1));
        let session = store.load(&c).await.unwrap().expect("stored session");
        assert_eq!(session.status(chrono::Utc::now()).participants, 1);
    }

    #[tokio::test]
    #[ignore = "requires a reachable redis (set REDIS_URL)"]
    async fn unknown_codes_load_and_update_as_none() {
        let store = test_store().await;
        let c = code("REDISNIL");
        assert!(!store.contains(&c).await.unwrap());
        assert!(store.load(&c).await.unwrap().is_none());
        let touched = store.update(&c, |s| s.add_participant()).await.unwrap();
        assert!(touched.is_none());
    }

    #[tokio::test]
    #[ignore = "requires a reachable redis (set REDIS_URL)"]
    async fn concurrent_updates_never_lose_increments() {
        let store = std::sync::Arc::new(test_store().await);
        let c = code("REDISCAS");
        store.insert_if_absent(&c, Session::new()).await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                let c = c.clone();
                tokio::spawn(async move {
                    store.update(&c, |s| s.add_participant()).await.unwrap();
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        let session = store.load(&c).await.unwrap().expect("stored session");
        assert_eq!(session.status(chrono::Utc::now()).participants, 16);
    }
}
