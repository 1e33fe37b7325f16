//! Distributed cache tier.
//!
//! The secure cache talks to its optional distributed tier through the
//! [`CacheBackend`] capability trait; the production implementation is
//! Redis via a connection manager. An in-memory double backs the hybrid
//! tests without a running server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;

use crate::core::{XyPrissError, XyResult};

/// Key prefix for distributed tag sets.
const TAG_PREFIX: &str = "xypriss:tag:";

/// Capability surface the secure cache requires of a distributed tier.
///
/// All operations may suspend; the caller must not hold any cache lock
/// across them.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> XyResult<()>;
    async fn disconnect(&self) -> XyResult<()>;
    async fn ping(&self) -> XyResult<()>;

    async fn get(&self, key: &str) -> XyResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> XyResult<()>;
    async fn delete(&self, key: &str) -> XyResult<bool>;
    async fn exists(&self, key: &str) -> XyResult<bool>;

    /// TTL in seconds: `-1` no TTL, `-2` absent.
    async fn ttl(&self, key: &str) -> XyResult<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> XyResult<bool>;
    async fn keys(&self, pattern: &str) -> XyResult<Vec<String>>;

    /// Associates `key` with `tag` for later bulk invalidation.
    async fn tag_add(&self, tag: &str, key: &str) -> XyResult<()>;
    /// Keys associated with `tag`.
    async fn tag_members(&self, tag: &str) -> XyResult<Vec<String>>;
    /// Drops the tag set itself.
    async fn tag_clear(&self, tag: &str) -> XyResult<()>;
}

fn backend_err(e: redis::RedisError) -> XyPrissError {
    XyPrissError::CacheBackend(e.to_string())
}

/// Redis-backed distributed tier.
pub struct RedisBackend {
    client: redis::Client,
    manager: RwLock<Option<ConnectionManager>>,
}

impl RedisBackend {
    /// Builds a backend from a `redis://` URL. No connection is made until
    /// [`CacheBackend::connect`].
    pub fn new(url: &str) -> XyResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| XyPrissError::Config(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            manager: RwLock::new(None),
        })
    }

    async fn conn(&self) -> XyResult<ConnectionManager> {
        self.manager
            .read()
            .await
            .clone()
            .ok_or_else(|| XyPrissError::CacheBackend("redis backend not connected".to_string()))
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> XyResult<()> {
        let mut guard = self.manager.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(backend_err)?;
        *guard = Some(manager);
        Ok(())
    }

    async fn disconnect(&self) -> XyResult<()> {
        // Dropping the manager closes its multiplexed connection.
        self.manager.write().await.take();
        Ok(())
    }

    async fn ping(&self) -> XyResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> XyResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> XyResult<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn delete(&self, key: &str) -> XyResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> XyResult<bool> {
        let mut conn = self.conn().await?;
        let found: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(found > 0)
    }

    async fn ttl(&self, key: &str) -> XyResult<i64> {
        let mut conn = self.conn().await?;
        redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> XyResult<bool> {
        let mut conn = self.conn().await?;
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(updated > 0)
    }

    async fn keys(&self, pattern: &str) -> XyResult<Vec<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn tag_add(&self, tag: &str, key: &str) -> XyResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("SADD")
            .arg(format!("{TAG_PREFIX}{tag}"))
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn tag_members(&self, tag: &str) -> XyResult<Vec<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("SMEMBERS")
            .arg(format!("{TAG_PREFIX}{tag}"))
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn tag_clear(&self, tag: &str) -> XyResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(format!("{TAG_PREFIX}{tag}"))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend_err)
    }
}

/// In-process stand-in for a distributed tier, used by the hybrid-strategy
/// tests. Shares the trait's semantics (TTL codes, tag sets) but not its
/// persistence.
#[derive(Default)]
pub struct InMemoryBackend {
    state: std::sync::Mutex<InMemoryState>,
    fail: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct InMemoryState {
    entries: std::collections::HashMap<String, (Vec<u8>, Option<std::time::Instant>)>,
    tags: std::collections::HashMap<String, std::collections::HashSet<String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail, simulating an outage.
    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> XyResult<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(XyPrissError::CacheBackend("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn connect(&self) -> XyResult<()> {
        self.check()
    }

    async fn disconnect(&self) -> XyResult<()> {
        Ok(())
    }

    async fn ping(&self) -> XyResult<()> {
        self.check()
    }

    async fn get(&self, key: &str) -> XyResult<Option<Vec<u8>>> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        match state.entries.get(key) {
            Some((_, Some(deadline))) if std::time::Instant::now() >= *deadline => {
                state.entries.remove(key);
                Ok(None)
            }
            Some((data, _)) => Ok(Some(data.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> XyResult<()> {
        self.check()?;
        let deadline = ttl.map(|t| std::time::Instant::now() + t);
        self.state
            .lock()
            .unwrap()
            .entries
            .insert(key.to_string(), (value.to_vec(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> XyResult<bool> {
        self.check()?;
        Ok(self.state.lock().unwrap().entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> XyResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> XyResult<i64> {
        self.check()?;
        let state = self.state.lock().unwrap();
        match state.entries.get(key) {
            None => Ok(-2),
            Some((_, None)) => Ok(-1),
            Some((_, Some(deadline))) => {
                let now = std::time::Instant::now();
                if now >= *deadline {
                    Ok(-2)
                } else {
                    Ok(deadline.saturating_duration_since(now).as_secs() as i64)
                }
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> XyResult<bool> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        match state.entries.get_mut(key) {
            Some((_, deadline)) => {
                *deadline = Some(std::time::Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> XyResult<Vec<String>> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .keys()
            .filter(|k| super::memory::glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn tag_add(&self, tag: &str, key: &str) -> XyResult<()> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .tags
            .entry(tag.to_string())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    async fn tag_members(&self, tag: &str) -> XyResult<Vec<String>> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn tag_clear(&self, tag: &str) -> XyResult<()> {
        self.check()?;
        self.state.lock().unwrap().tags.remove(tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_backend_semantics() {
        let backend = InMemoryBackend::new();
        backend.connect().await.unwrap();

        backend.set("k", b"v", None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(backend.ttl("k").await.unwrap(), -1);
        assert_eq!(backend.ttl("missing").await.unwrap(), -2);

        backend
            .set("t", b"v", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(backend.ttl("t").await.unwrap() > 0);

        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_backend_tags() {
        let backend = InMemoryBackend::new();
        backend.tag_add("users", "u:1").await.unwrap();
        backend.tag_add("users", "u:2").await.unwrap();
        let mut members = backend.tag_members("users").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["u:1", "u:2"]);
        backend.tag_clear("users").await.unwrap();
        assert!(backend.tag_members("users").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let backend = InMemoryBackend::new();
        backend.set_failing(true);
        assert!(backend.ping().await.is_err());
        assert!(backend.get("k").await.is_err());
        backend.set_failing(false);
        assert!(backend.ping().await.is_ok());
    }

    #[test]
    fn test_invalid_redis_url_rejected() {
        assert!(RedisBackend::new("not a url").is_err());
        assert!(RedisBackend::new("redis://127.0.0.1:6379").is_ok());
    }
}
