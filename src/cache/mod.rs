//! Secure layered cache.
//!
//! Values are serialized, optionally gzip-compressed, optionally sealed in
//! an AEAD envelope, and framed with their encoding flags before landing in
//! the memory tier and (for the `redis`/`hybrid` strategies) the distributed
//! tier. Reads are memory-first with promotion on distributed hits; a
//! distributed outage degrades the cache to memory-only and a background
//! task retries with exponential backoff.

pub mod backend;
pub mod envelope;
pub mod memory;
pub mod serialize;
pub mod stats;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::core::{XyPrissError, XyResult};
use crate::crypto::{derive_password_key, AeadAlgorithm, CryptoProvider};

use backend::CacheBackend;
use memory::{EncodingFlags, MemoryTier, StoredEntry};
use stats::{CacheStats, CacheStatsSnapshot};

/// Frame magic prefix for encoded values.
const FRAME_MAGIC: &[u8; 4] = b"XYP1";
const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_ENCRYPTED: u8 = 0b0000_0010;

/// Backoff bounds for distributed-tier reconnection.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Tiering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    #[default]
    Memory,
    Redis,
    Hybrid,
    Auto,
}

/// Health classification reported by [`SecureCache::get_health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: CacheHealthStatus,
    pub details: JsonValue,
}

/// Construction options for the cache.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub strategy: CacheStrategy,
    pub memory_max_bytes: usize,
    pub memory_max_entries: usize,
    pub default_ttl: Option<Duration>,
    pub enable_compression: bool,
    pub compression_level: u32,
    /// Values below this size are never compressed.
    pub compression_threshold: usize,
    pub enable_encryption: bool,
    /// Compatibility path: on decrypt failure, treat stored bytes as
    /// unencrypted. Should be off in production.
    pub allow_plaintext_fallback: bool,
    pub master_key: Option<String>,
    pub envelope_max_age_secs: u64,
    pub envelope_clock_skew_secs: u64,
    pub sweep_interval: Duration,
    /// Hybrid strategy: apply distributed writes asynchronously.
    pub async_distributed_writes: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::Memory,
            memory_max_bytes: 64 * 1024 * 1024,
            memory_max_entries: 10_000,
            default_ttl: None,
            enable_compression: true,
            compression_level: 6,
            compression_threshold: 1024,
            enable_encryption: true,
            allow_plaintext_fallback: false,
            master_key: None,
            envelope_max_age_secs: envelope::DEFAULT_MAX_AGE_SECS,
            envelope_clock_skew_secs: envelope::DEFAULT_CLOCK_SKEW_SECS,
            sweep_interval: Duration::from_secs(60),
            async_distributed_writes: true,
        }
    }
}

/// Per-`set` options.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub compress: Option<bool>,
    pub encrypt: Option<bool>,
}

impl SetOptions {
    pub fn ttl_secs(ttl: u64) -> Self {
        Self {
            ttl: Some(Duration::from_secs(ttl)),
            ..Default::default()
        }
    }

    pub fn tagged<I: IntoIterator<Item = S>, S: Into<String>>(tags: I) -> Self {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Name of the environment variable consulted for the master key when no
/// explicit key is configured.
pub const MASTER_KEY_ENV: &str = "XYPRISS_MASTER_KEY";

// Effective strategy codes kept in an atomic so `auto` can resolve after
// construction without locking readers.
const STRAT_MEMORY: u8 = 0;
const STRAT_REDIS: u8 = 1;
const STRAT_HYBRID: u8 = 2;

pub struct SecureCache {
    options: CacheOptions,
    memory: MemoryTier,
    backend: Option<Arc<dyn CacheBackend>>,
    provider: Arc<dyn CryptoProvider>,
    key: Vec<u8>,
    salt: Vec<u8>,
    stats: Arc<CacheStats>,
    effective: AtomicU8,
    backend_state: Arc<BackendState>,
    warned_plaintext: AtomicBool,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Distributed-tier liveness flags, shared with the reconnect task.
#[derive(Default)]
struct BackendState {
    up: AtomicBool,
    reconnecting: AtomicBool,
}

impl SecureCache {
    /// Creates a cache with no distributed tier wired up. `redis`/`hybrid`
    /// strategies require [`with_backend`](Self::with_backend).
    pub fn new(options: CacheOptions, provider: Arc<dyn CryptoProvider>) -> XyResult<Self> {
        Self::build(options, provider, None)
    }

    pub fn with_backend(
        options: CacheOptions,
        provider: Arc<dyn CryptoProvider>,
        backend: Arc<dyn CacheBackend>,
    ) -> XyResult<Self> {
        Self::build(options, provider, Some(backend))
    }

    fn build(
        options: CacheOptions,
        provider: Arc<dyn CryptoProvider>,
        backend: Option<Arc<dyn CacheBackend>>,
    ) -> XyResult<Self> {
        let master = match &options.master_key {
            Some(key) => key.as_bytes().to_vec(),
            None => match std::env::var(MASTER_KEY_ENV) {
                Ok(key) if !key.is_empty() => key.into_bytes(),
                _ => {
                    if options.enable_encryption {
                        log::warn!(
                            "no cache master key configured; generated an ephemeral key \
                             (encrypted entries will not survive a restart)"
                        );
                    }
                    provider.random_bytes(32)
                }
            },
        };
        let salt = provider.random_bytes(16);
        let key = derive_password_key(provider.as_ref(), &master, &salt, 0)?;

        let effective = match options.strategy {
            CacheStrategy::Redis => STRAT_REDIS,
            CacheStrategy::Hybrid => STRAT_HYBRID,
            // `auto` acts as memory-only until connect() proves the
            // distributed endpoint reachable.
            CacheStrategy::Memory | CacheStrategy::Auto => STRAT_MEMORY,
        };

        if matches!(options.strategy, CacheStrategy::Redis | CacheStrategy::Hybrid)
            && backend.is_none()
        {
            return Err(XyPrissError::Config(format!(
                "cache strategy {:?} requires a distributed backend",
                options.strategy
            )));
        }

        Ok(Self {
            memory: MemoryTier::new(options.memory_max_bytes, options.memory_max_entries),
            options,
            backend,
            provider,
            key,
            salt,
            stats: Arc::new(CacheStats::new()),
            effective: AtomicU8::new(effective),
            backend_state: Arc::new(BackendState::default()),
            warned_plaintext: AtomicBool::new(false),
            write_locks: DashMap::new(),
        })
    }

    fn uses_memory(&self) -> bool {
        self.effective.load(Ordering::Relaxed) != STRAT_REDIS
    }

    fn uses_backend(&self) -> bool {
        self.backend.is_some()
            && self.effective.load(Ordering::Relaxed) != STRAT_MEMORY
            && self.backend_state.up.load(Ordering::Relaxed)
    }

    /// Establishes the distributed connection; idempotent, and a no-op for
    /// the memory strategy.
    pub async fn connect(&self) -> XyResult<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        if self.backend_state.up.load(Ordering::SeqCst) {
            return Ok(());
        }
        match async {
            backend.connect().await?;
            backend.ping().await
        }
        .await
        {
            Ok(()) => {
                self.backend_state.up.store(true, Ordering::SeqCst);
                if self.options.strategy == CacheStrategy::Auto {
                    self.effective.store(STRAT_HYBRID, Ordering::SeqCst);
                    log::info!("cache auto strategy resolved to hybrid");
                }
                Ok(())
            }
            Err(e) => {
                if self.options.strategy == CacheStrategy::Auto {
                    log::info!("cache auto strategy resolved to memory: {e}");
                    return Ok(());
                }
                log::warn!("distributed cache tier unreachable: {e}");
                // Degraded, not fatal: the memory tier keeps serving.
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> XyResult<()> {
        if let Some(backend) = &self.backend {
            backend.disconnect().await?;
        }
        self.backend_state.up.store(false, Ordering::SeqCst);
        Ok(())
    }

    // ---- encoding pipeline -------------------------------------------------

    fn encode(&self, value: &JsonValue, opts: &SetOptions) -> XyResult<(Vec<u8>, EncodingFlags)> {
        let mut data = serialize::serialize(value)?;
        let mut flags = EncodingFlags::default();

        let compress = opts.compress.unwrap_or(self.options.enable_compression);
        if compress && data.len() >= self.options.compression_threshold {
            data = serialize::compress(&data, self.options.compression_level)?;
            flags.compressed = true;
        }

        let encrypt = opts.encrypt.unwrap_or(self.options.enable_encryption);
        if encrypt {
            data = envelope::seal(
                self.provider.as_ref(),
                AeadAlgorithm::Aes256Gcm,
                &self.key,
                &self.salt,
                &data,
            )?;
            flags.encrypted = true;
        }

        let mut framed = Vec::with_capacity(FRAME_MAGIC.len() + 1 + data.len());
        framed.extend_from_slice(FRAME_MAGIC);
        let mut flag_byte = 0u8;
        if flags.compressed {
            flag_byte |= FLAG_COMPRESSED;
        }
        if flags.encrypted {
            flag_byte |= FLAG_ENCRYPTED;
        }
        framed.push(flag_byte);
        framed.extend_from_slice(&data);
        Ok((framed, flags))
    }

    fn decode(&self, framed: &[u8]) -> XyResult<JsonValue> {
        if framed.len() < FRAME_MAGIC.len() + 1 || &framed[..FRAME_MAGIC.len()] != FRAME_MAGIC {
            return Err(XyPrissError::CacheSerialization(
                "unrecognized cache frame".to_string(),
            ));
        }
        let flag_byte = framed[FRAME_MAGIC.len()];
        let mut data = framed[FRAME_MAGIC.len() + 1..].to_vec();

        if flag_byte & FLAG_ENCRYPTED != 0 {
            match envelope::open(
                self.provider.as_ref(),
                &self.key,
                &data,
                self.options.envelope_max_age_secs,
                self.options.envelope_clock_skew_secs,
            ) {
                Ok(plain) => data = plain,
                Err(e) if self.options.allow_plaintext_fallback => {
                    if !self.warned_plaintext.swap(true, Ordering::SeqCst) {
                        log::warn!(
                            "cache decrypt failed ({e}); falling through to plaintext \
                             compatibility mode"
                        );
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if flag_byte & FLAG_COMPRESSED != 0 {
            data = serialize::decompress(&data)?;
        }
        serialize::deserialize(&data)
    }

    // ---- operations --------------------------------------------------------

    /// Returns the stored value if present and unexpired. Never fails on a
    /// miss; tier errors degrade and read as a miss.
    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        let start = Instant::now();
        let result = self.get_inner(key).await;
        self.stats.record_op(start.elapsed());
        result
    }

    async fn get_inner(&self, key: &str) -> Option<JsonValue> {
        if self.uses_memory() {
            let (found, mutation) = self.memory.get(key);
            self.stats.add(&self.stats.expired_removals, mutation.expired);
            if let Some(entry) = found {
                self.stats.bump(&self.stats.memory_hits);
                match self.decode(&entry.data) {
                    Ok(value) => return Some(value),
                    Err(e) => {
                        log::warn!("dropping undecodable cache entry {key}: {e}");
                        self.memory.delete(key);
                        return None;
                    }
                }
            }
            self.stats.bump(&self.stats.memory_misses);
        }

        if !self.uses_backend() {
            return None;
        }
        let backend = self.backend.as_ref()?;
        match backend.get(key).await {
            Ok(Some(bytes)) => {
                self.stats.bump(&self.stats.distributed_hits);
                let value = match self.decode(&bytes) {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!("undecodable distributed cache entry {key}: {e}");
                        return None;
                    }
                };
                // Hybrid reads promote to the memory tier with the remaining
                // TTL of the distributed entry.
                if self.effective.load(Ordering::Relaxed) == STRAT_HYBRID {
                    let ttl = match backend.ttl(key).await {
                        Ok(secs) if secs >= 0 => Some(Duration::from_secs(secs as u64)),
                        Ok(-1) => None,
                        _ => None,
                    };
                    let entry = StoredEntry::new(
                        bytes,
                        ttl,
                        Vec::new(),
                        EncodingFlags::default(),
                    );
                    if let Err(e) = self.memory.put(key.to_string(), entry) {
                        log::debug!("promotion of {key} skipped: {e}");
                    }
                }
                Some(value)
            }
            Ok(None) => {
                self.stats.bump(&self.stats.distributed_misses);
                None
            }
            Err(e) => {
                self.degrade(&e);
                None
            }
        }
    }

    /// Stores a value. Writes for the same key are serialized; the memory
    /// write is observable immediately after return.
    pub async fn set(&self, key: &str, value: &JsonValue, opts: SetOptions) -> XyResult<()> {
        let start = Instant::now();
        let lock = self
            .write_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let (framed, flags) = self.encode(value, &opts)?;
        let ttl = opts.ttl.or(self.options.default_ttl);

        if self.uses_memory() {
            let entry = StoredEntry::new(framed.clone(), ttl, opts.tags.clone(), flags);
            let mutation = self.memory.put(key.to_string(), entry)?;
            self.stats.add(&self.stats.evictions, mutation.evicted);
        }

        if self.backend.is_some() && self.effective.load(Ordering::Relaxed) != STRAT_MEMORY {
            if self.backend_state.up.load(Ordering::Relaxed) {
                let backend = self.backend.as_ref().unwrap().clone();
                let tags = opts.tags.clone();
                let key_owned = key.to_string();
                let write = async move {
                    backend.set(&key_owned, &framed, ttl).await?;
                    for tag in &tags {
                        backend.tag_add(tag, &key_owned).await?;
                    }
                    Ok::<(), XyPrissError>(())
                };
                if self.options.async_distributed_writes
                    && self.effective.load(Ordering::Relaxed) == STRAT_HYBRID
                {
                    tokio::spawn(async move {
                        if let Err(e) = write.await {
                            log::warn!("async distributed cache write failed: {e}");
                        }
                    });
                } else if let Err(e) = write.await {
                    self.degrade(&e);
                    if self.effective.load(Ordering::Relaxed) == STRAT_REDIS {
                        return Err(e);
                    }
                }
            } else if self.effective.load(Ordering::Relaxed) == STRAT_REDIS {
                return Err(XyPrissError::CacheBackend(
                    "distributed tier unavailable".to_string(),
                ));
            }
        }

        self.stats.bump(&self.stats.sets);
        self.stats.record_op(start.elapsed());
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> XyResult<bool> {
        let lock = self
            .write_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut removed = self.memory.delete(key);
        if self.uses_backend() {
            match self.backend.as_ref().unwrap().delete(key).await {
                Ok(backend_removed) => removed |= backend_removed,
                Err(e) => self.degrade(&e),
            }
        }
        if removed {
            self.stats.bump(&self.stats.deletes);
        }
        Ok(removed)
    }

    pub async fn exists(&self, key: &str) -> bool {
        if self.uses_memory() && self.memory.exists(key) {
            return true;
        }
        if self.uses_backend() {
            if let Ok(found) = self.backend.as_ref().unwrap().exists(key).await {
                return found;
            }
        }
        false
    }

    /// TTL in seconds; `-1` when the key has no TTL, `-2` when absent.
    pub async fn ttl(&self, key: &str) -> i64 {
        if self.uses_memory() {
            let ttl = self.memory.ttl(key);
            if ttl != -2 {
                return ttl;
            }
        }
        if self.uses_backend() {
            if let Ok(ttl) = self.backend.as_ref().unwrap().ttl(key).await {
                return ttl;
            }
        }
        -2
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        let mut updated = self.uses_memory() && self.memory.expire(key, ttl);
        if self.uses_backend() {
            if let Ok(backend_updated) = self.backend.as_ref().unwrap().expire(key, ttl).await {
                updated |= backend_updated;
            }
        }
        updated
    }

    /// Keys matching a glob pattern across both tiers. Expensive: walks the
    /// full key space.
    pub async fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        let mut keys = if self.uses_memory() {
            self.memory.keys(pattern)
        } else {
            Vec::new()
        };
        if self.uses_backend() {
            if let Ok(remote) = self
                .backend
                .as_ref()
                .unwrap()
                .keys(pattern.unwrap_or("*"))
                .await
            {
                for key in remote {
                    if !keys.contains(&key) && !key.starts_with("xypriss:tag:") {
                        keys.push(key);
                    }
                }
            }
        }
        keys
    }

    /// Bulk get; missing keys are omitted from the result.
    pub async fn mget(&self, keys: &[&str]) -> HashMap<String, JsonValue> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await {
                out.insert(key.to_string(), value);
            }
        }
        out
    }

    /// Bulk set with shared options.
    pub async fn mset(&self, entries: &[(&str, JsonValue)], opts: SetOptions) -> XyResult<()> {
        for (key, value) in entries {
            self.set(key, value, opts.clone()).await?;
        }
        Ok(())
    }

    /// Removes every key referenced by any of the supplied tags; returns the
    /// number of distinct keys removed.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let mut removed: std::collections::HashSet<String> =
            self.memory.invalidate_tags(tags).into_iter().collect();

        if self.uses_backend() {
            let backend = self.backend.as_ref().unwrap();
            for tag in tags {
                match backend.tag_members(tag).await {
                    Ok(members) => {
                        for key in members {
                            match backend.delete(&key).await {
                                Ok(true) => {
                                    removed.insert(key);
                                }
                                Ok(false) => {}
                                Err(e) => self.degrade(&e),
                            }
                        }
                        if let Err(e) = backend.tag_clear(tag).await {
                            self.degrade(&e);
                        }
                    }
                    Err(e) => self.degrade(&e),
                }
            }
        }

        let count = removed.len();
        self.stats.add(&self.stats.deletes, count as u64);
        count
    }

    pub fn get_stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn get_health(&self) -> CacheHealth {
        let strategy = self.effective.load(Ordering::Relaxed);
        let backend_wanted = strategy != STRAT_MEMORY;
        let backend_up = self.backend_state.up.load(Ordering::Relaxed);
        let status = match (backend_wanted, backend_up) {
            (false, _) => CacheHealthStatus::Healthy,
            (true, true) => CacheHealthStatus::Healthy,
            // Distributed-only has nothing to serve from; hybrid degrades.
            (true, false) if strategy == STRAT_REDIS => CacheHealthStatus::Unhealthy,
            (true, false) => CacheHealthStatus::Degraded,
        };
        CacheHealth {
            status,
            details: serde_json::json!({
                "strategy": match strategy {
                    STRAT_REDIS => "redis",
                    STRAT_HYBRID => "hybrid",
                    _ => "memory",
                },
                "backend_connected": backend_up,
                "memory_entries": self.memory.len(),
                "memory_bytes": self.memory.bytes_used(),
            }),
        }
    }

    /// Purges expired memory-tier entries once. The server wires this into a
    /// periodic task at `sweep_interval`.
    pub fn sweep(&self) -> u64 {
        let purged = self.memory.sweep_expired();
        self.stats.add(&self.stats.expired_removals, purged);
        purged
    }

    pub fn sweep_interval(&self) -> Duration {
        self.options.sweep_interval
    }

    /// Spawns the periodic expired-entry sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let interval = self.options.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                let purged = cache.sweep();
                if purged > 0 {
                    log::debug!("cache sweep purged {purged} expired entries");
                }
            }
        })
    }

    fn degrade(&self, cause: &XyPrissError) {
        if self.backend_state.up.swap(false, Ordering::SeqCst) {
            log::warn!("distributed cache tier degraded: {cause}");
        }
        self.spawn_reconnect();
    }

    fn spawn_reconnect(&self) {
        if self.backend_state.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(backend) = self.backend.clone() else {
            self.backend_state.reconnecting.store(false, Ordering::SeqCst);
            return;
        };
        let state = self.backend_state.clone();
        tokio::spawn(async move {
            let mut delay = BACKOFF_INITIAL;
            loop {
                tokio::time::sleep(delay).await;
                match async {
                    backend.connect().await?;
                    backend.ping().await
                }
                .await
                {
                    Ok(()) => {
                        log::info!("distributed cache tier reachable again");
                        state.up.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        log::debug!("cache backend retry failed: {e}");
                        delay = (delay * 2).min(BACKOFF_CAP);
                    }
                }
            }
            state.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Marks the distributed tier reachable; used by the reconnect loop and
    /// by tests that simulate recovery.
    pub fn mark_backend_up(&self) {
        self.backend_state.up.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::backend::InMemoryBackend;
    use super::*;
    use crate::crypto::StubCryptoProvider;
    use serde_json::json;

    fn provider() -> Arc<dyn CryptoProvider> {
        Arc::new(StubCryptoProvider)
    }

    fn options() -> CacheOptions {
        CacheOptions {
            master_key: Some("unit-test-master-key".to_string()),
            ..Default::default()
        }
    }

    fn memory_cache() -> SecureCache {
        SecureCache::new(options(), provider()).unwrap()
    }

    async fn hybrid_cache(backend: Arc<InMemoryBackend>) -> SecureCache {
        let opts = CacheOptions {
            strategy: CacheStrategy::Hybrid,
            async_distributed_writes: false,
            ..options()
        };
        let cache = SecureCache::with_backend(opts, provider(), backend).unwrap();
        cache.connect().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = memory_cache();
        let value = json!({"name": "xypriss", "n": 42});
        cache.set("k", &value, SetOptions::default()).await.unwrap();
        assert_eq!(cache.get("k").await, Some(value));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        let cache = memory_cache();
        let value = json!([1, 2, 3]);
        cache.set("k", &value, SetOptions::default()).await.unwrap();
        cache.set("k", &value, SetOptions::default()).await.unwrap();
        assert_eq!(cache.get("k").await, Some(value));
        assert_eq!(cache.get_stats().sets, 2);
    }

    #[tokio::test]
    async fn test_ttl_and_expire() {
        let cache = memory_cache();
        cache
            .set("k", &json!(1), SetOptions::ttl_secs(120))
            .await
            .unwrap();
        let ttl = cache.ttl("k").await;
        assert!(ttl > 100 && ttl <= 120);

        cache.set("forever", &json!(2), SetOptions::default()).await.unwrap();
        assert_eq!(cache.ttl("forever").await, -1);
        assert_eq!(cache.ttl("missing").await, -2);

        assert!(cache.expire("forever", Duration::from_secs(30)).await);
        assert!(cache.ttl("forever").await <= 30);
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let cache = memory_cache();
        cache.set("k", &json!(1), SetOptions::default()).await.unwrap();
        assert!(cache.exists("k").await);
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.exists("k").await);
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_tag_invalidation_scenario() {
        let cache = memory_cache();
        cache
            .set("u:1", &json!("v1"), SetOptions::tagged(["users"]))
            .await
            .unwrap();
        cache
            .set("u:2", &json!("v2"), SetOptions::tagged(["users"]))
            .await
            .unwrap();
        cache
            .set("p:1", &json!("v3"), SetOptions::tagged(["products"]))
            .await
            .unwrap();

        let removed = cache.invalidate_by_tags(&["users".to_string()]).await;
        assert_eq!(removed, 2);
        assert_eq!(cache.get("u:1").await, None);
        assert_eq!(cache.get("u:2").await, None);
        assert_eq!(cache.get("p:1").await, Some(json!("v3")));
    }

    #[tokio::test]
    async fn test_mget_mset() {
        let cache = memory_cache();
        cache
            .mset(
                &[("a", json!(1)), ("b", json!(2))],
                SetOptions::default(),
            )
            .await
            .unwrap();
        let found = cache.mget(&["a", "b", "c"]).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], json!(1));
        assert_eq!(found["b"], json!(2));
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let cache = memory_cache();
        for key in ["user:1", "user:2", "post:9"] {
            cache.set(key, &json!(0), SetOptions::default()).await.unwrap();
        }
        let mut users = cache.keys(Some("user:*")).await;
        users.sort();
        assert_eq!(users, vec!["user:1", "user:2"]);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let opts = CacheOptions {
            memory_max_bytes: 256,
            enable_compression: false,
            enable_encryption: false,
            ..options()
        };
        let cache = SecureCache::new(opts, provider()).unwrap();
        let big = json!("x".repeat(4096));
        let err = cache.set("big", &big, SetOptions::default()).await.unwrap_err();
        assert!(matches!(err, XyPrissError::CacheSerialization(_)));
    }

    #[test]
    fn test_encode_flags() {
        let cache = memory_cache();
        // Small value: below the compression threshold, encrypted by default.
        let (_, flags) = cache.encode(&json!("small"), &SetOptions::default()).unwrap();
        assert!(!flags.compressed);
        assert!(flags.encrypted);

        // Large repetitive value: compressed and encrypted.
        let big = json!("abc".repeat(2048));
        let (_, flags) = cache.encode(&big, &SetOptions::default()).unwrap();
        assert!(flags.compressed);

        // Explicit opt-out of both.
        let opts = SetOptions {
            compress: Some(false),
            encrypt: Some(false),
            ..Default::default()
        };
        let (framed, flags) = cache.encode(&big, &opts).unwrap();
        assert!(!flags.compressed);
        assert!(!flags.encrypted);
        let decoded = cache.decode(&framed).unwrap();
        assert_eq!(decoded, big);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let cache = memory_cache();
        assert!(cache.decode(b"not a frame").is_err());
    }

    #[tokio::test]
    async fn test_hybrid_writes_both_tiers() {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = hybrid_cache(backend.clone()).await;

        cache.set("k", &json!("v"), SetOptions::default()).await.unwrap();
        assert!(backend.get("k").await.unwrap().is_some());
        assert_eq!(cache.get("k").await, Some(json!("v")));
        assert_eq!(cache.get_stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn test_hybrid_promotes_distributed_hit() {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = hybrid_cache(backend.clone()).await;

        cache.set("k", &json!("v"), SetOptions::default()).await.unwrap();
        // Drop the memory copy; the next read must come from the
        // distributed tier and be promoted back.
        cache.memory.delete("k");
        assert_eq!(cache.get("k").await, Some(json!("v")));
        assert_eq!(cache.get_stats().distributed_hits, 1);
        assert!(cache.memory.exists("k"));
    }

    #[tokio::test]
    async fn test_outage_degrades_to_memory() {
        let backend = Arc::new(InMemoryBackend::new());
        let cache = hybrid_cache(backend.clone()).await;

        cache.set("k", &json!("v"), SetOptions::default()).await.unwrap();
        backend.set_failing(true);
        cache.memory.delete("k");

        // Distributed read fails: degrade, report a miss.
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.get_health().status, CacheHealthStatus::Degraded);

        // Memory tier keeps serving.
        cache.set("m", &json!("local"), SetOptions::default()).await.unwrap();
        assert_eq!(cache.get("m").await, Some(json!("local")));
    }

    #[tokio::test]
    async fn test_redis_strategy_requires_backend() {
        let opts = CacheOptions {
            strategy: CacheStrategy::Redis,
            ..options()
        };
        assert!(SecureCache::new(opts, provider()).is_err());
    }

    #[tokio::test]
    async fn test_connect_idempotent_memory_only() {
        let cache = memory_cache();
        cache.connect().await.unwrap();
        cache.connect().await.unwrap();
        cache.disconnect().await.unwrap();
        assert_eq!(cache.get_health().status, CacheHealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_auto_resolves_to_hybrid_when_reachable() {
        let backend = Arc::new(InMemoryBackend::new());
        let opts = CacheOptions {
            strategy: CacheStrategy::Auto,
            async_distributed_writes: false,
            ..options()
        };
        let cache = SecureCache::with_backend(opts, provider(), backend.clone()).unwrap();
        cache.connect().await.unwrap();

        cache.set("k", &json!(1), SetOptions::default()).await.unwrap();
        assert!(backend.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_purges_expired() {
        let cache = memory_cache();
        cache
            .set("gone", &json!(1), SetOptions::ttl_secs(0))
            .await
            .unwrap();
        cache.set("kept", &json!(2), SetOptions::default()).await.unwrap();
        // Zero-second TTL expires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get("kept").await, Some(json!(2)));
    }
}
