//! In-process cache tier.
//!
//! Fixed-capacity (bytes and entry count) LRU store with a tag index that is
//! updated atomically with the entries it describes. All operations take one
//! short-held lock; nothing here crosses an I/O boundary.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::core::{XyPrissError, XyResult};

/// Encoding applied to the stored bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodingFlags {
    pub compressed: bool,
    pub encrypted: bool,
}

/// One stored entry: encoded bytes plus bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub data: Vec<u8>,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
    pub tags: Vec<String>,
    pub flags: EncodingFlags,
    pub size_bytes: usize,
}

impl StoredEntry {
    pub fn new(data: Vec<u8>, ttl: Option<Duration>, tags: Vec<String>, flags: EncodingFlags) -> Self {
        let size_bytes = data.len();
        let now = Instant::now();
        Self {
            data,
            created_at: now,
            expires_at: ttl.map(|t| now + t),
            tags,
            flags,
            size_bytes,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }

    /// Remaining TTL in whole seconds: `-1` when no TTL is set.
    fn ttl_secs(&self) -> i64 {
        match self.expires_at {
            None => -1,
            Some(at) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
        }
    }
}

struct MemoryInner {
    entries: LruCache<String, StoredEntry>,
    tag_index: HashMap<String, HashSet<String>>,
    bytes_used: usize,
}

impl MemoryInner {
    fn index_tags(&mut self, key: &str, tags: &[String]) {
        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex_tags(&mut self, key: &str, tags: &[String]) {
        for tag in tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    /// Removes an entry and its tag references in one step.
    fn remove_entry(&mut self, key: &str) -> Option<StoredEntry> {
        let entry = self.entries.pop(key)?;
        self.bytes_used -= entry.size_bytes;
        let tags = entry.tags.clone();
        self.unindex_tags(key, &tags);
        Some(entry)
    }
}

/// Outcome counters from a mutation, fed back into the cache stats.
#[derive(Debug, Default, Clone, Copy)]
pub struct TierMutation {
    pub evicted: u64,
    pub expired: u64,
}

pub struct MemoryTier {
    inner: Mutex<MemoryInner>,
    max_bytes: usize,
    max_entries: usize,
}

impl MemoryTier {
    pub fn new(max_bytes: usize, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: LruCache::unbounded(),
                tag_index: HashMap::new(),
                bytes_used: 0,
            }),
            max_bytes: max_bytes.max(1),
            max_entries: max_entries.max(1),
        }
    }

    /// Returns the entry if present and unexpired, refreshing its LRU
    /// position. Expired entries are removed lazily and reported.
    pub fn get(&self, key: &str) -> (Option<StoredEntry>, TierMutation) {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.entries.get(key) {
            None => return (None, TierMutation::default()),
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return (Some(entry.clone()), TierMutation::default()),
        };
        debug_assert!(expired);
        inner.remove_entry(key);
        (
            None,
            TierMutation {
                expired: 1,
                ..Default::default()
            },
        )
    }

    /// Inserts an entry, evicting least-recently-used entries until both
    /// capacity limits fit. A single entry larger than the byte capacity is
    /// rejected outright.
    pub fn put(&self, key: String, entry: StoredEntry) -> XyResult<TierMutation> {
        if entry.size_bytes > self.max_bytes {
            return Err(XyPrissError::CacheSerialization(format!(
                "entry of {} bytes exceeds memory tier capacity of {} bytes",
                entry.size_bytes, self.max_bytes
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        let mut mutation = TierMutation::default();

        // Replacing an existing entry releases its accounting first.
        inner.remove_entry(&key);

        while inner.entries.len() + 1 > self.max_entries
            || inner.bytes_used + entry.size_bytes > self.max_bytes
        {
            let victim_key = match inner.entries.peek_lru() {
                Some((k, _)) => k.clone(),
                None => break,
            };
            inner.remove_entry(&victim_key);
            mutation.evicted += 1;
        }

        inner.bytes_used += entry.size_bytes;
        let tags = entry.tags.clone();
        inner.index_tags(&key, &tags);
        inner.entries.put(key, entry);
        Ok(mutation)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().unwrap().remove_entry(key).is_some()
    }

    /// Presence check without refreshing LRU order.
    pub fn exists(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .peek(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    /// TTL in seconds: `-1` for no TTL, `-2` when absent.
    pub fn ttl(&self, key: &str) -> i64 {
        let inner = self.inner.lock().unwrap();
        match inner.entries.peek(key) {
            Some(entry) if !entry.is_expired() => entry.ttl_secs(),
            _ => -2,
        }
    }

    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.peek_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        }
    }

    /// Keys matching a glob pattern (`*`, `?`), unexpired only. Documented
    /// as expensive: walks every entry.
    pub fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .filter(|(key, _)| pattern.map(|p| glob_match(p, key)).unwrap_or(true))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Atomically removes every key referenced by any of the tags; returns
    /// the removed keys.
    pub fn invalidate_tags(&self, tags: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let mut keys: HashSet<String> = HashSet::new();
        for tag in tags {
            if let Some(tagged) = inner.tag_index.get(tag) {
                keys.extend(tagged.iter().cloned());
            }
        }
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if inner.remove_entry(&key).is_some() {
                removed.push(key);
            }
        }
        removed
    }

    /// Purges expired entries; invoked by the periodic sweep.
    pub fn sweep_expired(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        let count = expired.len() as u64;
        for key in expired {
            inner.remove_entry(&key);
        }
        count
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.tag_index.clear();
        inner.bytes_used = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_used(&self) -> usize {
        self.inner.lock().unwrap().bytes_used
    }

    /// Tags currently attached to a key; used to mirror invalidation to the
    /// distributed tier and by the invariant tests.
    pub fn tags_of(&self, key: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .peek(key)
            .map(|e| e.tags.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn tag_index_keys(&self, tag: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Glob matcher supporting `*` (any run) and `?` (any single char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut matched) = (None, 0usize);

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            matched = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            matched += 1;
            t = matched;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(data: &[u8], ttl: Option<Duration>, tags: &[&str]) -> StoredEntry {
        StoredEntry::new(
            data.to_vec(),
            ttl,
            tags.iter().map(|s| s.to_string()).collect(),
            EncodingFlags::default(),
        )
    }

    #[test]
    fn test_put_get_roundtrip() {
        let tier = MemoryTier::new(1024, 16);
        tier.put("a".into(), entry(b"hello", None, &[])).unwrap();
        let (found, _) = tier.get("a");
        assert_eq!(found.unwrap().data, b"hello");
        assert_eq!(tier.bytes_used(), 5);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let tier = MemoryTier::new(8, 16);
        let err = tier.put("big".into(), entry(&[0u8; 64], None, &[])).unwrap_err();
        assert!(matches!(err, XyPrissError::CacheSerialization(_)));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_lru_eviction_on_entry_count() {
        let tier = MemoryTier::new(1024, 2);
        tier.put("a".into(), entry(b"1", None, &[])).unwrap();
        tier.put("b".into(), entry(b"2", None, &[])).unwrap();
        // Touch "a" so "b" becomes the LRU victim.
        tier.get("a");
        let mutation = tier.put("c".into(), entry(b"3", None, &[])).unwrap();
        assert_eq!(mutation.evicted, 1);
        assert!(tier.exists("a"));
        assert!(!tier.exists("b"));
        assert!(tier.exists("c"));
    }

    #[test]
    fn test_byte_capacity_eviction() {
        let tier = MemoryTier::new(10, 16);
        tier.put("a".into(), entry(&[0u8; 4], None, &[])).unwrap();
        tier.put("b".into(), entry(&[0u8; 4], None, &[])).unwrap();
        // 4 + 4 + 4 > 10: the LRU entry must go.
        let mutation = tier.put("c".into(), entry(&[0u8; 4], None, &[])).unwrap();
        assert_eq!(mutation.evicted, 1);
        assert!(!tier.exists("a"));
        assert_eq!(tier.bytes_used(), 8);
    }

    #[test]
    fn test_expired_not_returned() {
        let tier = MemoryTier::new(1024, 16);
        tier.put("a".into(), entry(b"v", Some(Duration::ZERO), &[]))
            .unwrap();
        let (found, mutation) = tier.get("a");
        assert!(found.is_none());
        assert_eq!(mutation.expired, 1);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_ttl_codes() {
        let tier = MemoryTier::new(1024, 16);
        tier.put("forever".into(), entry(b"v", None, &[])).unwrap();
        tier.put("soon".into(), entry(b"v", Some(Duration::from_secs(60)), &[]))
            .unwrap();
        assert_eq!(tier.ttl("forever"), -1);
        assert!(tier.ttl("soon") <= 60 && tier.ttl("soon") >= 58);
        assert_eq!(tier.ttl("missing"), -2);
    }

    #[test]
    fn test_expire_updates_deadline() {
        let tier = MemoryTier::new(1024, 16);
        tier.put("a".into(), entry(b"v", None, &[])).unwrap();
        assert!(tier.expire("a", Duration::from_secs(30)));
        assert!(tier.ttl("a") <= 30 && tier.ttl("a") >= 28);
        assert!(!tier.expire("missing", Duration::from_secs(1)));
    }

    #[test]
    fn test_tag_index_invariant() {
        let tier = MemoryTier::new(1024, 16);
        tier.put("u:1".into(), entry(b"1", None, &["users"])).unwrap();
        tier.put("u:2".into(), entry(b"2", None, &["users", "admins"]))
            .unwrap();

        let mut users = tier.tag_index_keys("users");
        users.sort();
        assert_eq!(users, vec!["u:1", "u:2"]);

        // Deleting an entry removes its tag references; empty sets pruned.
        tier.delete("u:2");
        assert_eq!(tier.tag_index_keys("users"), vec!["u:1"]);
        assert!(tier.tag_index_keys("admins").is_empty());
    }

    #[test]
    fn test_invalidate_tags() {
        let tier = MemoryTier::new(1024, 16);
        tier.put("u:1".into(), entry(b"1", None, &["users"])).unwrap();
        tier.put("u:2".into(), entry(b"2", None, &["users"])).unwrap();
        tier.put("p:1".into(), entry(b"3", None, &["products"])).unwrap();

        let removed = tier.invalidate_tags(&["users".to_string()]);
        assert_eq!(removed.len(), 2);
        assert!(!tier.exists("u:1"));
        assert!(!tier.exists("u:2"));
        assert!(tier.exists("p:1"));
    }

    #[test]
    fn test_eviction_drops_tag_references() {
        let tier = MemoryTier::new(1024, 1);
        tier.put("a".into(), entry(b"1", None, &["t"])).unwrap();
        tier.put("b".into(), entry(b"2", None, &["t"])).unwrap();
        assert_eq!(tier.tag_index_keys("t"), vec!["b"]);
    }

    #[test]
    fn test_sweep_expired() {
        let tier = MemoryTier::new(1024, 16);
        tier.put("gone".into(), entry(b"1", Some(Duration::ZERO), &["t"]))
            .unwrap();
        tier.put("kept".into(), entry(b"2", None, &["t"])).unwrap();
        assert_eq!(tier.sweep_expired(), 1);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.tag_index_keys("t"), vec!["kept"]);
    }

    #[test]
    fn test_keys_glob() {
        let tier = MemoryTier::new(1024, 16);
        for key in ["user:1", "user:2", "post:1"] {
            tier.put(key.into(), entry(b"v", None, &[])).unwrap();
        }
        let mut users = tier.keys(Some("user:*"));
        users.sort();
        assert_eq!(users, vec!["user:1", "user:2"]);
        assert_eq!(tier.keys(Some("user:?")).len(), 2);
        assert_eq!(tier.keys(None).len(), 3);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("user:*", "user:42"));
        assert!(glob_match("u?er", "user"));
        assert!(!glob_match("user:*", "post:1"));
        assert!(!glob_match("u?er", "uber2"));
        assert!(glob_match("a*b*c", "aXbYc"));
        assert!(!glob_match("a*b*c", "aXcYb"));
    }
}
