//! Request rate limiting.
//!
//! Three strategies: fixed-window and token-bucket counters are local;
//! sliding-window uses the rate estimator the serving stack ships with.
//! Counters can optionally live in the secure cache for distributed
//! limiting. Exceeding the limit produces a 429 with `Retry-After` and the
//! `{prefix}-Limit` / `-Remaining` / `-Reset` headers.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use http::StatusCode;
use pingora_limits::rate::Rate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cache::{SecureCache, SetOptions};
use crate::core::{Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    #[default]
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// What a counter is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyScope {
    Global,
    #[default]
    PerIp,
    PerUser,
    PerRoute,
}

#[derive(Debug, Clone)]
pub struct RateLimitOptions {
    pub enabled: bool,
    pub strategy: RateLimitStrategy,
    pub max_requests: u64,
    pub window: Duration,
    pub key_scope: KeyScope,
    pub header_prefix: String,
    /// Store fixed-window counters in the secure cache for cross-instance
    /// limiting.
    pub distributed: bool,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RateLimitStrategy::FixedWindow,
            max_requests: 100,
            window: Duration::from_secs(60),
            key_scope: KeyScope::PerIp,
            header_prefix: "X-RateLimit".to_string(),
            distributed: false,
        }
    }
}

/// Outcome of a limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
}

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

pub struct RateLimitPlugin {
    options: RateLimitOptions,
    sliding: Rate,
    fixed: DashMap<String, (u64, u64)>,
    buckets: DashMap<String, Bucket>,
    cache: Option<Arc<SecureCache>>,
}

impl RateLimitPlugin {
    pub fn new(options: RateLimitOptions, cache: Option<Arc<SecureCache>>) -> Self {
        Self {
            sliding: Rate::new(options.window),
            fixed: DashMap::new(),
            buckets: DashMap::new(),
            cache: if options.distributed { cache } else { None },
            options,
        }
    }

    fn key(&self, req: &Request) -> String {
        match self.options.key_scope {
            KeyScope::Global => "global".to_string(),
            KeyScope::PerIp => {
                let ip = req.client_ip();
                if ip.is_empty() {
                    "unknown-ip".to_string()
                } else {
                    ip
                }
            }
            KeyScope::PerUser => req
                .header("x-user-id")
                .map(|id| format!("user:{id}"))
                .unwrap_or_else(|| {
                    let ip = req.client_ip();
                    format!("anon:{ip}")
                }),
            KeyScope::PerRoute => format!("route:{}", req.path()),
        }
    }

    fn window_index(&self) -> u64 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        secs / self.options.window.as_secs().max(1)
    }

    async fn observe_fixed(&self, key: &str) -> u64 {
        let window = self.window_index();
        if let Some(cache) = &self.cache {
            let cache_key = format!("ratelimit:{key}:{window}");
            let count = cache
                .get(&cache_key)
                .await
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                + 1;
            let _ = cache
                .set(
                    &cache_key,
                    &JsonValue::from(count),
                    SetOptions {
                        ttl: Some(self.options.window * 2),
                        compress: Some(false),
                        encrypt: Some(false),
                        ..Default::default()
                    },
                )
                .await;
            return count;
        }

        let mut entry = self.fixed.entry(key.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        entry.1 += 1;
        entry.1
    }

    fn observe_bucket(&self, key: &str) -> u64 {
        let capacity = self.options.max_requests as f64;
        let refill_per_sec = capacity / self.options.window.as_secs_f64().max(0.001);

        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            refreshed: Instant::now(),
        });
        let elapsed = bucket.refreshed.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.refreshed = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            (capacity - bucket.tokens) as u64
        } else {
            self.options.max_requests + 1
        }
    }

    /// Checks the limit for a request, consuming one unit.
    pub async fn check(&self, req: &Request) -> RateDecision {
        let limit = self.options.max_requests;
        if !self.options.enabled {
            return RateDecision {
                allowed: true,
                limit,
                remaining: limit,
                reset_secs: 0,
            };
        }
        let key = self.key(req);

        let used = match self.options.strategy {
            RateLimitStrategy::FixedWindow => self.observe_fixed(&key).await,
            RateLimitStrategy::SlidingWindow => self.sliding.observe(&key, 1).max(0) as u64,
            RateLimitStrategy::TokenBucket => self.observe_bucket(&key),
        };

        RateDecision {
            allowed: used <= limit,
            limit,
            remaining: limit.saturating_sub(used),
            reset_secs: self.options.window.as_secs(),
        }
    }

    /// Pre-filter entry point: on an exceeded limit, writes the 429 and
    /// returns true (request handled).
    pub async fn apply(&self, req: &Request, res: &mut Response) -> bool {
        let decision = self.check(req).await;
        let prefix = &self.options.header_prefix;
        res.set_header(&format!("{prefix}-Limit"), &decision.limit.to_string());
        res.set_header(
            &format!("{prefix}-Remaining"),
            &decision.remaining.to_string(),
        );
        res.set_header(&format!("{prefix}-Reset"), &decision.reset_secs.to_string());

        if decision.allowed {
            return false;
        }
        res.set_header("Retry-After", &decision.reset_secs.to_string());
        res.send_error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "rate limit exceeded",
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn request_from(ip: &str) -> Request {
        let mut req = Request::from_parts(Method::GET, "/resource");
        req.remote_addr = Some(format!("{ip}:1000").parse().unwrap());
        req
    }

    fn plugin(strategy: RateLimitStrategy, max_requests: u64) -> RateLimitPlugin {
        RateLimitPlugin::new(
            RateLimitOptions {
                strategy,
                max_requests,
                window: Duration::from_secs(60),
                ..Default::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_fixed_window_boundary() {
        let limiter = plugin(RateLimitStrategy::FixedWindow, 3);
        let req = request_from("10.0.0.1");

        // Exactly `max_requests` calls succeed; the next one is rejected.
        for _ in 0..3 {
            assert!(limiter.check(&req).await.allowed);
        }
        let decision = limiter.check(&req).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_keys_are_isolated_per_ip() {
        let limiter = plugin(RateLimitStrategy::FixedWindow, 1);
        assert!(limiter.check(&request_from("10.0.0.1")).await.allowed);
        assert!(!limiter.check(&request_from("10.0.0.1")).await.allowed);
        // A different client has its own counter.
        assert!(limiter.check(&request_from("10.0.0.2")).await.allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_burst_then_block() {
        let limiter = plugin(RateLimitStrategy::TokenBucket, 4);
        let req = request_from("10.0.0.3");
        for _ in 0..4 {
            assert!(limiter.check(&req).await.allowed);
        }
        assert!(!limiter.check(&req).await.allowed);
    }

    #[tokio::test]
    async fn test_sliding_window_blocks_over_limit() {
        let limiter = plugin(RateLimitStrategy::SlidingWindow, 5);
        let req = request_from("10.0.0.4");
        let mut allowed = 0;
        for _ in 0..10 {
            if limiter.check(&req).await.allowed {
                allowed += 1;
            }
        }
        assert!(allowed <= 5);
        assert!(allowed >= 1);
    }

    #[tokio::test]
    async fn test_apply_writes_429_with_headers() {
        let limiter = plugin(RateLimitStrategy::FixedWindow, 1);
        let req = request_from("10.0.0.5");
        let mut res = Response::new();
        assert!(!limiter.apply(&req, &mut res).await);

        let mut res = Response::new();
        assert!(limiter.apply(&req, &mut res).await);
        assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers.get("x-ratelimit-limit").unwrap(), "1");
        assert_eq!(res.headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert!(res.headers.contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_distributed_counters_in_cache() {
        use crate::cache::{CacheOptions, SecureCache};
        use crate::crypto::StubCryptoProvider;

        let cache = Arc::new(
            SecureCache::new(
                CacheOptions {
                    master_key: Some("rl".to_string()),
                    ..Default::default()
                },
                Arc::new(StubCryptoProvider),
            )
            .unwrap(),
        );
        let limiter = RateLimitPlugin::new(
            RateLimitOptions {
                max_requests: 2,
                distributed: true,
                ..Default::default()
            },
            Some(cache.clone()),
        );

        let req = request_from("10.0.0.6");
        assert!(limiter.check(&req).await.allowed);
        assert!(limiter.check(&req).await.allowed);
        assert!(!limiter.check(&req).await.allowed);

        // The counter is observable in the cache.
        let keys = cache.keys(Some("ratelimit:*")).await;
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn test_per_user_scope() {
        let limiter = RateLimitPlugin::new(
            RateLimitOptions {
                max_requests: 1,
                key_scope: KeyScope::PerUser,
                ..Default::default()
            },
            None,
        );

        let mut alice = request_from("10.0.0.7");
        alice.headers.insert("x-user-id", "alice".parse().unwrap());
        let mut bob = request_from("10.0.0.7");
        bob.headers.insert("x-user-id", "bob".parse().unwrap());

        assert!(limiter.check(&alice).await.allowed);
        assert!(!limiter.check(&alice).await.allowed);
        assert!(limiter.check(&bob).await.allowed);
    }
}
