//! Typed plugin registry and hook dispatcher.
//!
//! Plugins move through registered → initialized → running → stopping →
//! stopped; any state can drop to failed, and failed plugins are skipped by
//! hook dispatch until re-initialized. Hook invocations run in priority
//! order (higher first, the registry convention), are gated by the
//! per-plugin allowed-hooks policy, and are isolated: a plugin error or
//! panic is recorded and never propagates. Three consecutive failures on
//! the same hook trip a per-hook circuit breaker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::core::{XyPrissError, XyResult};

/// Consecutive same-hook failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 3;

/// Default per-plugin init/start/stop timeout.
pub const DEFAULT_LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Security,
    Performance,
    Cache,
    Network,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Registered,
    Initialized,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Hook points emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Hook {
    #[serde(rename = "onServerStart")]
    ServerStart,
    #[serde(rename = "onServerStop")]
    ServerStop,
    #[serde(rename = "onRequestStart")]
    RequestStart,
    #[serde(rename = "onRequestEnd")]
    RequestEnd,
    #[serde(rename = "onRequestError")]
    RequestError,
    #[serde(rename = "onRouteRegister")]
    RouteRegister,
    #[serde(rename = "onCacheHit")]
    CacheHit,
    #[serde(rename = "onCacheMiss")]
    CacheMiss,
    #[serde(rename = "onConsoleLog")]
    ConsoleLog,
}

impl Hook {
    /// Parses a configuration hook name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "onServerStart" => Some(Hook::ServerStart),
            "onServerStop" => Some(Hook::ServerStop),
            "onRequestStart" => Some(Hook::RequestStart),
            "onRequestEnd" => Some(Hook::RequestEnd),
            "onRequestError" => Some(Hook::RequestError),
            "onRouteRegister" => Some(Hook::RouteRegister),
            "onCacheHit" => Some(Hook::CacheHit),
            "onCacheMiss" => Some(Hook::CacheMiss),
            "onConsoleLog" => Some(Hook::ConsoleLog),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::ServerStart => "onServerStart",
            Hook::ServerStop => "onServerStop",
            Hook::RequestStart => "onRequestStart",
            Hook::RequestEnd => "onRequestEnd",
            Hook::RequestError => "onRequestError",
            Hook::RouteRegister => "onRouteRegister",
            Hook::CacheHit => "onCacheHit",
            Hook::CacheMiss => "onCacheMiss",
            Hook::ConsoleLog => "onConsoleLog",
        }
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    fn plugin_type(&self) -> PluginType {
        PluginType::Other
    }

    /// Higher priorities are invoked earlier.
    fn priority(&self) -> i32 {
        0
    }

    async fn init(&self) -> XyResult<()> {
        Ok(())
    }

    async fn start(&self) -> XyResult<()> {
        Ok(())
    }

    async fn stop(&self) -> XyResult<()> {
        Ok(())
    }

    async fn on_hook(&self, hook: Hook, payload: &JsonValue) -> XyResult<()>;
}

/// Per-plugin policy supplied at registration.
#[derive(Debug, Clone, Default)]
pub struct PluginPolicy {
    /// Hooks this plugin may receive; `None` allows all.
    pub allowed_hooks: Option<HashSet<Hook>>,
    pub lifecycle_timeout: Option<Duration>,
}

struct PluginRecord {
    plugin: Arc<dyn Plugin>,
    policy: PluginPolicy,
    state: Mutex<LifecycleState>,
    invocations: AtomicU64,
    failures: AtomicU64,
    denied: AtomicU64,
    total_micros: AtomicU64,
    last_error: Mutex<Option<String>>,
    consecutive_failures: DashMap<Hook, u32>,
    broken_hooks: DashMap<Hook, ()>,
}

impl PluginRecord {
    fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap() = state;
    }

    fn allows(&self, hook: Hook) -> bool {
        self.policy
            .allowed_hooks
            .as_ref()
            .map(|set| set.contains(&hook))
            .unwrap_or(true)
    }

    fn record_failure(&self, hook: Hook, message: String) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = Some(message);
        let mut consecutive = self.consecutive_failures.entry(hook).or_insert(0);
        *consecutive += 1;
        if *consecutive >= BREAKER_THRESHOLD {
            self.broken_hooks.insert(hook, ());
            log::warn!(
                "plugin {} auto-disabled for {} after {} consecutive failures",
                self.plugin.id(),
                hook.as_str(),
                *consecutive
            );
        }
    }

    fn record_success(&self, hook: Hook) {
        self.consecutive_failures.insert(hook, 0);
    }
}

/// Snapshot row from [`PluginEngine::get_plugin_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct PluginStats {
    pub id: String,
    pub plugin_type: PluginType,
    pub state: LifecycleState,
    pub invocations: u64,
    pub failures: u64,
    pub denied: u64,
    pub average_latency_micros: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
pub struct PluginEngine {
    plugins: DashMap<String, Arc<PluginRecord>>,
}

impl PluginEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers, initializes and starts a plugin. Duplicate ids are
    /// rejected. A lifecycle step that errors or exceeds its timeout leaves
    /// the plugin in `failed` state.
    pub async fn register(&self, plugin: Arc<dyn Plugin>, policy: PluginPolicy) -> XyResult<()> {
        let id = plugin.id().to_string();
        if self.plugins.contains_key(&id) {
            return Err(XyPrissError::Plugin(format!("duplicate plugin id: {id}")));
        }

        let record = Arc::new(PluginRecord {
            plugin,
            policy,
            state: Mutex::new(LifecycleState::Registered),
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            last_error: Mutex::new(None),
            consecutive_failures: DashMap::new(),
            broken_hooks: DashMap::new(),
        });
        self.plugins.insert(id.clone(), record.clone());

        self.bring_up(&record).await
    }

    async fn bring_up(&self, record: &Arc<PluginRecord>) -> XyResult<()> {
        let timeout = record
            .policy
            .lifecycle_timeout
            .unwrap_or(DEFAULT_LIFECYCLE_TIMEOUT);
        let id = record.plugin.id().to_string();

        match tokio::time::timeout(timeout, record.plugin.init()).await {
            Ok(Ok(())) => record.set_state(LifecycleState::Initialized),
            Ok(Err(e)) => {
                record.set_state(LifecycleState::Failed);
                return Err(XyPrissError::Plugin(format!("init of {id} failed: {e}")));
            }
            Err(_) => {
                record.set_state(LifecycleState::Failed);
                return Err(XyPrissError::Plugin(format!("init of {id} timed out")));
            }
        }

        match tokio::time::timeout(timeout, record.plugin.start()).await {
            Ok(Ok(())) => {
                record.set_state(LifecycleState::Running);
                Ok(())
            }
            Ok(Err(e)) => {
                record.set_state(LifecycleState::Failed);
                Err(XyPrissError::Plugin(format!("start of {id} failed: {e}")))
            }
            Err(_) => {
                record.set_state(LifecycleState::Failed);
                Err(XyPrissError::Plugin(format!("start of {id} timed out")))
            }
        }
    }

    /// Stops and removes a plugin.
    pub async fn unregister(&self, id: &str) -> bool {
        let Some((_, record)) = self.plugins.remove(id) else {
            return false;
        };
        record.set_state(LifecycleState::Stopping);
        let timeout = record
            .policy
            .lifecycle_timeout
            .unwrap_or(DEFAULT_LIFECYCLE_TIMEOUT);
        match tokio::time::timeout(timeout, record.plugin.stop()).await {
            Ok(Ok(())) => record.set_state(LifecycleState::Stopped),
            Ok(Err(e)) => {
                log::warn!("plugin {id} stop failed: {e}");
                record.set_state(LifecycleState::Failed);
            }
            Err(_) => {
                log::warn!("plugin {id} stop timed out");
                record.set_state(LifecycleState::Failed);
            }
        }
        true
    }

    /// Re-runs init/start for a failed plugin, clearing its breaker state.
    pub async fn reinitialize(&self, id: &str) -> XyResult<()> {
        let record = self
            .plugins
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| XyPrissError::Plugin(format!("unknown plugin: {id}")))?;
        record.broken_hooks.clear();
        record.consecutive_failures.clear();
        record.set_state(LifecycleState::Registered);
        self.bring_up(&record).await
    }

    pub fn state_of(&self, id: &str) -> Option<LifecycleState> {
        self.plugins.get(id).map(|r| r.state())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Invokes a hook on every eligible plugin, in priority order. Plugin
    /// failures are contained; the call itself never fails.
    pub async fn invoke_hook(&self, hook: Hook, payload: &JsonValue) {
        let mut records: Vec<Arc<PluginRecord>> =
            self.plugins.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.plugin.priority()));

        for record in records {
            if record.state() != LifecycleState::Running {
                continue;
            }
            if !record.allows(hook) {
                // Denied invocations are a counted no-op.
                record.denied.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if record.broken_hooks.contains_key(&hook) {
                continue;
            }

            record.invocations.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let outcome = std::panic::AssertUnwindSafe(record.plugin.on_hook(hook, payload))
                .catch_unwind()
                .await;
            record
                .total_micros
                .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

            match outcome {
                Ok(Ok(())) => record.record_success(hook),
                Ok(Err(e)) => {
                    log::warn!(
                        "plugin {} failed on {}: {e}",
                        record.plugin.id(),
                        hook.as_str()
                    );
                    record.record_failure(hook, e.to_string());
                }
                Err(_) => {
                    log::error!(
                        "plugin {} panicked on {}",
                        record.plugin.id(),
                        hook.as_str()
                    );
                    record.record_failure(hook, "panic".to_string());
                }
            }
        }
    }

    pub fn get_plugin_stats(&self) -> Vec<PluginStats> {
        let mut stats: Vec<PluginStats> = self
            .plugins
            .iter()
            .map(|entry| {
                let record = entry.value();
                let invocations = record.invocations.load(Ordering::Relaxed);
                let total = record.total_micros.load(Ordering::Relaxed);
                PluginStats {
                    id: entry.key().clone(),
                    plugin_type: record.plugin.plugin_type(),
                    state: record.state(),
                    invocations,
                    failures: record.failures.load(Ordering::Relaxed),
                    denied: record.denied.load(Ordering::Relaxed),
                    average_latency_micros: if invocations == 0 {
                        0
                    } else {
                        total / invocations
                    },
                    last_error: record.last_error.lock().unwrap().clone(),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Recorder {
        id: String,
        priority: i32,
        calls: Arc<Mutex<Vec<String>>>,
        fail: AtomicBool,
        panic_on_hook: bool,
    }

    impl Recorder {
        fn new(id: &str, priority: i32, calls: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                priority,
                calls,
                fail: AtomicBool::new(false),
                panic_on_hook: false,
            })
        }
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn id(&self) -> &str {
            &self.id
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn on_hook(&self, hook: Hook, _payload: &JsonValue) -> XyResult<()> {
            if self.panic_on_hook {
                panic!("deliberate test panic");
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(XyPrissError::Plugin("forced failure".to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.id, hook.as_str()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle_and_duplicate_rejection() {
        let engine = PluginEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        engine
            .register(Recorder::new("p1", 0, calls.clone()), PluginPolicy::default())
            .await
            .unwrap();
        assert_eq!(engine.state_of("p1"), Some(LifecycleState::Running));

        let err = engine
            .register(Recorder::new("p1", 0, calls), PluginPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, XyPrissError::Plugin(_)));

        assert!(engine.unregister("p1").await);
        assert!(!engine.unregister("p1").await);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let engine = PluginEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        engine
            .register(Recorder::new("low", 1, calls.clone()), PluginPolicy::default())
            .await
            .unwrap();
        engine
            .register(Recorder::new("high", 100, calls.clone()), PluginPolicy::default())
            .await
            .unwrap();

        engine
            .invoke_hook(Hook::RequestStart, &JsonValue::Null)
            .await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["high:onRequestStart", "low:onRequestStart"]
        );
    }

    #[tokio::test]
    async fn test_allowed_hooks_gating() {
        let engine = PluginEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut allowed = HashSet::new();
        allowed.insert(Hook::CacheHit);
        engine
            .register(
                Recorder::new("gated", 0, calls.clone()),
                PluginPolicy {
                    allowed_hooks: Some(allowed),
                    lifecycle_timeout: None,
                },
            )
            .await
            .unwrap();

        engine.invoke_hook(Hook::RequestStart, &JsonValue::Null).await;
        engine.invoke_hook(Hook::CacheHit, &JsonValue::Null).await;

        assert_eq!(*calls.lock().unwrap(), vec!["gated:onCacheHit"]);
        let stats = &engine.get_plugin_stats()[0];
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.invocations, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_per_hook() {
        let engine = PluginEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plugin = Recorder::new("flaky", 0, calls.clone());
        engine
            .register(plugin.clone(), PluginPolicy::default())
            .await
            .unwrap();

        plugin.fail.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            engine.invoke_hook(Hook::RequestEnd, &JsonValue::Null).await;
        }

        // Breaker open: even after recovery the hook is skipped.
        plugin.fail.store(false, Ordering::SeqCst);
        engine.invoke_hook(Hook::RequestEnd, &JsonValue::Null).await;
        assert!(calls.lock().unwrap().is_empty());

        // Other hooks still flow.
        engine.invoke_hook(Hook::RequestStart, &JsonValue::Null).await;
        assert_eq!(*calls.lock().unwrap(), vec!["flaky:onRequestStart"]);

        // Re-initialization resets the breaker.
        engine.reinitialize("flaky").await.unwrap();
        engine.invoke_hook(Hook::RequestEnd, &JsonValue::Null).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["flaky:onRequestStart", "flaky:onRequestEnd"]
        );

        let stats = &engine.get_plugin_stats()[0];
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.last_error.as_deref(), Some("forced failure"));
    }

    #[tokio::test]
    async fn test_panic_contained() {
        let engine = PluginEngine::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let plugin = Arc::new(Recorder {
            id: "panics".to_string(),
            priority: 0,
            calls: calls.clone(),
            fail: AtomicBool::new(false),
            panic_on_hook: true,
        });
        engine.register(plugin, PluginPolicy::default()).await.unwrap();

        engine.invoke_hook(Hook::RequestStart, &JsonValue::Null).await;
        let stats = &engine.get_plugin_stats()[0];
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.last_error.as_deref(), Some("panic"));
    }

    struct SlowInit;

    #[async_trait]
    impl Plugin for SlowInit {
        fn id(&self) -> &str {
            "slow"
        }

        async fn init(&self) -> XyResult<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn on_hook(&self, _hook: Hook, _payload: &JsonValue) -> XyResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_init_timeout_fails_plugin() {
        let engine = PluginEngine::new();
        let err = engine
            .register(
                Arc::new(SlowInit),
                PluginPolicy {
                    allowed_hooks: None,
                    lifecycle_timeout: Some(Duration::from_millis(20)),
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(engine.state_of("slow"), Some(LifecycleState::Failed));

        // Failed plugins are excluded from hook dispatch.
        engine.invoke_hook(Hook::RequestStart, &JsonValue::Null).await;
        assert_eq!(engine.get_plugin_stats()[0].invocations, 0);
    }
}
