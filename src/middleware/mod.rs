//! Priority-ordered middleware chain.
//!
//! Middleware run in priority buckets (critical first), insertion order
//! within a bucket. A middleware advances the chain by returning
//! [`Flow::Continue`] (the `next()` call of the source model), ends it with
//! [`Flow::Break`] or by sending the response, and enters the error path by
//! returning `Err` (the `next(err)` form): remaining normal middleware are
//! skipped and the first registered error handler runs. Disabled entries are
//! skipped without invoking the handler.

pub mod security;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Serialize;

use crate::cache::stats::LatencyWindow;
use crate::core::{Request, Response, XyPrissError, XyResult};

/// Continuation decision returned by middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Advance to the next middleware (and ultimately the route handler).
    Continue,
    /// Stop the chain; the route handler must not run.
    Break,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: &mut Request, res: &mut Response) -> XyResult<Flow>;
}

/// Adapter turning a plain function into a [`Middleware`].
pub struct MiddlewareFn<F>(pub F);

#[async_trait]
impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(&mut Request, &mut Response) -> XyResult<Flow> + Send + Sync,
{
    async fn handle(&self, req: &mut Request, res: &mut Response) -> XyResult<Flow> {
        (self.0)(req, res)
    }
}

/// The 4-argument variant: receives the error that activated the error path
/// and may override the response.
#[async_trait]
pub trait ErrorMiddleware: Send + Sync {
    async fn handle(
        &self,
        error: &XyPrissError,
        req: &mut Request,
        res: &mut Response,
    ) -> XyResult<Flow>;
}

/// Execution priority buckets, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Lowest,
}

enum Kind {
    Normal(Arc<dyn Middleware>),
    Error(Arc<dyn ErrorMiddleware>),
}

/// Per-middleware counters.
pub struct MiddlewareStats {
    pub invocations: AtomicU64,
    pub cumulative_micros: AtomicU64,
    latencies: LatencyWindow,
}

impl Default for MiddlewareStats {
    fn default() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            cumulative_micros: AtomicU64::new(0),
            latencies: LatencyWindow::new(512),
        }
    }
}

impl MiddlewareStats {
    fn record(&self, latency: Duration) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.cumulative_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latencies.record(latency);
    }

    pub fn p95_micros(&self) -> Option<u64> {
        self.latencies.percentile(95.0)
    }
}

pub struct MiddlewareEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    pub priority: Priority,
    /// Prefix scope; segment-aligned.
    pub path_scope: Option<String>,
    /// Declared side-effect-free and cheap; feeds the fast-path classifier.
    pub fast_safe: bool,
    /// Runs in every chain execution, not only when referenced by a route.
    pub global: bool,
    enabled: AtomicBool,
    kind: Kind,
    pub stats: MiddlewareStats,
    seq: u64,
}

impl MiddlewareEntry {
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_error_handler(&self) -> bool {
        matches!(self.kind, Kind::Error(_))
    }

    fn applies_to(&self, path: &str) -> bool {
        match &self.path_scope {
            None => true,
            Some(scope) => scope_matches(scope, path),
        }
    }
}

/// Prefix match aligned on `/` boundaries: scope `/api` covers `/api` and
/// `/api/users` but not `/apifoo`.
pub fn scope_matches(scope: &str, path: &str) -> bool {
    let scope = scope.trim_end_matches('/');
    if scope.is_empty() {
        return true;
    }
    match path.strip_prefix(scope) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Registration options; every field is optional.
pub struct RegisterOptions {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Priority,
    pub path_scope: Option<String>,
    pub fast_safe: bool,
    /// Global entries run on every request; non-global entries run only
    /// when a route references them by id.
    pub global: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            description: None,
            priority: Priority::default(),
            path_scope: None,
            fast_safe: false,
            global: true,
        }
    }
}

/// Listing row returned by [`MiddlewareChain::list`].
#[derive(Debug, Clone, Serialize)]
pub struct MiddlewareInfo {
    pub id: String,
    pub name: String,
    pub priority: Priority,
    pub enabled: bool,
    pub error_handler: bool,
    pub invocations: u64,
    pub cumulative_micros: u64,
    pub p95_micros: Option<u64>,
}

#[derive(Default)]
pub struct MiddlewareChain {
    entries: ArcSwap<Vec<Arc<MiddlewareEntry>>>,
    write_lock: std::sync::Mutex<()>,
    next_seq: AtomicU64,
    /// Soft per-middleware deadline; exceeding it logs a warning, nothing is
    /// cancelled at this layer.
    soft_deadline: ArcSwap<Option<Duration>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_soft_deadline(&self, deadline: Option<Duration>) {
        self.soft_deadline.store(Arc::new(deadline));
    }

    /// Registers a middleware and returns its id.
    pub fn register(
        &self,
        handler: Arc<dyn Middleware>,
        opts: RegisterOptions,
    ) -> XyResult<String> {
        self.insert(Kind::Normal(handler), opts)
    }

    /// Registers a 4-argument error handler.
    pub fn register_error_handler(
        &self,
        handler: Arc<dyn ErrorMiddleware>,
        opts: RegisterOptions,
    ) -> XyResult<String> {
        self.insert(Kind::Error(handler), opts)
    }

    fn insert(&self, kind: Kind, opts: RegisterOptions) -> XyResult<String> {
        let _guard = self.write_lock.lock().unwrap();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = opts.id.unwrap_or_else(|| format!("mw-{seq}"));

        let entries = self.entries.load();
        if entries.iter().any(|e| e.id == id) {
            return Err(XyPrissError::Config(format!(
                "duplicate middleware id: {id}"
            )));
        }

        let entry = Arc::new(MiddlewareEntry {
            name: opts.name.unwrap_or_else(|| id.clone()),
            description: opts.description.unwrap_or_default(),
            priority: opts.priority,
            path_scope: opts.path_scope,
            fast_safe: opts.fast_safe,
            global: opts.global,
            enabled: AtomicBool::new(true),
            kind,
            stats: MiddlewareStats::default(),
            seq,
            id: id.clone(),
        });

        let mut updated = (**entries).clone();
        updated.push(entry);
        // Priority bucket first, insertion order within it.
        updated.sort_by_key(|e| (e.priority, e.seq));
        self.entries.store(Arc::new(updated));
        Ok(id)
    }

    pub fn unregister(&self, id: &str) -> bool {
        let _guard = self.write_lock.lock().unwrap();
        let entries = self.entries.load();
        let mut updated = (**entries).clone();
        let before = updated.len();
        updated.retain(|e| e.id != id);
        let removed = updated.len() != before;
        if removed {
            self.entries.store(Arc::new(updated));
        }
        removed
    }

    pub fn enable(&self, id: &str) -> bool {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> bool {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.get(id) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<MiddlewareEntry>> {
        self.entries.load().iter().find(|e| e.id == id).cloned()
    }

    /// Entries in execution order.
    pub fn list(&self) -> Vec<MiddlewareInfo> {
        self.entries
            .load()
            .iter()
            .map(|e| MiddlewareInfo {
                id: e.id.clone(),
                name: e.name.clone(),
                priority: e.priority,
                enabled: e.enabled(),
                error_handler: e.is_error_handler(),
                invocations: e.stats.invocations.load(Ordering::Relaxed),
                cumulative_micros: e.stats.cumulative_micros.load(Ordering::Relaxed),
                p95_micros: e.stats.p95_micros(),
            })
            .collect()
    }

    /// True when every enabled entry that applies to `path` is declared
    /// fast-safe (or the chain is empty). Used by the classifier.
    pub fn is_fast_safe(&self, path: &str) -> bool {
        self.entries
            .load()
            .iter()
            .filter(|e| e.global && e.enabled() && !e.is_error_handler() && e.applies_to(path))
            .all(|e| e.fast_safe)
    }

    /// Runs the chain. Returns `Ok(true)` when every middleware advanced,
    /// `Ok(false)` when a middleware short-circuited (response sent, break,
    /// or a handled error); the route handler must then be skipped.
    pub async fn execute(&self, req: &mut Request, res: &mut Response) -> XyResult<bool> {
        let entries = self.entries.load_full();
        self.run_entries(entries.iter().filter(|e| e.global), req, res)
            .await
    }

    /// Runs a route-scoped subset by id, in the chain's execution order.
    pub async fn execute_ids(
        &self,
        ids: &[String],
        req: &mut Request,
        res: &mut Response,
    ) -> XyResult<bool> {
        let entries = self.entries.load_full();
        let subset: Vec<&Arc<MiddlewareEntry>> =
            entries.iter().filter(|e| ids.contains(&e.id)).collect();
        self.run_entries(subset.into_iter(), req, res).await
    }

    async fn run_entries<'a, I>(
        &self,
        entries: I,
        req: &mut Request,
        res: &mut Response,
    ) -> XyResult<bool>
    where
        I: Iterator<Item = &'a Arc<MiddlewareEntry>>,
    {
        let soft_deadline = **self.soft_deadline.load();
        let ordered: Vec<&Arc<MiddlewareEntry>> = entries.collect();

        for entry in ordered.iter() {
            if !entry.enabled() || !entry.applies_to(req.path()) {
                continue;
            }
            let Kind::Normal(handler) = &entry.kind else {
                continue;
            };

            let started = Instant::now();
            let outcome = handler.handle(req, res).await;
            let latency = started.elapsed();
            entry.stats.record(latency);

            if let Some(deadline) = soft_deadline {
                if latency > deadline {
                    log::warn!(
                        "middleware {} exceeded soft deadline ({:?} > {:?})",
                        entry.id,
                        latency,
                        deadline
                    );
                }
            }

            match outcome {
                Ok(Flow::Continue) => {
                    if res.sent() {
                        return Ok(false);
                    }
                }
                Ok(Flow::Break) => return Ok(false),
                Err(error) => {
                    // Error path: the first enabled error handler in chain
                    // order takes over; remaining normal middleware are
                    // skipped.
                    for candidate in ordered.iter() {
                        if !candidate.enabled() || !candidate.applies_to(req.path()) {
                            continue;
                        }
                        if let Kind::Error(error_handler) = &candidate.kind {
                            let started = Instant::now();
                            let result = error_handler.handle(&error, req, res).await;
                            candidate.stats.record(started.elapsed());
                            return result.map(|_| false);
                        }
                    }
                    return Err(error);
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use std::sync::Mutex;

    fn request() -> Request {
        Request::from_parts(Method::GET, "/x")
    }

    fn recording(order: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Arc<dyn Middleware> {
        Arc::new(MiddlewareFn(move |_req: &mut Request, _res: &mut Response| {
            order.lock().unwrap().push(tag);
            Ok(Flow::Continue)
        }))
    }

    #[tokio::test]
    async fn test_priority_then_insertion_order() {
        let chain = MiddlewareChain::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        chain
            .register(
                recording(order.clone(), "normal-1"),
                RegisterOptions::default(),
            )
            .unwrap();
        chain
            .register(
                recording(order.clone(), "critical"),
                RegisterOptions {
                    priority: Priority::Critical,
                    ..Default::default()
                },
            )
            .unwrap();
        chain
            .register(
                recording(order.clone(), "normal-2"),
                RegisterOptions::default(),
            )
            .unwrap();
        chain
            .register(
                recording(order.clone(), "lowest"),
                RegisterOptions {
                    priority: Priority::Lowest,
                    ..Default::default()
                },
            )
            .unwrap();

        let completed = chain.execute(&mut request(), &mut Response::new()).await.unwrap();
        assert!(completed);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "normal-1", "normal-2", "lowest"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_on_sent_response() {
        let chain = MiddlewareChain::new();
        let reached = Arc::new(Mutex::new(false));

        chain
            .register(
                Arc::new(MiddlewareFn(|_req: &mut Request, res: &mut Response| {
                    res.set_status(StatusCode::UNAUTHORIZED);
                    res.send_text("unauth");
                    Ok(Flow::Continue)
                })),
                RegisterOptions {
                    priority: Priority::High,
                    ..Default::default()
                },
            )
            .unwrap();
        let reached_clone = reached.clone();
        chain
            .register(
                Arc::new(MiddlewareFn(move |_req: &mut Request, _res: &mut Response| {
                    *reached_clone.lock().unwrap() = true;
                    Ok(Flow::Continue)
                })),
                RegisterOptions::default(),
            )
            .unwrap();

        let mut res = Response::new();
        let completed = chain.execute(&mut request(), &mut res).await.unwrap();
        assert!(!completed);
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
        assert_eq!(res.body(), b"unauth");
        assert!(!*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn test_disabled_entries_skipped() {
        let chain = MiddlewareChain::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let id = chain
            .register(recording(order.clone(), "a"), RegisterOptions::default())
            .unwrap();
        chain
            .register(recording(order.clone(), "b"), RegisterOptions::default())
            .unwrap();

        assert!(chain.disable(&id));
        chain.execute(&mut request(), &mut Response::new()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["b"]);

        // Disabled entries record zero invocations.
        let info = chain.list();
        assert_eq!(info.iter().find(|i| i.id == id).unwrap().invocations, 0);

        assert!(chain.enable(&id));
        chain.execute(&mut request(), &mut Response::new()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_path_scope_segment_aligned() {
        assert!(scope_matches("/api", "/api"));
        assert!(scope_matches("/api", "/api/users"));
        assert!(!scope_matches("/api", "/apifoo"));
        assert!(scope_matches("/", "/anything"));

        let chain = MiddlewareChain::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        chain
            .register(
                recording(order.clone(), "api-only"),
                RegisterOptions {
                    path_scope: Some("/api".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut req = Request::from_parts(Method::GET, "/other");
        chain.execute(&mut req, &mut Response::new()).await.unwrap();
        assert!(order.lock().unwrap().is_empty());

        let mut req = Request::from_parts(Method::GET, "/api/users");
        chain.execute(&mut req, &mut Response::new()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["api-only"]);
    }

    #[tokio::test]
    async fn test_error_path_invokes_error_handler() {
        let chain = MiddlewareChain::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        chain
            .register(
                Arc::new(MiddlewareFn(|_req: &mut Request, _res: &mut Response| {
                    Err(XyPrissError::Validation("broken body".to_string()))
                })),
                RegisterOptions {
                    priority: Priority::High,
                    ..Default::default()
                },
            )
            .unwrap();
        chain
            .register(recording(order.clone(), "skipped"), RegisterOptions::default())
            .unwrap();

        struct CatchAll;
        #[async_trait]
        impl ErrorMiddleware for CatchAll {
            async fn handle(
                &self,
                error: &XyPrissError,
                _req: &mut Request,
                res: &mut Response,
            ) -> XyResult<Flow> {
                res.send_error(error.status_code(), error.code(), &error.to_string());
                Ok(Flow::Break)
            }
        }
        chain
            .register_error_handler(Arc::new(CatchAll), RegisterOptions::default())
            .unwrap();

        let mut res = Response::new();
        let completed = chain.execute(&mut request(), &mut res).await.unwrap();
        assert!(!completed);
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        // Subsequent non-error middleware was skipped.
        assert!(order.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_without_handler_propagates() {
        let chain = MiddlewareChain::new();
        chain
            .register(
                Arc::new(MiddlewareFn(|_req: &mut Request, _res: &mut Response| {
                    Err(XyPrissError::Internal("boom".to_string()))
                })),
                RegisterOptions::default(),
            )
            .unwrap();

        let err = chain
            .execute(&mut request(), &mut Response::new())
            .await
            .unwrap_err();
        assert!(matches!(err, XyPrissError::Internal(_)));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_and_unregister() {
        let chain = MiddlewareChain::new();
        let opts = || RegisterOptions {
            id: Some("fixed".to_string()),
            ..Default::default()
        };
        chain
            .register(
                Arc::new(MiddlewareFn(|_: &mut Request, _: &mut Response| Ok(Flow::Continue))),
                opts(),
            )
            .unwrap();
        assert!(chain
            .register(
                Arc::new(MiddlewareFn(|_: &mut Request, _: &mut Response| Ok(Flow::Continue))),
                opts(),
            )
            .is_err());

        assert!(chain.unregister("fixed"));
        assert!(!chain.unregister("fixed"));
    }

    #[tokio::test]
    async fn test_fast_safe_classification_input() {
        let chain = MiddlewareChain::new();
        assert!(chain.is_fast_safe("/any"));

        chain
            .register(
                Arc::new(MiddlewareFn(|_: &mut Request, _: &mut Response| Ok(Flow::Continue))),
                RegisterOptions {
                    id: Some("fast".to_string()),
                    fast_safe: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(chain.is_fast_safe("/any"));

        chain
            .register(
                Arc::new(MiddlewareFn(|_: &mut Request, _: &mut Response| Ok(Flow::Continue))),
                RegisterOptions {
                    id: Some("slow".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!chain.is_fast_safe("/any"));

        // Disabling the slow middleware restores fast-safety.
        chain.disable("slow");
        assert!(chain.is_fast_safe("/any"));
    }

    #[tokio::test]
    async fn test_stats_recorded() {
        let chain = MiddlewareChain::new();
        let id = chain
            .register(
                Arc::new(MiddlewareFn(|_: &mut Request, _: &mut Response| Ok(Flow::Continue))),
                RegisterOptions::default(),
            )
            .unwrap();

        for _ in 0..3 {
            chain.execute(&mut request(), &mut Response::new()).await.unwrap();
        }
        let entry = chain.get(&id).unwrap();
        assert_eq!(entry.stats.invocations.load(Ordering::Relaxed), 3);
        assert!(entry.stats.p95_micros().is_some());
    }
}
