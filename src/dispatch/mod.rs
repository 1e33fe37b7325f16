//! Request dispatch pipeline.
//!
//! Orchestrates one request end-to-end: admission through the concurrency
//! controller, network pre-filters, body parsing, classification, the
//! ultra-fast cache path, the middleware chain, route lookup and
//! route-scoped middleware, the handler under its timeout, plugin post
//! hooks, and response finalization with compression. Every failure class
//! maps to an HTTP status here; unexpected errors become an opaque 500.

pub mod limits;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{header, Method, StatusCode};
use serde_json::Value as JsonValue;

use crate::cache::{serialize, SecureCache, SetOptions};
use crate::classify::{ultra_fast_key, RequestClassifier};
use crate::core::{Body, Classification, Request, Response, XyPrissError, XyResult};
use crate::core::http::{content_type, url_decode};
use crate::middleware::MiddlewareChain;
use crate::network::NetworkPlugins;
use crate::plugins::{Hook, PluginEngine};
use crate::router::{Handler, RouteTable};

use limits::ConcurrencyController;

/// Per-request timeout policy.
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    pub enabled: bool,
    pub default_timeout: Duration,
    /// Per-route overrides keyed by the registered pattern text.
    pub routes: HashMap<String, Duration>,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timeout: Duration::from_secs(30),
            routes: HashMap::new(),
        }
    }
}

/// Body acceptance limits.
#[derive(Debug, Clone)]
pub struct PayloadOptions {
    pub max_body_size: usize,
    pub max_url_length: usize,
    pub auto_parse_json: bool,
    pub json_limit: usize,
    pub url_encoded_limit: usize,
}

impl Default for PayloadOptions {
    fn default() -> Self {
        Self {
            max_body_size: 10 * 1024 * 1024,
            max_url_length: 8 * 1024,
            auto_parse_json: true,
            json_limit: 10 * 1024 * 1024,
            url_encoded_limit: 10 * 1024 * 1024,
        }
    }
}

/// Aggregate dispatch counters.
#[derive(Default)]
pub struct DispatchStats {
    pub requests: AtomicU64,
    pub ultra_fast_hits: AtomicU64,
    pub errors: AtomicU64,
}

pub struct Dispatcher {
    pub classifier: Arc<RequestClassifier>,
    pub chain: Arc<MiddlewareChain>,
    pub routes: Arc<RouteTable>,
    pub cache: Arc<SecureCache>,
    pub plugins: Arc<PluginEngine>,
    pub network: Arc<NetworkPlugins>,
    pub limits: Arc<ConcurrencyController>,
    timeouts: TimeoutOptions,
    payload: PayloadOptions,
    not_found: std::sync::RwLock<Option<Arc<dyn Handler>>>,
    /// TTL for responses warmed into the ultra-fast cache.
    ultra_ttl: Duration,
    pub stats: DispatchStats,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: Arc<RequestClassifier>,
        chain: Arc<MiddlewareChain>,
        routes: Arc<RouteTable>,
        cache: Arc<SecureCache>,
        plugins: Arc<PluginEngine>,
        network: Arc<NetworkPlugins>,
        limits: Arc<ConcurrencyController>,
        timeouts: TimeoutOptions,
        payload: PayloadOptions,
    ) -> Self {
        Self {
            classifier,
            chain,
            routes,
            cache,
            plugins,
            network,
            limits,
            timeouts,
            payload,
            not_found: std::sync::RwLock::new(None),
            ultra_ttl: Duration::from_secs(3600),
            stats: DispatchStats::default(),
        }
    }

    /// Overrides the 404 collaborator.
    pub fn set_not_found_handler(&self, handler: Arc<dyn Handler>) {
        *self.not_found.write().unwrap() = Some(handler);
    }

    /// Handles one request to completion.
    pub async fn dispatch(&self, mut req: Request) -> Response {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let mut res = Response::new();
        res.set_header("X-Request-Id", &req.id.clone());

        let permit = match self
            .limits
            .acquire(req.path(), non_empty(&req.client_ip()).as_deref())
            .await
        {
            Ok(permit) => permit,
            Err(e) => {
                self.finish_with_error(&req, &mut res, e).await;
                return res;
            }
        };

        if self.network.pre_filter(&req, &mut res).await {
            drop(permit);
            self.network.post_filter(&req, &mut res);
            return res;
        }

        if let Err(e) = self.run_pipeline(&mut req, &mut res).await {
            self.finish_with_error(&req, &mut res, e).await;
        }
        drop(permit);

        req.timing.mark("total");
        self.plugins
            .invoke_hook(
                Hook::RequestEnd,
                &serde_json::json!({
                    "request_id": req.id,
                    "path": req.path(),
                    "status": res.status.as_u16(),
                    "classification": req.classification.as_str(),
                    "elapsed_micros": req.timing.elapsed().as_micros() as u64,
                }),
            )
            .await;

        self.network.post_filter(&req, &mut res);
        res
    }

    async fn run_pipeline(&self, req: &mut Request, res: &mut Response) -> XyResult<()> {
        if req.uri.to_string().len() > self.payload.max_url_length {
            return Err(XyPrissError::Validation("url too long".to_string()));
        }

        self.plugins
            .invoke_hook(
                Hook::RequestStart,
                &serde_json::json!({
                    "request_id": req.id,
                    "method": req.method.as_str(),
                    "path": req.path(),
                }),
            )
            .await;

        self.parse_body(req)?;
        req.timing.mark("parse");

        req.classification =
            self.classifier
                .classify(req, self.chain.as_ref(), self.routes.as_ref());
        req.timing.mark("classify");

        if req.classification == Classification::UltraFast
            && self.try_ultra_fast(req, res).await
        {
            return Ok(());
        }

        let completed = self.chain.execute(req, res).await?;
        req.timing.mark("middleware");
        if !completed || res.sent() {
            return Ok(());
        }

        let Some(found) = self.routes.lookup(&req.method, req.path()) else {
            self.respond_not_found(req, res).await;
            return Ok(());
        };
        req.params = found.params;

        // Route-scoped middleware after the global chain.
        if !found.route.middleware.is_empty() {
            let completed = self
                .chain
                .execute_ids(&found.route.middleware, req, res)
                .await?;
            if !completed || res.sent() {
                return Ok(());
            }
        }

        let handler_started = std::time::Instant::now();
        let outcome = self.run_handler(found.route.as_ref(), req, res).await;
        req.timing.mark("handler");
        found
            .route
            .stats
            .record(handler_started.elapsed(), outcome.is_err());
        outcome?;

        if !res.sent() {
            // A handler that returned without sending gets its buffered
            // state flushed as-is.
            res.mark_sent();
        }

        self.warm_ultra_fast(req, res).await;
        Ok(())
    }

    async fn run_handler(
        &self,
        route: &crate::router::Route,
        req: &mut Request,
        res: &mut Response,
    ) -> XyResult<()> {
        let timeout = route
            .timeout
            .or_else(|| self.timeouts.routes.get(&route.pattern_text).copied())
            .unwrap_or(self.timeouts.default_timeout);

        if !self.timeouts.enabled {
            return route.handler.handle(req, res).await;
        }

        match tokio::time::timeout(timeout, route.handler.handle(req, res)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // A committed response is allowed to stand; otherwise the
                // cancelled handler surfaces as a 408.
                if res.sent() {
                    log::warn!("handler for {} timed out after commit", route.pattern_text);
                    Ok(())
                } else {
                    Err(XyPrissError::Timeout(format!(
                        "handler for {} exceeded {timeout:?}",
                        route.pattern_text
                    )))
                }
            }
        }
    }

    /// Serves from the ultra-fast cache; true on a hit.
    async fn try_ultra_fast(&self, req: &Request, res: &mut Response) -> bool {
        let key = ultra_fast_key(&req.method, req.path());
        match self.cache.get(&key).await {
            Some(value) => {
                self.stats.ultra_fast_hits.fetch_add(1, Ordering::Relaxed);
                res.set_header(header::CONTENT_TYPE.as_str(), content_type::APPLICATION_JSON);
                res.set_header("X-Cache", "HIT");
                let body = serialize::value_as_bytes(&value)
                    .unwrap_or_else(|| serde_json::to_vec(&value).unwrap_or_default());
                res.send_bytes(body);
                self.plugins
                    .invoke_hook(
                        Hook::CacheHit,
                        &serde_json::json!({"key": key, "request_id": req.id}),
                    )
                    .await;
                true
            }
            None => {
                self.plugins
                    .invoke_hook(
                        Hook::CacheMiss,
                        &serde_json::json!({"key": key, "request_id": req.id}),
                    )
                    .await;
                res.set_header("X-Cache", "MISS");
                false
            }
        }
    }

    /// Stores a successful ultra-fast-classified response for later hits.
    async fn warm_ultra_fast(&self, req: &Request, res: &Response) {
        if req.classification != Classification::UltraFast
            || res.status != StatusCode::OK
            || res.body().is_empty()
        {
            return;
        }
        let key = ultra_fast_key(&req.method, req.path());
        let value = match serde_json::from_slice::<JsonValue>(res.body()) {
            Ok(value) => value,
            Err(_) => serialize::bytes_value(res.body()),
        };
        if let Err(e) = self
            .cache
            .set(
                &key,
                &value,
                SetOptions {
                    ttl: Some(self.ultra_ttl),
                    ..Default::default()
                },
            )
            .await
        {
            log::warn!("failed to warm ultra-fast cache for {key}: {e}");
        }
    }

    /// Parses the body for POST/PUT/PATCH with a recognized content type.
    fn parse_body(&self, req: &mut Request) -> XyResult<()> {
        if !matches!(req.method, Method::POST | Method::PUT | Method::PATCH) {
            return Ok(());
        }
        let Body::Raw(raw) = req.body.clone() else {
            return Ok(());
        };
        if raw.len() > self.payload.max_body_size {
            return Err(XyPrissError::Validation(format!(
                "body of {} bytes exceeds the {} byte limit",
                raw.len(),
                self.payload.max_body_size
            )));
        }

        match req.content_type().as_deref() {
            Some(content_type::APPLICATION_JSON) if self.payload.auto_parse_json => {
                if raw.len() > self.payload.json_limit {
                    return Err(XyPrissError::Validation("JSON body too large".to_string()));
                }
                let value: JsonValue = serde_json::from_slice(&raw)
                    .map_err(|e| XyPrissError::Validation(format!("invalid JSON body: {e}")))?;
                req.body = Body::Json(value);
            }
            Some(content_type::FORM_URLENCODED) => {
                if raw.len() > self.payload.url_encoded_limit {
                    return Err(XyPrissError::Validation("form body too large".to_string()));
                }
                let text = std::str::from_utf8(&raw).map_err(|_| {
                    XyPrissError::Validation("form body is not valid UTF-8".to_string())
                })?;
                let mut form = HashMap::new();
                for pair in text.split('&').filter(|p| !p.is_empty()) {
                    let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                    form.insert(url_decode(k), url_decode(v));
                }
                req.body = Body::Form(form);
            }
            Some(ct) if ct.starts_with(content_type::MULTIPART_FORM_DATA) => {
                // Decoding is deferred to the file-upload middleware.
                req.body = Body::Multipart(raw);
            }
            _ => {}
        }
        Ok(())
    }

    async fn respond_not_found(&self, req: &mut Request, res: &mut Response) {
        let handler = self.not_found.read().unwrap().clone();
        if let Some(handler) = handler {
            if let Err(e) = handler.handle(req, res).await {
                log::warn!("custom not-found handler failed: {e}");
            }
            if res.sent() {
                return;
            }
        }
        res.send_error(StatusCode::NOT_FOUND, "not_found", "Not Found");
    }

    async fn finish_with_error(&self, req: &Request, res: &mut Response, error: XyPrissError) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        log::warn!("request {} failed: {error}", req.id);

        self.plugins
            .invoke_hook(
                Hook::RequestError,
                &serde_json::json!({
                    "request_id": req.id,
                    "path": req.path(),
                    "error": error.to_string(),
                    "code": error.code(),
                }),
            )
            .await;

        if res.sent() {
            return;
        }
        let status = error.status_code();
        if status.is_server_error() {
            // 5xx bodies stay opaque; details go to the logs.
            res.send_error(status, error.code(), "internal error");
        } else {
            res.send_error(status, error.code(), &error.to_string());
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
