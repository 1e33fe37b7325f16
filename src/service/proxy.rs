//! Reverse-proxy service.
//!
//! When the proxy network plugin is enabled the server runs as a forwarding
//! gateway: the upstream pool picks a peer per request, the rate limiter
//! pre-filters, forwarding headers are attached, and every exchange outcome
//! feeds the pool's gauges, health view and circuit breaker.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, StatusCode, Uri};
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::core::Request;
use crate::network::proxy::UpstreamPool;
use crate::network::rate_limit::{RateDecision, RateLimitPlugin};

/// Forwarding headers consulted for the client address, most specific
/// first. The first non-empty entry wins; a comma-separated list keeps
/// only its leading hop.
const CLIENT_IP_HEADERS: [&str; 2] = ["x-forwarded-for", "x-real-ip"];

/// Apparent client address of a proxied session, falling back to the
/// socket peer when no forwarding header is usable.
fn client_ip(session: &Session) -> String {
    let headers = &session.req_header().headers;
    for name in CLIENT_IP_HEADERS {
        let candidate = headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .unwrap_or_default();
        if !candidate.is_empty() {
            return candidate.to_string();
        }
    }
    session
        .client_addr()
        .and_then(|addr| addr.as_inet())
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

pub struct ProxyService {
    pool: Arc<UpstreamPool>,
    rate_limit: Option<Arc<RateLimitPlugin>>,
}

impl ProxyService {
    pub fn new(pool: Arc<UpstreamPool>, rate_limit: Option<Arc<RateLimitPlugin>>) -> Self {
        Self { pool, rate_limit }
    }

    /// Minimal internal request view for the rate limiter key scopes.
    fn limiter_request(session: &Session) -> Request {
        let head = session.req_header();
        let method = head.method.clone();
        let uri: Uri = head.uri.clone();
        let mut request = Request::new(method, uri, head.headers.clone());
        request.remote_addr = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .copied();
        request
    }

    /// Writes the 429 rejection with the standard error-body shape and the
    /// limiter's quota headers, ending the exchange.
    async fn reject_rate_limited(
        session: &mut Session,
        decision: &RateDecision,
    ) -> Result<()> {
        let body = Bytes::from_static(
            br#"{"error":"rate limit exceeded","code":"rate_limited"}"#,
        );
        let reset = decision.reset_secs.to_string();

        let mut resp = ResponseHeader::build(StatusCode::TOO_MANY_REQUESTS, None)?;
        resp.insert_header(header::CONTENT_TYPE, "application/json")?;
        resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
        resp.insert_header("Retry-After", reset.clone())?;
        resp.insert_header("X-RateLimit-Limit", decision.limit.to_string())?;
        resp.insert_header("X-RateLimit-Remaining", "0")?;
        resp.insert_header("X-RateLimit-Reset", reset)?;

        session.set_keepalive(None);
        session.write_response_header(Box::new(resp), false).await?;
        session.write_response_body(Some(body), true).await
    }
}

#[derive(Default)]
pub struct ProxyCtx {
    selected: Option<String>,
    started: Option<Instant>,
    tries: usize,
}

#[async_trait]
impl ProxyHttp for ProxyService {
    type CTX = ProxyCtx;

    fn new_ctx(&self) -> Self::CTX {
        ProxyCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool> {
        let Some(rate_limit) = &self.rate_limit else {
            return Ok(false);
        };

        let request = Self::limiter_request(session);
        let decision = rate_limit.check(&request).await;
        if decision.allowed {
            return Ok(false);
        }

        Self::reject_rate_limited(session, &decision).await?;
        Ok(true)
    }

    async fn upstream_peer(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let mut backend = self
            .pool
            .select(&client_ip(session))
            .ok_or_else(|| Error::new_str("No healthy upstream available"))?;

        let addr = backend.addr.to_string();
        let peer = self
            .pool
            .peer_of(&mut backend)
            .ok_or_else(|| Error::new_str("Fatal: Missing selected backend metadata"))?;

        self.pool.connection_opened(&addr);
        ctx.selected = Some(addr);
        ctx.started = Some(Instant::now());
        Ok(peer)
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        let ip = client_ip(session);
        if !ip.is_empty() {
            upstream_request.insert_header("x-forwarded-for", ip)?;
        }
        upstream_request.insert_header("x-forwarded-proto", "http")?;
        Ok(())
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        if let Some(addr) = ctx.selected.take() {
            self.pool.report(&addr, None, false);
            self.pool.connection_closed(&addr);
        }
        // One retry against a different upstream.
        if ctx.tries == 0 {
            ctx.tries += 1;
            e.set_retry(true);
        }
        e
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let Some(addr) = ctx.selected.take() else {
            return;
        };
        let latency = ctx.started.map(|s| s.elapsed());
        self.pool.report(&addr, latency, e.is_none());
        self.pool.connection_closed(&addr);

        log::debug!(
            "proxied {} {} via {} ({})",
            session.req_header().method,
            session.req_header().uri,
            addr,
            if e.is_some() { "error" } else { "ok" }
        );
    }
}
