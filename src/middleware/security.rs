//! Security middleware driven by the `security` configuration group.
//!
//! Each item is an ordinary chain entry with its own toggle: CORS headers
//! with preflight handling, helmet-style response headers, the legacy XSS
//! protection header, JWT bearer authentication, and a brute-force lockout
//! backed by secure-cache counters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{Method, StatusCode};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value as JsonValue;

use crate::cache::{SecureCache, SetOptions};
use crate::core::{Request, Response, XyResult};

use super::{Flow, Middleware};

/// CORS policy.
#[derive(Debug, Clone)]
pub struct CorsOptions {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
    pub allow_credentials: bool,
    pub max_age_secs: u32,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, PATCH, DELETE, OPTIONS".to_string(),
            allow_headers: "Content-Type, Authorization".to_string(),
            allow_credentials: false,
            max_age_secs: 86_400,
        }
    }
}

pub struct CorsMiddleware {
    options: CorsOptions,
}

impl CorsMiddleware {
    pub fn new(options: CorsOptions) -> Self {
        Self { options }
    }

    fn apply_headers(&self, res: &mut Response) {
        res.set_header("Access-Control-Allow-Origin", &self.options.allow_origin);
        if self.options.allow_credentials {
            res.set_header("Access-Control-Allow-Credentials", "true");
        }
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    async fn handle(&self, req: &mut Request, res: &mut Response) -> XyResult<Flow> {
        self.apply_headers(res);
        if req.method == Method::OPTIONS {
            // Preflight terminates here.
            res.set_header("Access-Control-Allow-Methods", &self.options.allow_methods);
            res.set_header("Access-Control-Allow-Headers", &self.options.allow_headers);
            res.set_header("Access-Control-Max-Age", &self.options.max_age_secs.to_string());
            res.set_status(StatusCode::NO_CONTENT);
            res.send_bytes(Vec::new());
            return Ok(Flow::Break);
        }
        Ok(Flow::Continue)
    }
}

/// Helmet-style hardening headers.
pub struct SecurityHeadersMiddleware;

#[async_trait]
impl Middleware for SecurityHeadersMiddleware {
    async fn handle(&self, _req: &mut Request, res: &mut Response) -> XyResult<Flow> {
        res.set_header("X-Content-Type-Options", "nosniff");
        res.set_header("X-Frame-Options", "DENY");
        res.set_header("Referrer-Policy", "no-referrer");
        res.set_header(
            "Strict-Transport-Security",
            "max-age=15552000; includeSubDomains",
        );
        Ok(Flow::Continue)
    }
}

/// Legacy XSS filter header, kept behind its own toggle.
pub struct XssProtectionMiddleware;

#[async_trait]
impl Middleware for XssProtectionMiddleware {
    async fn handle(&self, _req: &mut Request, res: &mut Response) -> XyResult<Flow> {
        res.set_header("X-XSS-Protection", "1; mode=block");
        Ok(Flow::Continue)
    }
}

/// JWT bearer authentication.
#[derive(Debug, Clone)]
pub struct JwtOptions {
    pub secret: String,
    /// Claims are written to `res.locals["jwt_claims"]` on success.
    pub expose_claims: bool,
}

pub struct JwtAuthMiddleware {
    decoding_key: DecodingKey,
    validation: Validation,
    expose_claims: bool,
}

impl JwtAuthMiddleware {
    pub fn new(options: JwtOptions) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(options.secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            expose_claims: options.expose_claims,
        }
    }

    fn bearer_token<'a>(req: &'a Request) -> Option<&'a str> {
        req.header("authorization")?.strip_prefix("Bearer ")
    }
}

#[async_trait]
impl Middleware for JwtAuthMiddleware {
    async fn handle(&self, req: &mut Request, res: &mut Response) -> XyResult<Flow> {
        let Some(token) = Self::bearer_token(req) else {
            res.send_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing bearer token",
            );
            return Ok(Flow::Break);
        };

        match decode::<JsonValue>(token, &self.decoding_key, &self.validation) {
            Ok(data) => {
                if self.expose_claims {
                    res.locals.insert("jwt_claims".to_string(), data.claims);
                }
                Ok(Flow::Continue)
            }
            Err(e) => {
                log::debug!("jwt rejected: {e}");
                res.send_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token");
                Ok(Flow::Break)
            }
        }
    }
}

/// Brute-force lockout policy.
#[derive(Debug, Clone)]
pub struct BruteForceOptions {
    pub max_attempts: u64,
    pub window: Duration,
}

impl Default for BruteForceOptions {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window: Duration::from_secs(15 * 60),
        }
    }
}

/// Blocks clients whose recorded failure count exceeds the policy. Failure
/// recording is pushed by the authentication layer via
/// [`BruteForceMiddleware::record_failure`].
pub struct BruteForceMiddleware {
    cache: Arc<SecureCache>,
    options: BruteForceOptions,
}

impl BruteForceMiddleware {
    pub fn new(cache: Arc<SecureCache>, options: BruteForceOptions) -> Self {
        Self { cache, options }
    }

    fn key(ip: &str) -> String {
        format!("bruteforce:{ip}")
    }

    async fn failures(&self, ip: &str) -> u64 {
        self.cache
            .get(&Self::key(ip))
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Bumps the failure counter for a client; the counter expires with the
    /// configured window.
    pub async fn record_failure(&self, ip: &str) -> XyResult<u64> {
        let count = self.failures(ip).await + 1;
        self.cache
            .set(
                &Self::key(ip),
                &JsonValue::from(count),
                SetOptions {
                    ttl: Some(self.options.window),
                    ..Default::default()
                },
            )
            .await?;
        Ok(count)
    }

    /// Clears the counter, typically after a successful login.
    pub async fn reset(&self, ip: &str) -> XyResult<()> {
        self.cache.delete(&Self::key(ip)).await?;
        Ok(())
    }
}

#[async_trait]
impl Middleware for BruteForceMiddleware {
    async fn handle(&self, req: &mut Request, res: &mut Response) -> XyResult<Flow> {
        let ip = req.client_ip();
        if ip.is_empty() {
            return Ok(Flow::Continue);
        }
        if self.failures(&ip).await >= self.options.max_attempts {
            res.set_header(
                "Retry-After",
                &self.options.window.as_secs().to_string(),
            );
            res.send_error(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "too many failed attempts",
            );
            return Ok(Flow::Break);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::crypto::StubCryptoProvider;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn cache() -> Arc<SecureCache> {
        let opts = CacheOptions {
            master_key: Some("test".to_string()),
            ..Default::default()
        };
        Arc::new(SecureCache::new(opts, Arc::new(StubCryptoProvider)).unwrap())
    }

    #[tokio::test]
    async fn test_cors_preflight_short_circuits() {
        let mw = CorsMiddleware::new(CorsOptions::default());
        let mut req = Request::from_parts(Method::OPTIONS, "/api");
        let mut res = Response::new();
        assert_eq!(mw.handle(&mut req, &mut res).await.unwrap(), Flow::Break);
        assert_eq!(res.status, StatusCode::NO_CONTENT);
        assert_eq!(
            res.headers.get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_cors_regular_request_continues() {
        let mw = CorsMiddleware::new(CorsOptions::default());
        let mut req = Request::from_parts(Method::GET, "/api");
        let mut res = Response::new();
        assert_eq!(mw.handle(&mut req, &mut res).await.unwrap(), Flow::Continue);
        assert!(res.headers.contains_key("access-control-allow-origin"));
        assert!(!res.sent());
    }

    #[tokio::test]
    async fn test_security_headers() {
        let mw = SecurityHeadersMiddleware;
        let mut res = Response::new();
        mw.handle(&mut Request::from_parts(Method::GET, "/"), &mut res)
            .await
            .unwrap();
        assert_eq!(res.headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(res.headers.get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn test_jwt_accepts_valid_token() {
        let secret = "jwt-test-secret";
        let mw = JwtAuthMiddleware::new(JwtOptions {
            secret: secret.to_string(),
            expose_claims: true,
        });

        let exp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600;
        let claims = serde_json::json!({"sub": "user-1", "exp": exp});
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let mut req = Request::from_parts(Method::GET, "/private");
        req.headers.insert(
            "authorization",
            format!("Bearer {token}").parse().unwrap(),
        );
        let mut res = Response::new();
        assert_eq!(mw.handle(&mut req, &mut res).await.unwrap(), Flow::Continue);
        assert_eq!(res.locals["jwt_claims"]["sub"], "user-1");
    }

    #[tokio::test]
    async fn test_jwt_rejects_missing_and_bad_tokens() {
        let mw = JwtAuthMiddleware::new(JwtOptions {
            secret: "secret".to_string(),
            expose_claims: false,
        });

        let mut req = Request::from_parts(Method::GET, "/private");
        let mut res = Response::new();
        assert_eq!(mw.handle(&mut req, &mut res).await.unwrap(), Flow::Break);
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);

        let mut req = Request::from_parts(Method::GET, "/private");
        req.headers
            .insert("authorization", "Bearer not.a.jwt".parse().unwrap());
        let mut res = Response::new();
        assert_eq!(mw.handle(&mut req, &mut res).await.unwrap(), Flow::Break);
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_brute_force_lockout() {
        let mw = BruteForceMiddleware::new(
            cache(),
            BruteForceOptions {
                max_attempts: 3,
                window: Duration::from_secs(60),
            },
        );

        let mut req = Request::from_parts(Method::POST, "/login");
        req.remote_addr = Some("10.1.1.1:9999".parse().unwrap());

        for _ in 0..3 {
            let mut res = Response::new();
            assert_eq!(mw.handle(&mut req, &mut res).await.unwrap(), Flow::Continue);
            mw.record_failure("10.1.1.1").await.unwrap();
        }

        let mut res = Response::new();
        assert_eq!(mw.handle(&mut req, &mut res).await.unwrap(), Flow::Break);
        assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);

        mw.reset("10.1.1.1").await.unwrap();
        let mut res = Response::new();
        assert_eq!(mw.handle(&mut req, &mut res).await.unwrap(), Flow::Continue);
    }
}
