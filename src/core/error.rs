//! Unified error handling for XyPriss
//!
//! This module provides a centralized error type system so that individual
//! subsystems do not need to depend on each other for error handling. Each
//! variant corresponds to one failure class of the runtime and knows which
//! HTTP status it maps to at the dispatch boundary.

use std::fmt;

use http::StatusCode;

/// Unified error types for the application server runtime.
#[derive(Debug)]
pub enum XyPrissError {
    /// Invalid or missing configuration at startup; fatal.
    Config(String),

    /// Network bind failure.
    Bind(String),

    /// Auto-port switch ran out of candidates; carries the attempted ports.
    PortExhaustion(Vec<u16>),

    /// No route matched the request (404 class).
    RouteMatch(String),

    /// Body parse, oversized payload, rejected input (4xx class).
    Validation(String),

    /// AEAD / KDF failure.
    Crypto(String),

    /// AEAD tag mismatch on decrypt.
    Auth(String),

    /// Value could not be serialized or deserialized for the cache.
    CacheSerialization(String),

    /// Distributed cache tier failure.
    CacheBackend(String),

    /// Plugin execution failure, contained by the engine.
    Plugin(String),

    /// A supervised worker process crashed.
    WorkerCrash(String),

    /// Per-request deadline expired before the response was committed.
    Timeout(String),

    /// Rate limit exceeded (429 class).
    RateLimited(String),

    /// Authentication / authorization rejection (401 class).
    Unauthorized(String),

    /// Network and I/O errors.
    Network(std::io::Error),

    /// Internal invariant violations and unexpected failures.
    Internal(String),

    /// Errors surfaced by the pingora serving edge.
    Pingora(pingora_error::Error),
}

impl XyPrissError {
    /// Maps the error class to the HTTP status code surfaced by the
    /// Dispatcher. Unexpected classes map to 500 with an opaque body.
    pub fn status_code(&self) -> StatusCode {
        match self {
            XyPrissError::RouteMatch(_) => StatusCode::NOT_FOUND,
            XyPrissError::Validation(_) => StatusCode::BAD_REQUEST,
            XyPrissError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            XyPrissError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            XyPrissError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code used in 4xx JSON bodies.
    pub fn code(&self) -> &'static str {
        match self {
            XyPrissError::Config(_) => "config_error",
            XyPrissError::Bind(_) => "bind_error",
            XyPrissError::PortExhaustion(_) => "port_exhaustion",
            XyPrissError::RouteMatch(_) => "not_found",
            XyPrissError::Validation(_) => "validation_error",
            XyPrissError::Crypto(_) => "crypto_error",
            XyPrissError::Auth(_) => "auth_error",
            XyPrissError::CacheSerialization(_) => "cache_serialization_error",
            XyPrissError::CacheBackend(_) => "cache_backend_error",
            XyPrissError::Plugin(_) => "plugin_error",
            XyPrissError::WorkerCrash(_) => "worker_crash",
            XyPrissError::Timeout(_) => "timeout",
            XyPrissError::RateLimited(_) => "rate_limited",
            XyPrissError::Unauthorized(_) => "unauthorized",
            XyPrissError::Network(_) => "network_error",
            XyPrissError::Internal(_) => "internal_error",
            XyPrissError::Pingora(_) => "internal_error",
        }
    }
}

impl fmt::Display for XyPrissError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XyPrissError::Config(msg) => write!(f, "Configuration error: {msg}"),
            XyPrissError::Bind(msg) => write!(f, "Bind error: {msg}"),
            XyPrissError::PortExhaustion(ports) => {
                write!(f, "No available port after trying {ports:?}")
            }
            XyPrissError::RouteMatch(msg) => write!(f, "No matching route: {msg}"),
            XyPrissError::Validation(msg) => write!(f, "Validation error: {msg}"),
            XyPrissError::Crypto(msg) => write!(f, "Crypto error: {msg}"),
            XyPrissError::Auth(msg) => write!(f, "Authentication failure: {msg}"),
            XyPrissError::CacheSerialization(msg) => {
                write!(f, "Cache serialization error: {msg}")
            }
            XyPrissError::CacheBackend(msg) => write!(f, "Cache backend error: {msg}"),
            XyPrissError::Plugin(msg) => write!(f, "Plugin execution error: {msg}"),
            XyPrissError::WorkerCrash(msg) => write!(f, "Worker crashed: {msg}"),
            XyPrissError::Timeout(msg) => write!(f, "Timed out: {msg}"),
            XyPrissError::RateLimited(msg) => write!(f, "Rate limited: {msg}"),
            XyPrissError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            XyPrissError::Network(err) => write!(f, "Network error: {err}"),
            XyPrissError::Internal(msg) => write!(f, "Internal error: {msg}"),
            XyPrissError::Pingora(err) => write!(f, "Pingora error: {err}"),
        }
    }
}

impl std::error::Error for XyPrissError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            XyPrissError::Network(err) => Some(err),
            XyPrissError::Pingora(err) => Some(err),
            _ => None,
        }
    }
}

// Error conversions
impl From<std::io::Error> for XyPrissError {
    fn from(err: std::io::Error) -> Self {
        XyPrissError::Network(err)
    }
}

impl From<pingora_error::Error> for XyPrissError {
    fn from(err: pingora_error::Error) -> Self {
        XyPrissError::Pingora(err)
    }
}

impl From<serde_json::Error> for XyPrissError {
    fn from(err: serde_json::Error) -> Self {
        XyPrissError::CacheSerialization(err.to_string())
    }
}

impl From<XyPrissError> for Box<pingora_error::Error> {
    fn from(err: XyPrissError) -> Self {
        match err {
            XyPrissError::Pingora(pingora_err) => Box::new(pingora_err),
            _ => Box::new(pingora_error::Error::new_str("xypriss runtime error")),
        }
    }
}

/// Result type alias for runtime operations.
pub type XyResult<T> = std::result::Result<T, XyPrissError>;

/// Helper trait for adding context to errors.
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> XyResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> XyResult<T> {
        self.map_err(|e| XyPrissError::Internal(format!("{context}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            XyPrissError::RouteMatch("/missing".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            XyPrissError::Validation("bad json".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            XyPrissError::Timeout("handler".into()).status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            XyPrissError::Crypto("tag".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_context_helper() {
        let res: Result<(), &str> = Err("boom");
        let err = res.with_context("loading config").unwrap_err();
        assert!(err.to_string().contains("loading config"));
        assert!(err.to_string().contains("boom"));
    }
}
