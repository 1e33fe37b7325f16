//! Request and response model for the dispatch pipeline.
//!
//! A [`Request`] is owned by the Dispatcher for the lifetime of one request;
//! a [`Response`] is mutated only on the request-handling task and becomes
//! immutable once [`Response::mark_sent`] flips the `sent` flag.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::context::{Classification, Timing};

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const TEXT_HTML: &str = "text/html";
    pub const APPLICATION_JSON: &str = "application/json";
    pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
    pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";
}

/// Parsed request body.
///
/// `Multipart` carries the raw bytes untouched; decoding is deferred to the
/// file-upload middleware.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Raw(Bytes),
    Json(JsonValue),
    Form(HashMap<String, String>),
    Multipart(Bytes),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// An incoming request as seen by the classifier, middleware chain, and
/// route handlers.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
    pub remote_addr: Option<SocketAddr>,
    pub protocol: String,
    /// Opaque id, unique per request.
    pub id: String,
    pub classification: Classification,
    /// Parameters extracted by the route table (`:name` segments or regex
    /// capture groups).
    pub params: BTreeMap<String, String>,
    pub timing: Timing,
    query: HashMap<String, Vec<String>>,
}

impl Request {
    /// Builds a request from its parts, parsing the query string eagerly.
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let query = parse_query(uri.query().unwrap_or_default());
        Self {
            method,
            uri,
            headers,
            body: Body::Empty,
            remote_addr: None,
            protocol: "http".to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            classification: Classification::Standard,
            params: BTreeMap::new(),
            timing: Timing::start(),
            query,
        }
    }

    /// Convenience constructor used heavily in tests.
    pub fn from_parts(method: Method, uri: &str) -> Self {
        let uri: Uri = uri.parse().unwrap_or_else(|_| Uri::from_static("/"));
        Self::new(method, uri, HeaderMap::new())
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// First value of a query parameter, if present.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    /// All values of a query parameter.
    pub fn query_params(&self, name: &str) -> &[String] {
        self.query.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Header value as a string; `None` if absent or not valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of a cookie from the `Cookie` header.
    ///
    /// Parses the header string manually; sufficient for simple key=value
    /// pairs. Returns the first occurrence of the cookie's value.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        let cookie_header = self.header("cookie").or_else(|| self.header("Cookie"))?;
        for item in cookie_header.split(';') {
            if let Some((k, v)) = item.trim().split_once('=') {
                if k.trim() == name {
                    return Some(v.trim());
                }
            }
        }
        None
    }

    /// True when the request carries any cookies at all. The ultra-fast
    /// path treats cookie-bearing requests as personalized.
    pub fn has_cookies(&self) -> bool {
        self.headers
            .get(header::COOKIE)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Client IP preferring `X-Forwarded-For`, then `X-Real-IP`, then the
    /// direct connection address.
    pub fn client_ip(&self) -> String {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            if let Some(ip) = forwarded.split(',').next() {
                let trimmed = ip.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        if let Some(real_ip) = self.header("x-real-ip") {
            let trimmed = real_ip.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        self.remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default()
    }

    /// Content-Type without parameters (charset etc.), lowercased.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
    }
}

/// Parses a query string into a name -> values mapping.
fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    if query.is_empty() {
        return out;
    }
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        out.entry(url_decode(k)).or_default().push(url_decode(v));
    }
    out
}

/// Minimal percent-decoding (`+` as space, `%XX` escapes). Invalid escapes
/// pass through unchanged.
pub(crate) fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A cookie queued on the response.
#[derive(Debug, Clone, Default)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
}

impl CookieRecord {
    fn to_header_value(&self) -> String {
        let mut s = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            s.push_str("; Path=");
            s.push_str(path);
        }
        if let Some(max_age) = self.max_age {
            s.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.http_only {
            s.push_str("; HttpOnly");
        }
        if self.secure {
            s.push_str("; Secure");
        }
        s
    }
}

/// The outgoing response under construction.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Vec<u8>,
    pub cookies: Vec<CookieRecord>,
    sent: bool,
    /// Per-request scratch space shared along the chain.
    pub locals: HashMap<String, JsonValue>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            cookies: Vec::new(),
            sent: false,
            locals: HashMap::new(),
        }
    }

    pub fn sent(&self) -> bool {
        self.sent
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Replaces the body bytes. Ignored after the response was sent.
    pub fn set_body(&mut self, body: Vec<u8>) {
        if self.sent {
            log::debug!("attempted body write after response was sent");
            return;
        }
        self.body = body;
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        if !self.sent {
            self.status = status;
        }
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        if self.sent {
            return self;
        }
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        } else {
            log::warn!("invalid header dropped: {name}");
        }
        self
    }

    /// Appends a value for a header, preserving existing ones.
    pub fn append_header(&mut self, name: &str, value: &str) -> &mut Self {
        if self.sent {
            return self;
        }
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn add_cookie(&mut self, cookie: CookieRecord) -> &mut Self {
        if !self.sent {
            self.cookies.push(cookie);
        }
        self
    }

    /// Writes a JSON body with the matching content type and marks the
    /// response as sent.
    pub fn send_json<T: Serialize>(&mut self, value: &T) {
        if self.sent {
            return;
        }
        match serde_json::to_vec(value) {
            Ok(body) => {
                self.set_header(header::CONTENT_TYPE.as_str(), content_type::APPLICATION_JSON);
                self.body = body;
            }
            Err(e) => {
                log::error!("failed to serialize JSON response: {e}");
                self.status = StatusCode::INTERNAL_SERVER_ERROR;
                self.body = b"{}".to_vec();
            }
        }
        self.mark_sent();
    }

    /// Writes a plain-text body and marks the response as sent.
    pub fn send_text(&mut self, text: &str) {
        if self.sent {
            return;
        }
        self.set_header(header::CONTENT_TYPE.as_str(), content_type::TEXT_PLAIN);
        self.body = text.as_bytes().to_vec();
        self.mark_sent();
    }

    /// Writes raw bytes and marks the response as sent.
    pub fn send_bytes(&mut self, body: Vec<u8>) {
        if self.sent {
            return;
        }
        self.body = body;
        self.mark_sent();
    }

    /// Flips the sent flag. The response is immutable afterwards.
    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    /// Body swap for the response-encoding stage that legitimately runs
    /// after the handler sent the response (compression).
    pub(crate) fn replace_body_post_send(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Standard short JSON error body: `{"error": "...", "code": "..."}`.
    pub fn send_error(&mut self, status: StatusCode, code: &str, message: &str) {
        if self.sent {
            return;
        }
        self.status = status;
        let body = serde_json::json!({ "error": message, "code": code });
        self.send_json(&body);
    }

    /// Converts into the `http::Response` consumed by the serving edge,
    /// flushing queued cookies as `Set-Cookie` headers.
    pub fn into_http_response(mut self) -> http::Response<Vec<u8>> {
        for cookie in &self.cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie.to_header_value()) {
                self.headers.append(header::SET_COOKIE, value);
            }
        }
        let mut builder = http::Response::builder().status(self.status);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers;
        }
        builder.body(self.body).unwrap_or_else(|e| {
            log::error!("failed to build HTTP response: {e}");
            http::Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(b"Internal Server Error".to_vec())
                .unwrap()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parsing() {
        let req = Request::from_parts(Method::GET, "/search?q=rust&tag=a&tag=b&flag");
        assert_eq!(req.query_param("q"), Some("rust"));
        assert_eq!(req.query_params("tag"), &["a".to_string(), "b".to_string()]);
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("a%20b+c"), "a b c");
        assert_eq!(url_decode("100%"), "100%");
    }

    #[test]
    fn test_cookie_lookup() {
        let mut req = Request::from_parts(Method::GET, "/");
        req.headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session=abc; theme=dark"),
        );
        assert_eq!(req.cookie("session"), Some("abc"));
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookie("missing"), None);
        assert!(req.has_cookies());
    }

    #[test]
    fn test_client_ip_precedence() {
        let mut req = Request::from_parts(Method::GET, "/");
        req.remote_addr = Some("10.0.0.1:1234".parse().unwrap());
        assert_eq!(req.client_ip(), "10.0.0.1");

        req.headers
            .insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(req.client_ip(), "10.0.0.2");

        req.headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.3, 10.0.0.4"),
        );
        assert_eq!(req.client_ip(), "10.0.0.3");
    }

    #[test]
    fn test_response_immutable_after_sent() {
        let mut res = Response::new();
        res.send_text("done");
        assert!(res.sent());
        assert_eq!(res.body(), b"done");

        res.set_status(StatusCode::IM_A_TEAPOT);
        res.send_text("again");
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body(), b"done");
    }

    #[test]
    fn test_error_body_shape() {
        let mut res = Response::new();
        res.send_error(StatusCode::BAD_REQUEST, "validation_error", "bad json");
        let parsed: JsonValue = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(parsed["code"], "validation_error");
        assert_eq!(parsed["error"], "bad json");
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_cookies_flushed_on_conversion() {
        let mut res = Response::new();
        res.add_cookie(CookieRecord {
            name: "sid".into(),
            value: "1".into(),
            http_only: true,
            ..Default::default()
        });
        res.send_text("ok");
        let http_res = res.into_http_response();
        let set_cookie = http_res.headers().get(header::SET_COOKIE).unwrap();
        assert_eq!(set_cookie.to_str().unwrap(), "sid=1; HttpOnly");
    }
}
