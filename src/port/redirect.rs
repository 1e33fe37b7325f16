//! Cross-port redirection.
//!
//! A redirect instance runs a minimal listener on `from_port` and, per
//! accepted connection, either proxies bytes to `to_port` (transparent),
//! answers with a 301/302 whose `Location` rewrites the port (redirect), or
//! serves a configurable body naming the new URL (message). Instances track
//! request/success/failure counts and a rolling average latency, support
//! auto-disconnect by age or request count, and an optional rate limit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::core::{XyPrissError, XyResult};

/// Largest request head the redirector will buffer.
const MAX_HEAD_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    #[default]
    Transparent,
    Redirect,
    Message,
}

#[derive(Debug, Clone)]
pub struct RedirectOptions {
    pub mode: RedirectMode,
    /// 301 or 302 for redirect mode.
    pub redirect_status: u16,
    /// Body template for message mode; `{url}` expands to the new URL.
    pub message_body: Option<String>,
    /// Idle timeout for transparent byte proxying.
    pub idle_timeout: Duration,
    /// Inject `X-Forwarded-For` / `X-Forwarded-Proto` in transparent mode.
    pub forward_headers: bool,
    pub auto_disconnect_after: Option<Duration>,
    pub auto_disconnect_after_requests: Option<u64>,
    /// `(max_requests, window)` rate limit.
    pub rate_limit: Option<(u64, Duration)>,
}

impl Default for RedirectOptions {
    fn default() -> Self {
        Self {
            mode: RedirectMode::Transparent,
            redirect_status: 302,
            message_body: None,
            idle_timeout: Duration::from_secs(30),
            forward_headers: false,
            auto_disconnect_after: None,
            auto_disconnect_after_requests: None,
            rate_limit: None,
        }
    }
}

/// Rolling counters for one redirect instance.
#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_latency_micros: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedirectStats {
    pub from_port: u16,
    pub to_port: u16,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency_micros: u64,
    pub uptime_secs: u64,
}

struct RateWindow {
    started: Instant,
    count: u64,
}

struct Shared {
    from_port: u16,
    to_port: u16,
    options: RedirectOptions,
    counters: Counters,
    started_at: Instant,
    rate: Mutex<RateWindow>,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

/// A running cross-port redirect.
pub struct RedirectInstance {
    shared: Arc<Shared>,
}

impl RedirectInstance {
    /// Binds `from_port` and starts serving. The listener task runs until
    /// [`stop`](Self::stop) or auto-disconnect.
    pub async fn start(
        host: &str,
        from_port: u16,
        to_port: u16,
        options: RedirectOptions,
    ) -> XyResult<Self> {
        let listener = TcpListener::bind((host, from_port))
            .await
            .map_err(|e| XyPrissError::Bind(format!("redirect bind {host}:{from_port}: {e}")))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            from_port,
            to_port,
            options,
            counters: Counters::default(),
            started_at: Instant::now(),
            rate: Mutex::new(RateWindow {
                started: Instant::now(),
                count: 0,
            }),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        });

        if let Some(after) = shared.options.auto_disconnect_after {
            let timed = shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                timed.stop();
            });
        }

        let accept_shared = shared.clone();
        tokio::spawn(accept_loop(listener, accept_shared, shutdown_rx));

        log::info!("redirecting port {from_port} -> {to_port}");
        Ok(Self { shared })
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RedirectStats {
        let c = &self.shared.counters;
        let requests = c.requests.load(Ordering::Relaxed);
        RedirectStats {
            from_port: self.shared.from_port,
            to_port: self.shared.to_port,
            requests,
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            average_latency_micros: if requests == 0 {
                0
            } else {
                c.total_latency_micros.load(Ordering::Relaxed) / requests
            },
            uptime_secs: self.shared.started_at.elapsed().as_secs(),
        }
    }
}

impl Shared {
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
            log::info!("redirect {} -> {} stopped", self.from_port, self.to_port);
        }
    }

    /// Applies the rate limit; true when the connection may proceed.
    fn admit(&self) -> bool {
        let Some((max_requests, window)) = self.options.rate_limit else {
            return true;
        };
        let mut rate = self.rate.lock().unwrap();
        if rate.started.elapsed() >= window {
            rate.started = Instant::now();
            rate.count = 0;
        }
        rate.count += 1;
        rate.count <= max_requests
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("redirect accept failed: {e}");
                        continue;
                    }
                };
                let conn_shared = shared.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer.ip().to_string(), conn_shared).await;
                });
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer_ip: String, shared: Arc<Shared>) {
    let started = Instant::now();
    let requests = shared.counters.requests.fetch_add(1, Ordering::Relaxed) + 1;

    if !shared.admit() {
        let _ = stream
            .write_all(b"HTTP/1.1 429 Too Many Requests\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await;
        shared.counters.failures.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let outcome = match shared.options.mode {
        RedirectMode::Transparent => proxy_transparent(&mut stream, &peer_ip, &shared).await,
        RedirectMode::Redirect => respond_redirect(&mut stream, &shared).await,
        RedirectMode::Message => respond_message(&mut stream, &shared).await,
    };

    match outcome {
        Ok(()) => {
            shared.counters.successes.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            log::debug!("redirect connection failed: {e}");
            shared.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    shared
        .counters
        .total_latency_micros
        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

    if let Some(max) = shared.options.auto_disconnect_after_requests {
        if requests >= max {
            shared.stop();
        }
    }
}

/// Reads the request head (through the blank line) without consuming body
/// bytes beyond it.
async fn read_head(stream: &mut TcpStream) -> XyResult<Vec<u8>> {
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while head.len() < MAX_HEAD_BYTES {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(XyPrissError::Network)?;
        if n == 0 {
            break;
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
    }
    if head.is_empty() {
        return Err(XyPrissError::Validation("empty request".to_string()));
    }
    Ok(head)
}

fn head_line<'a>(head: &'a [u8], prefix: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(head).ok()?;
    text.lines()
        .find(|line| line.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase()))
}

fn request_path(head: &[u8]) -> String {
    std::str::from_utf8(head)
        .ok()
        .and_then(|text| text.lines().next())
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string()
}

fn rewrite_host_port(head: &[u8], to_port: u16) -> String {
    let host = head_line(head, "host:")
        .and_then(|line| line.split_once(':').map(|(_, v)| v.trim()))
        .unwrap_or("localhost");
    let name = host.split(':').next().unwrap_or("localhost");
    format!("{name}:{to_port}")
}

async fn proxy_transparent(
    stream: &mut TcpStream,
    peer_ip: &str,
    shared: &Shared,
) -> XyResult<()> {
    let upstream = TcpStream::connect(("127.0.0.1", shared.to_port)).await;
    let mut upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            let _ = stream
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
            return Err(XyPrissError::Network(e));
        }
    };

    if shared.options.forward_headers {
        // Parse the first request head so the forwarding headers can be
        // injected; everything after flows byte-for-byte.
        let head = read_head(stream).await?;
        let injected = inject_forwarded_headers(&head, peer_ip);
        upstream
            .write_all(&injected)
            .await
            .map_err(XyPrissError::Network)?;
    }

    let copy = tokio::io::copy_bidirectional(stream, &mut upstream);
    match tokio::time::timeout(shared.options.idle_timeout, copy).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(XyPrissError::Network(e)),
        Err(_) => Err(XyPrissError::Timeout("redirect proxy idle timeout".to_string())),
    }
}

fn inject_forwarded_headers(head: &[u8], peer_ip: &str) -> Vec<u8> {
    let Some(boundary) = head.windows(4).position(|w| w == b"\r\n\r\n") else {
        return head.to_vec();
    };
    let mut out = Vec::with_capacity(head.len() + 64);
    out.extend_from_slice(&head[..boundary + 2]);
    out.extend_from_slice(format!("x-forwarded-for: {peer_ip}\r\n").as_bytes());
    out.extend_from_slice(b"x-forwarded-proto: http\r\n");
    out.extend_from_slice(&head[boundary + 2..]);
    out
}

async fn respond_redirect(stream: &mut TcpStream, shared: &Shared) -> XyResult<()> {
    let head = read_head(stream).await?;
    let path = request_path(&head);
    let location = format!("http://{}{path}", rewrite_host_port(&head, shared.to_port));
    let status = match shared.options.redirect_status {
        301 => "301 Moved Permanently",
        _ => "302 Found",
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nlocation: {location}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(XyPrissError::Network)
}

async fn respond_message(stream: &mut TcpStream, shared: &Shared) -> XyResult<()> {
    let head = read_head(stream).await?;
    let path = request_path(&head);
    let url = format!("http://{}{path}", rewrite_host_port(&head, shared.to_port));
    let body = shared
        .options
        .message_body
        .clone()
        .unwrap_or_else(|| "This service has moved to {url}".to_string())
        .replace("{url}", &url);
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(XyPrissError::Network)
}
