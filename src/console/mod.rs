//! Console stream interception.
//!
//! An explicit wrapper installed at process start around the host's logger
//! (the "original stream"). Captures flow through a rate limiter and a
//! filter stage, may be AEAD-encrypted or reduced to a keyed hash for
//! display, land in a bounded trace ring, and are fanned out to registered
//! trace hooks whose panics are swallowed. A depth guard lets re-entrant
//! captures fall straight through to the original stream.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{Level, LevelFilter, Log, Metadata, Record};
use sha2::Sha256;

use crate::crypto::{AeadAlgorithm, CryptoProvider, NONCE_SIZE};

/// Re-entrant captures beyond this depth bypass the interceptor.
const MAX_RECURSION_DEPTH: u32 = 3;

thread_local! {
    static CAPTURE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Which output routes a capture reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreserveMode {
    /// Only the original stream.
    Original,
    /// Only the interception route.
    Intercepted,
    #[default]
    Both,
    None,
}

impl PreserveMode {
    /// Compatibility with the boolean "preserve original" form.
    pub fn from_bool(preserve_original: bool) -> Self {
        if preserve_original {
            PreserveMode::Both
        } else {
            PreserveMode::Intercepted
        }
    }

    fn to_original(self) -> bool {
        matches!(self, PreserveMode::Original | PreserveMode::Both)
    }

    fn to_intercepted(self) -> bool {
        matches!(self, PreserveMode::Intercepted | PreserveMode::Both)
    }
}

/// Displayed form of encrypted captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    #[default]
    Readable,
    EncryptedHashOnly,
    Both,
}

/// A capture filter pattern: plain substring, or `/regex/`.
#[derive(Debug, Clone)]
pub enum Pattern {
    Substring(String),
    Regex(regex::Regex),
}

impl Pattern {
    /// Parses slash-delimited input as a regex, anything else as a
    /// substring. An invalid regex degrades to a substring match of its
    /// source text.
    pub fn parse(input: &str) -> Self {
        if input.len() >= 2 && input.starts_with('/') && input.ends_with('/') {
            let body = &input[1..input.len() - 1];
            match regex::Regex::new(body) {
                Ok(re) => return Pattern::Regex(re),
                Err(e) => log::warn!("invalid capture pattern {input}: {e}"),
            }
        }
        Pattern::Substring(input.to_string())
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            Pattern::Substring(s) => text.contains(s.as_str()),
            Pattern::Regex(re) => re.is_match(text),
        }
    }
}

pub struct EncryptionOptions {
    pub provider: Arc<dyn CryptoProvider>,
    pub key: Vec<u8>,
    pub display: DisplayMode,
}

pub struct InterceptorOptions {
    pub enabled: bool,
    pub max_interceptions_per_second: u32,
    pub preserve: PreserveMode,
    pub min_level: LevelFilter,
    /// Captured messages are truncated to this length.
    pub max_length: usize,
    pub include_patterns: Vec<Pattern>,
    pub exclude_patterns: Vec<Pattern>,
    pub encryption: Option<EncryptionOptions>,
    pub trace_enabled: bool,
    pub trace_capacity: usize,
}

impl Default for InterceptorOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_interceptions_per_second: 1000,
            preserve: PreserveMode::Both,
            min_level: LevelFilter::Trace,
            max_length: 8 * 1024,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            encryption: None,
            trace_enabled: false,
            trace_capacity: 1000,
        }
    }
}

/// One captured log event, as delivered to trace hooks.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub timestamp_millis: u64,
    pub level: Level,
    pub target: String,
    /// Displayed message: readable, hashed, or both (per display mode).
    pub message: String,
}

type TraceHook = Box<dyn Fn(&CaptureRecord) + Send + Sync>;

#[derive(Default)]
pub struct InterceptorStats {
    pub captured: AtomicU64,
    pub passed_through: AtomicU64,
    pub rate_limited: AtomicU64,
    pub filtered: AtomicU64,
}

struct RateWindow {
    window_start: Instant,
    count: u32,
}

pub struct ConsoleInterceptor {
    inner: Box<dyn Log>,
    options: InterceptorOptions,
    rate: Mutex<RateWindow>,
    trace: Mutex<VecDeque<CaptureRecord>>,
    hooks: Mutex<Vec<TraceHook>>,
    pub stats: InterceptorStats,
}

impl ConsoleInterceptor {
    pub fn new(inner: Box<dyn Log>, options: InterceptorOptions) -> Self {
        Self {
            inner,
            options,
            rate: Mutex::new(RateWindow {
                window_start: Instant::now(),
                count: 0,
            }),
            trace: Mutex::new(VecDeque::new()),
            hooks: Mutex::new(Vec::new()),
            stats: InterceptorStats::default(),
        }
    }

    /// Installs the interceptor as the process logger, wrapping a default
    /// env_logger as the original stream. Call once at startup.
    pub fn install(options: InterceptorOptions) -> Result<(), log::SetLoggerError> {
        let env = env_logger::Builder::from_env(env_logger::Env::default()).build();
        let max_level = env.filter();
        let interceptor = Self::new(Box::new(env), options);
        log::set_boxed_logger(Box::new(interceptor))?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Registers a trace hook. Rejected with a warning when tracing is
    /// disabled in configuration.
    pub fn register_trace_hook<F>(&self, hook: F) -> bool
    where
        F: Fn(&CaptureRecord) + Send + Sync + 'static,
    {
        if !self.options.trace_enabled {
            log::warn!("trace hook rejected: console tracing is disabled");
            return false;
        }
        self.hooks.lock().unwrap().push(Box::new(hook));
        true
    }

    /// Contents of the trace ring, oldest first.
    pub fn trace_buffer(&self) -> Vec<CaptureRecord> {
        self.trace.lock().unwrap().iter().cloned().collect()
    }

    fn over_rate_limit(&self) -> bool {
        let mut rate = self.rate.lock().unwrap();
        if rate.window_start.elapsed().as_secs() >= 1 {
            rate.window_start = Instant::now();
            rate.count = 0;
        }
        rate.count += 1;
        rate.count > self.options.max_interceptions_per_second
    }

    fn passes_filters(&self, record: &Record) -> bool {
        if record.level() > self.options.min_level {
            return false;
        }
        let message = record.args().to_string();
        if !self.options.include_patterns.is_empty()
            && !self
                .options
                .include_patterns
                .iter()
                .any(|p| p.matches(&message))
        {
            return false;
        }
        if self
            .options
            .exclude_patterns
            .iter()
            .any(|p| p.matches(&message))
        {
            return false;
        }
        true
    }

    fn display_message(&self, message: &str) -> String {
        let Some(encryption) = &self.options.encryption else {
            return message.to_string();
        };

        let hash = keyed_hash(&encryption.key, message);
        match encryption.display {
            DisplayMode::Readable => message.to_string(),
            DisplayMode::EncryptedHashOnly => format!("[capture {hash}]"),
            DisplayMode::Both => match seal_capture(encryption, message) {
                Some(ciphertext) => format!("{message} [capture {hash} {ciphertext}]"),
                None => format!("{message} [capture {hash}]"),
            },
        }
    }

    fn capture(&self, record: &Record) {
        let raw = record.args().to_string();
        let truncated = if raw.len() > self.options.max_length {
            let mut cut = self.options.max_length;
            while !raw.is_char_boundary(cut) {
                cut -= 1;
            }
            raw[..cut].to_string()
        } else {
            raw
        };

        let capture = CaptureRecord {
            timestamp_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            level: record.level(),
            target: record.target().to_string(),
            message: self.display_message(&truncated),
        };

        self.stats.captured.fetch_add(1, Ordering::Relaxed);

        if self.options.trace_enabled {
            let mut trace = self.trace.lock().unwrap();
            if trace.len() == self.options.trace_capacity {
                trace.pop_front();
            }
            trace.push_back(capture.clone());
        }

        for hook in self.hooks.lock().unwrap().iter() {
            // Hook panics are swallowed.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&capture)));
        }
    }
}

impl Log for ConsoleInterceptor {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        let depth = CAPTURE_DEPTH.with(|d| d.get());
        if !self.options.enabled || depth >= MAX_RECURSION_DEPTH {
            self.stats.passed_through.fetch_add(1, Ordering::Relaxed);
            self.inner.log(record);
            return;
        }

        CAPTURE_DEPTH.with(|d| d.set(depth + 1));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if self.over_rate_limit() {
                // The excess passes through to the original stream and is
                // dropped from the capture route.
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                self.inner.log(record);
                return;
            }

            if !self.passes_filters(record) {
                self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                if self.options.preserve.to_original() {
                    self.inner.log(record);
                }
                return;
            }

            if self.options.preserve.to_intercepted() {
                self.capture(record);
            }
            if self.options.preserve.to_original() {
                self.inner.log(record);
            }
        }));
        CAPTURE_DEPTH.with(|d| d.set(depth));
        if outcome.is_err() {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// HMAC-SHA256 of the message under the capture key, hex-encoded and
/// shortened for display.
fn keyed_hash(key: &[u8], message: &str) -> String {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    let digest = mac.finalize().into_bytes();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Seals a capture as `base64(nonce || ciphertext || tag)` for the `both`
/// display mode.
fn seal_capture(encryption: &EncryptionOptions, message: &str) -> Option<String> {
    let nonce = encryption.provider.random_bytes(NONCE_SIZE);
    let sealed = encryption
        .provider
        .aead_encrypt(
            AeadAlgorithm::Aes256Gcm,
            &encryption.key,
            &nonce,
            message.as_bytes(),
            b"",
        )
        .ok()?;
    let mut packed = nonce;
    packed.extend_from_slice(&sealed.ciphertext);
    packed.extend_from_slice(&sealed.auth_tag);
    Some(BASE64.encode(packed))
}
