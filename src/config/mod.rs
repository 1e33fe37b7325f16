//! Server configuration.
//!
//! Defaults overlaid by the YAML file overlaid by CLI options and the
//! process environment. User-facing keys use camelCase; each group
//! translates into the runtime options of the subsystem it configures.

pub mod registry;

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use once_cell::sync::Lazy;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::cache::{CacheOptions, CacheStrategy};
use crate::cluster::ClusterOptions;
use crate::console::{InterceptorOptions, Pattern, PreserveMode};
use crate::dispatch::limits::ConcurrencyOptions;
use crate::dispatch::{PayloadOptions, TimeoutOptions};
use crate::network::compression::CompressionOptions;
use crate::network::proxy::{CircuitBreakerOptions, HealthCheckOptions, LbPolicy, ProxyOptions, UpstreamNode};
use crate::network::rate_limit::{KeyScope, RateLimitOptions, RateLimitStrategy};
use crate::network::ConnectionOptions;
use crate::port::{PortSwitchOptions, SwitchStrategy};

/// Environment variable consulted for the initial default port.
pub const PORT_ENV: &str = "PORT";

// Pre-compiled pattern for proxy upstream addresses so malformed nodes are
// rejected at load time instead of at pool assembly.
static UPSTREAM_ADDR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]*:\d{1,5}$")
        .expect("Invalid upstream address pattern")
});

/// Root configuration combining the pingora framework config with the
/// application settings.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Pingora framework configuration (threads, daemon, upgrade, etc.)
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    #[serde(default)]
    pub server: ServerSettings,

    #[validate(nested)]
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub security: SecuritySettings,

    #[validate(nested)]
    #[serde(default)]
    pub cluster: ClusterSettings,

    #[validate(nested)]
    #[serde(default)]
    pub network: NetworkSettings,

    #[validate(nested)]
    #[serde(default, rename = "requestManagement")]
    pub request_management: RequestManagementSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub plugins: PluginSettings,
}

impl Config {
    /// Loads configuration from a YAML file with validation.
    ///
    /// Synchronous loading is intentional - configuration should be
    /// validated at startup before any async operations begin.
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        log::debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    /// Main loading entry point combining the file with CLI overrides and
    /// the environment. Without a file, defaults plus environment apply.
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        let mut conf = match &opt.conf {
            Some(path) => Self::load_from_yaml(path)?,
            None => Self::default(),
        };
        conf.merge_with_opt(opt);
        conf.apply_environment();
        Ok(conf)
    }

    /// Parses a YAML configuration string with validation.
    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;
        conf.validate()
            .or_err_with(FileReadError, || "Conf file validation failed")?;
        Ok(conf)
    }

    /// Serializes configuration back to YAML for debugging or export.
    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| {
            log::error!("Failed to serialize config to YAML: {e}");
            String::new()
        })
    }

    /// Applies CLI option overrides.
    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    /// Environment overlays: `PORT` seeds the bind port when the file left
    /// it at the default.
    pub fn apply_environment(&mut self) {
        if let Ok(port) = std::env::var(PORT_ENV) {
            match port.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => log::warn!("ignoring unparseable {PORT_ENV}={port}"),
            }
        }
    }
}

// ---- server ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
    #[serde(default = "ServerSettings::default_host")]
    pub host: String,
    #[validate(nested)]
    #[serde(default)]
    pub auto_port_switch: AutoPortSwitchSettings,
    /// Maximum accepted JSON body, bytes.
    #[serde(default = "ServerSettings::default_json_limit")]
    pub json_limit: usize,
    /// Maximum accepted urlencoded body, bytes.
    #[serde(default = "ServerSettings::default_json_limit")]
    pub url_encoded_limit: usize,
    #[serde(default = "ServerSettings::default_auto_parse_json")]
    pub auto_parse_json: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            host: Self::default_host(),
            auto_port_switch: AutoPortSwitchSettings::default(),
            json_limit: Self::default_json_limit(),
            url_encoded_limit: Self::default_json_limit(),
            auto_parse_json: true,
        }
    }
}

impl ServerSettings {
    fn default_port() -> u16 {
        8080
    }

    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_json_limit() -> usize {
        10 * 1024 * 1024
    }

    fn default_auto_parse_json() -> bool {
        true
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AutoPortSwitchSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: SwitchStrategy,
    #[validate(range(min = 1, max = 1000))]
    #[serde(default = "AutoPortSwitchSettings::default_max_attempts")]
    pub max_attempts: u32,
    /// Inclusive `[low, high]` search bounds.
    pub port_range: Option<(u16, u16)>,
    #[serde(default)]
    pub predefined_ports: Vec<u16>,
}

impl Default for AutoPortSwitchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: SwitchStrategy::default(),
            max_attempts: Self::default_max_attempts(),
            port_range: None,
            predefined_ports: Vec::new(),
        }
    }
}

impl AutoPortSwitchSettings {
    fn default_max_attempts() -> u32 {
        10
    }

    pub fn to_options(&self) -> PortSwitchOptions {
        PortSwitchOptions {
            enabled: self.enabled,
            strategy: self.strategy,
            max_attempts: self.max_attempts,
            port_range: self.port_range,
            predefined_ports: self.predefined_ports.clone(),
        }
    }
}

// ---- cache ----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "CacheSettings::validate_redis_presence"))]
pub struct CacheSettings {
    #[serde(default)]
    pub strategy: CacheStrategy,
    /// Overall memory-tier byte budget.
    #[serde(default = "CacheSettings::default_max_size")]
    pub max_size: usize,
    /// Default entry TTL, seconds.
    pub ttl: Option<u64>,
    pub redis: Option<RedisSettings>,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default = "CacheSettings::default_enable_compression")]
    pub enable_compression: bool,
    #[validate(range(min = 1, max = 9))]
    #[serde(default = "CacheSettings::default_compression_level")]
    pub compression_level: u32,
    #[serde(default = "CacheSettings::default_enable_encryption")]
    pub enable_encryption: bool,
    /// Compatibility fallthrough for undecryptable entries. Forced off in
    /// production mode.
    #[serde(default)]
    pub allow_plaintext_fallback: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::default(),
            max_size: Self::default_max_size(),
            ttl: None,
            redis: None,
            memory: MemorySettings::default(),
            enable_compression: true,
            compression_level: Self::default_compression_level(),
            enable_encryption: true,
            allow_plaintext_fallback: false,
        }
    }
}

impl CacheSettings {
    fn default_max_size() -> usize {
        64 * 1024 * 1024
    }

    fn default_enable_compression() -> bool {
        true
    }

    fn default_compression_level() -> u32 {
        6
    }

    fn default_enable_encryption() -> bool {
        true
    }

    fn validate_redis_presence(&self) -> std::result::Result<(), ValidationError> {
        if matches!(self.strategy, CacheStrategy::Redis | CacheStrategy::Hybrid)
            && self.redis.is_none()
        {
            return Err(ValidationError::new("redis_settings_required"));
        }
        Ok(())
    }

    pub fn to_options(&self, production: bool) -> CacheOptions {
        CacheOptions {
            strategy: self.strategy,
            memory_max_bytes: self.memory.max_size.min(self.max_size),
            memory_max_entries: self.memory.max_entries,
            default_ttl: self.ttl.map(Duration::from_secs),
            enable_compression: self.enable_compression,
            compression_level: self.compression_level,
            enable_encryption: self.enable_encryption,
            allow_plaintext_fallback: self.allow_plaintext_fallback && !production,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RedisSettings {
    pub host: String,
    #[serde(default = "RedisSettings::default_port")]
    pub port: u16,
    pub password: Option<String>,
    #[serde(default)]
    pub cluster: bool,
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl RedisSettings {
    fn default_port() -> u16 {
        6379
    }

    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{password}@{}:{}", self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MemorySettings {
    #[serde(default = "MemorySettings::default_max_size")]
    pub max_size: usize,
    #[validate(range(min = 1))]
    #[serde(default = "MemorySettings::default_max_entries")]
    pub max_entries: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_size: Self::default_max_size(),
            max_entries: Self::default_max_entries(),
        }
    }
}

impl MemorySettings {
    fn default_max_size() -> usize {
        64 * 1024 * 1024
    }

    fn default_max_entries() -> usize {
        10_000
    }
}

// ---- security -------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySettings {
    #[serde(default)]
    pub encryption: bool,
    #[serde(default)]
    pub cors: bool,
    #[serde(default)]
    pub helmet: bool,
    #[serde(default)]
    pub xss: bool,
    #[serde(default)]
    pub brute_force: bool,
    #[serde(default)]
    pub authentication: AuthenticationSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticationSettings {
    pub jwt: Option<JwtSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtSettings {
    pub secret: String,
    /// Token lifetime for issued tokens, e.g. `3600`.
    pub expires_in: Option<u64>,
}

// ---- cluster --------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ClusterSettings {
    #[serde(default)]
    pub enabled: bool,
    #[validate(nested)]
    #[serde(default)]
    pub config: ClusterTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "ClusterTuning::validate_bounds"))]
pub struct ClusterTuning {
    pub workers: Option<usize>,
    #[serde(default = "ClusterTuning::default_max_restarts")]
    pub max_restarts: u32,
    /// Seconds.
    #[serde(default = "ClusterTuning::default_restart_window")]
    pub restart_window: u64,
    #[serde(default = "ClusterTuning::default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "ClusterTuning::default_max_workers")]
    pub max_workers: usize,
}

impl Default for ClusterTuning {
    fn default() -> Self {
        Self {
            workers: None,
            max_restarts: Self::default_max_restarts(),
            restart_window: Self::default_restart_window(),
            min_workers: Self::default_min_workers(),
            max_workers: Self::default_max_workers(),
        }
    }
}

impl ClusterTuning {
    fn default_max_restarts() -> u32 {
        10
    }

    fn default_restart_window() -> u64 {
        600
    }

    fn default_min_workers() -> usize {
        1
    }

    fn default_max_workers() -> usize {
        16
    }

    fn validate_bounds(&self) -> std::result::Result<(), ValidationError> {
        if self.min_workers == 0 || self.min_workers > self.max_workers {
            return Err(ValidationError::new("invalid_worker_bounds"));
        }
        Ok(())
    }

    pub fn to_options(&self) -> ClusterOptions {
        ClusterOptions {
            workers: self.workers,
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            max_restarts: self.max_restarts,
            restart_window: Duration::from_secs(self.restart_window),
            ..Default::default()
        }
    }
}

// ---- network --------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub connection: ConnectionOptions,
    #[validate(nested)]
    #[serde(default)]
    pub compression: CompressionSettings,
    #[validate(nested)]
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[validate(nested)]
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CompressionSettings {
    #[serde(default)]
    pub enabled: bool,
    #[validate(range(min = 1, max = 9))]
    #[serde(default = "CompressionSettings::default_level")]
    pub level: u32,
    #[serde(default = "CompressionSettings::default_threshold")]
    pub threshold: usize,
    #[serde(default)]
    pub content_types: Vec<String>,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: Self::default_level(),
            threshold: Self::default_threshold(),
            content_types: Vec::new(),
        }
    }
}

impl CompressionSettings {
    fn default_level() -> u32 {
        6
    }

    fn default_threshold() -> usize {
        1024
    }

    pub fn to_options(&self) -> CompressionOptions {
        let mut options = CompressionOptions {
            enabled: self.enabled,
            level: self.level,
            threshold: self.threshold,
            ..Default::default()
        };
        if !self.content_types.is_empty() {
            options.content_types = self.content_types.clone();
        }
        options
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: RateLimitStrategy,
    #[validate(range(min = 1))]
    #[serde(default = "RateLimitSettings::default_max_requests")]
    pub max_requests: u64,
    /// Window, milliseconds.
    #[serde(default = "RateLimitSettings::default_window_ms")]
    pub window_ms: u64,
    #[serde(default)]
    pub key_scope: KeyScope,
    #[serde(default = "RateLimitSettings::default_header_prefix")]
    pub header_prefix: String,
    #[serde(default)]
    pub distributed: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: RateLimitStrategy::default(),
            max_requests: Self::default_max_requests(),
            window_ms: Self::default_window_ms(),
            key_scope: KeyScope::default(),
            header_prefix: Self::default_header_prefix(),
            distributed: false,
        }
    }
}

impl RateLimitSettings {
    fn default_max_requests() -> u64 {
        100
    }

    fn default_window_ms() -> u64 {
        60_000
    }

    fn default_header_prefix() -> String {
        "X-RateLimit".to_string()
    }

    pub fn to_options(&self) -> RateLimitOptions {
        RateLimitOptions {
            enabled: self.enabled,
            strategy: self.strategy,
            max_requests: self.max_requests,
            window: Duration::from_millis(self.window_ms.max(1)),
            key_scope: self.key_scope,
            header_prefix: self.header_prefix.clone(),
            distributed: self.distributed,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    #[validate(custom(function = "ProxySettings::validate_upstreams"))]
    pub upstreams: Vec<UpstreamNode>,
    #[serde(default)]
    pub policy: LbPolicy,
    pub health_check: Option<HealthCheckOptions>,
    pub circuit_breaker: Option<CircuitBreakerOptions>,
}

impl ProxySettings {
    fn validate_upstreams(
        upstreams: &[UpstreamNode],
    ) -> std::result::Result<(), ValidationError> {
        for node in upstreams {
            if !UPSTREAM_ADDR_REGEX.is_match(&node.address) {
                let mut err = ValidationError::new("invalid_upstream_address");
                err.add_param("address".into(), &node.address);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn to_options(&self) -> ProxyOptions {
        ProxyOptions {
            enabled: self.enabled,
            upstreams: self.upstreams.clone(),
            policy: self.policy,
            health_check: self.health_check.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
        }
    }
}

// ---- request management ---------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RequestManagementSettings {
    #[serde(default)]
    pub timeout: TimeoutSettings,
    #[serde(default)]
    pub network_quality: NetworkQualitySettings,
    #[validate(nested)]
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub payload: PayloadSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSettings {
    #[serde(default = "TimeoutSettings::default_enabled")]
    pub enabled: bool,
    /// Milliseconds.
    #[serde(default = "TimeoutSettings::default_timeout_ms")]
    pub default_timeout: u64,
    /// Per-route overrides, pattern -> milliseconds.
    #[serde(default)]
    pub routes: HashMap<String, u64>,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timeout: Self::default_timeout_ms(),
            routes: HashMap::new(),
        }
    }
}

impl TimeoutSettings {
    fn default_enabled() -> bool {
        true
    }

    fn default_timeout_ms() -> u64 {
        30_000
    }

    pub fn to_options(&self) -> TimeoutOptions {
        TimeoutOptions {
            enabled: self.enabled,
            default_timeout: Duration::from_millis(self.default_timeout.max(1)),
            routes: self
                .routes
                .iter()
                .map(|(pattern, ms)| (pattern.clone(), Duration::from_millis(*ms)))
                .collect(),
        }
    }
}

/// Declarative bandwidth/latency expectations. Carried for collaborators;
/// the core applies no behavior to them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkQualitySettings {
    #[serde(default)]
    pub enabled: bool,
    pub min_bandwidth: Option<u64>,
    pub max_latency: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencySettings {
    #[validate(range(min = 1))]
    #[serde(default = "ConcurrencySettings::default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[validate(range(min = 1))]
    #[serde(default = "ConcurrencySettings::default_max_per_ip", alias = "maxPerIP")]
    pub max_per_ip: usize,
    /// Milliseconds.
    #[serde(default = "ConcurrencySettings::default_queue_timeout_ms")]
    pub queue_timeout: u64,
    /// Route prefix -> priority; higher dequeues first.
    #[serde(default)]
    pub route_priorities: HashMap<String, i32>,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: Self::default_max_concurrent(),
            max_per_ip: Self::default_max_per_ip(),
            queue_timeout: Self::default_queue_timeout_ms(),
            route_priorities: HashMap::new(),
        }
    }
}

impl ConcurrencySettings {
    fn default_max_concurrent() -> usize {
        1024
    }

    fn default_max_per_ip() -> usize {
        64
    }

    fn default_queue_timeout_ms() -> u64 {
        2000
    }

    pub fn to_options(&self) -> ConcurrencyOptions {
        ConcurrencyOptions {
            max_concurrent_requests: self.max_concurrent_requests,
            max_per_ip: self.max_per_ip,
            queue_timeout: Duration::from_millis(self.queue_timeout.max(1)),
            route_priorities: self
                .route_priorities
                .iter()
                .map(|(pattern, priority)| (pattern.clone(), *priority))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSettings {
    #[serde(default = "PayloadSettings::default_max_body")]
    pub max_body_size: usize,
    #[serde(default = "PayloadSettings::default_max_url")]
    pub max_url_length: usize,
    #[serde(default = "PayloadSettings::default_max_file")]
    pub max_file_size: usize,
    #[serde(default)]
    pub allowed_mime_types: Vec<String>,
}

impl Default for PayloadSettings {
    fn default() -> Self {
        Self {
            max_body_size: Self::default_max_body(),
            max_url_length: Self::default_max_url(),
            max_file_size: Self::default_max_file(),
            allowed_mime_types: Vec::new(),
        }
    }
}

impl PayloadSettings {
    fn default_max_body() -> usize {
        10 * 1024 * 1024
    }

    fn default_max_url() -> usize {
        8 * 1024
    }

    fn default_max_file() -> usize {
        100 * 1024 * 1024
    }

    pub fn to_options(&self, server: &ServerSettings) -> PayloadOptions {
        PayloadOptions {
            max_body_size: self.max_body_size,
            max_url_length: self.max_url_length,
            auto_parse_json: server.auto_parse_json,
            json_limit: server.json_limit,
            url_encoded_limit: server.url_encoded_limit,
        }
    }
}

// ---- logging --------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_enabled")]
    pub enabled: bool,
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
    /// Component names whose logs are kept; empty keeps all.
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub console_interception: ConsoleInterceptionSettings,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: Self::default_level(),
            components: Vec::new(),
            types: Vec::new(),
            console_interception: ConsoleInterceptionSettings::default(),
        }
    }
}

impl LoggingSettings {
    fn default_enabled() -> bool {
        true
    }

    fn default_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleInterceptionSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "ConsoleInterceptionSettings::default_max_per_second")]
    pub max_interceptions_per_second: u32,
    /// `original` | `intercepted` | `both` | `none`; the boolean form of
    /// "preserve original" is accepted for compatibility.
    #[serde(default)]
    pub preserve: PreserveSetting,
    #[serde(default = "ConsoleInterceptionSettings::default_min_level")]
    pub min_level: String,
    #[serde(default = "ConsoleInterceptionSettings::default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub trace_enabled: bool,
    #[serde(default = "ConsoleInterceptionSettings::default_trace_capacity")]
    pub trace_capacity: usize,
}

impl Default for ConsoleInterceptionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_interceptions_per_second: Self::default_max_per_second(),
            preserve: PreserveSetting::default(),
            min_level: Self::default_min_level(),
            max_length: Self::default_max_length(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            trace_enabled: false,
            trace_capacity: Self::default_trace_capacity(),
        }
    }
}

/// Preserve-mode setting accepting either the enum or the legacy boolean.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreserveSetting {
    Named(String),
    Legacy(bool),
}

impl Default for PreserveSetting {
    fn default() -> Self {
        PreserveSetting::Named("both".to_string())
    }
}

impl PreserveSetting {
    pub fn to_mode(&self) -> PreserveMode {
        match self {
            PreserveSetting::Legacy(preserve_original) => {
                PreserveMode::from_bool(*preserve_original)
            }
            PreserveSetting::Named(name) => match name.as_str() {
                "original" => PreserveMode::Original,
                "intercepted" => PreserveMode::Intercepted,
                "none" => PreserveMode::None,
                "both" => PreserveMode::Both,
                other => {
                    log::warn!("unknown preserve mode {other:?}, using both");
                    PreserveMode::Both
                }
            },
        }
    }
}

impl ConsoleInterceptionSettings {
    fn default_max_per_second() -> u32 {
        1000
    }

    fn default_min_level() -> String {
        "trace".to_string()
    }

    fn default_max_length() -> usize {
        8 * 1024
    }

    fn default_trace_capacity() -> usize {
        1000
    }

    pub fn to_options(&self) -> InterceptorOptions {
        InterceptorOptions {
            enabled: self.enabled,
            max_interceptions_per_second: self.max_interceptions_per_second,
            preserve: self.preserve.to_mode(),
            min_level: self.min_level.parse().unwrap_or(log::LevelFilter::Trace),
            max_length: self.max_length,
            include_patterns: self.include_patterns.iter().map(|p| Pattern::parse(p)).collect(),
            exclude_patterns: self.exclude_patterns.iter().map(|p| Pattern::parse(p)).collect(),
            encryption: None,
            trace_enabled: self.trace_enabled,
            trace_capacity: self.trace_capacity,
        }
    }
}

// ---- plugins --------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSettings {
    /// Plugin ids to activate, in registration order.
    #[serde(default)]
    pub register: Vec<String>,
    /// Plugin id -> allowed hook names.
    #[serde(default)]
    pub plugin_permissions: HashMap<String, Vec<String>>,
}

impl PluginSettings {
    /// Resolves the registration policy for a plugin id: an entry in
    /// `pluginPermissions` becomes an allowed-hooks set, unknown hook names
    /// are dropped with a warning, and ids without an entry get the
    /// allow-all policy.
    pub fn policy_for(&self, id: &str) -> crate::plugins::PluginPolicy {
        let Some(names) = self.plugin_permissions.get(id) else {
            return crate::plugins::PluginPolicy::default();
        };
        let mut allowed = std::collections::HashSet::new();
        for name in names {
            match crate::plugins::Hook::parse(name) {
                Some(hook) => {
                    allowed.insert(hook);
                }
                None => log::warn!("unknown hook {name:?} in pluginPermissions for {id}"),
            }
        }
        crate::plugins::PluginPolicy {
            allowed_hooks: Some(allowed),
            lifecycle_timeout: None,
        }
    }
}
