//! Connection-level tuning.
//!
//! Pure configuration carried to the serving edge: HTTP/2 stream and window
//! settings, keep-alive policy, and connection pool caps. Application
//! happens once at listener assembly; nothing here alters request
//! processing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http2Options {
    #[serde(default = "Http2Options::default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
    #[serde(default = "Http2Options::default_initial_window_size")]
    pub initial_window_size: u32,
    /// Offer cleartext HTTP/2 upgrades on plain listeners.
    #[serde(default)]
    pub enable_h2c: bool,
}

impl Default for Http2Options {
    fn default() -> Self {
        Self {
            max_concurrent_streams: Self::default_max_concurrent_streams(),
            initial_window_size: Self::default_initial_window_size(),
            enable_h2c: false,
        }
    }
}

impl Http2Options {
    fn default_max_concurrent_streams() -> u32 {
        128
    }

    fn default_initial_window_size() -> u32 {
        1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveOptions {
    #[serde(default = "KeepAliveOptions::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "KeepAliveOptions::default_max_requests")]
    pub max_requests_per_connection: u32,
}

impl Default for KeepAliveOptions {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
            max_requests_per_connection: Self::default_max_requests(),
        }
    }
}

impl KeepAliveOptions {
    fn default_timeout_secs() -> u64 {
        60
    }

    fn default_max_requests() -> u32 {
        1000
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub http2: Http2Options,
    #[serde(default)]
    pub keep_alive: KeepAliveOptions,
    /// Upper bound on pooled upstream connections.
    #[serde(default = "ConnectionOptions::default_pool_size")]
    pub max_pool_size: usize,
}

impl ConnectionOptions {
    fn default_pool_size() -> usize {
        256
    }
}
