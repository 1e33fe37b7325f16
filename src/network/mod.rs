//! Network-layer plugins.
//!
//! Four sub-plugins, each independently toggleable: connection tuning,
//! response compression, rate limiting, and the reverse proxy. The
//! dispatcher runs the rate limiter as a pre-filter before classification
//! and compression as a post-filter on the final response; the proxy is a
//! separate serving mode wired at assembly.

pub mod compression;
pub mod connection;
pub mod proxy;
pub mod rate_limit;

use std::sync::Arc;

use crate::core::{Request, Response};

pub use compression::{CompressionOptions, CompressionPlugin};
pub use connection::ConnectionOptions;
pub use proxy::{LbPolicy, ProxyOptions, UpstreamNode, UpstreamPool};
pub use rate_limit::{KeyScope, RateLimitOptions, RateLimitPlugin, RateLimitStrategy};

/// The assembled per-request network filters.
#[derive(Default)]
pub struct NetworkPlugins {
    pub connection: ConnectionOptions,
    pub compression: Option<Arc<CompressionPlugin>>,
    pub rate_limit: Option<Arc<RateLimitPlugin>>,
}

impl NetworkPlugins {
    /// Pre-dispatch filters. Returns true when the request was fully
    /// answered (rate limited).
    pub async fn pre_filter(&self, req: &Request, res: &mut Response) -> bool {
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.apply(req, res).await {
                return true;
            }
        }
        false
    }

    /// Post-dispatch filters applied to the final response.
    pub fn post_filter(&self, req: &Request, res: &mut Response) {
        if let Some(compression) = &self.compression {
            if let Err(e) = compression.apply(req, res) {
                log::warn!("response compression failed: {e}");
            }
        }
    }
}
