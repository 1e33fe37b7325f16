//! Reverse-proxy upstream pool.
//!
//! Upstreams are weighted `host:port` nodes behind a selection policy:
//! round-robin and weighted-round-robin ride the load-balancing crate's
//! weighted selection, ip-hash uses ketama keyed on the client address, and
//! least-connections / least-response-time select over live per-node
//! gauges. Active HTTP health checks run as a background service;
//! unhealthy nodes are excluded until they pass again. An optional
//! per-upstream circuit breaker short-circuits nodes that keep failing.

use std::collections::BTreeSet;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use pingora::services::background::background_service;
use pingora_core::services::Service;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::Error as PingoraError;
use pingora_load_balancing::{
    discovery::Static,
    health_check::{HealthCheck as HealthCheckTrait, HttpHealthCheck},
    selection::{consistent::KetamaHashing, BackendIter, BackendSelection, RoundRobin},
    Backend, Backends, LoadBalancer,
};
use pingora_http::ResponseHeader;
use pingora_runtime::Runtime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::core::{XyPrissError, XyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    IpHash,
    LeastConnections,
    LeastResponseTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamNode {
    pub address: String,
    #[serde(default = "UpstreamNode::default_weight")]
    pub weight: u32,
}

impl UpstreamNode {
    fn default_weight() -> u32 {
        1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckOptions {
    #[serde(default = "HealthCheckOptions::default_path")]
    pub path: String,
    #[serde(default = "HealthCheckOptions::default_interval")]
    pub interval_secs: u64,
    #[serde(default = "HealthCheckOptions::default_unhealthy")]
    pub unhealthy_threshold: usize,
    #[serde(default = "HealthCheckOptions::default_healthy")]
    pub healthy_threshold: usize,
    #[serde(default = "HealthCheckOptions::default_timeout")]
    pub timeout_secs: u64,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            interval_secs: Self::default_interval(),
            unhealthy_threshold: Self::default_unhealthy(),
            healthy_threshold: Self::default_healthy(),
            timeout_secs: Self::default_timeout(),
        }
    }
}

impl HealthCheckOptions {
    fn default_path() -> String {
        "/health".to_string()
    }
    fn default_interval() -> u64 {
        5
    }
    fn default_unhealthy() -> usize {
        3
    }
    fn default_healthy() -> usize {
        2
    }
    fn default_timeout() -> u64 {
        2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    pub failure_threshold: u32,
    pub open_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub enabled: bool,
    pub upstreams: Vec<UpstreamNode>,
    pub policy: LbPolicy,
    pub health_check: Option<HealthCheckOptions>,
    pub circuit_breaker: Option<CircuitBreakerOptions>,
}

/// Live gauges per upstream address.
#[derive(Default)]
struct NodeGauges {
    active: AtomicU32,
    ewma_micros: AtomicU64,
    breaker_failures: AtomicU32,
    breaker_open_until_millis: AtomicU64,
}

enum SelectionLB {
    RoundRobin(LB<RoundRobin>),
    Ketama(LB<KetamaHashing>),
}

struct LB<BS: BackendSelection> {
    upstreams: Arc<LoadBalancer<BS>>,
    service: Option<Box<dyn Service + 'static>>,
}

impl<BS> LB<BS>
where
    BS: BackendSelection + Send + Sync + 'static,
    BS::Iter: BackendIter,
{
    fn build(options: &ProxyOptions) -> XyResult<Self> {
        let backends = build_backends(&options.upstreams)?;
        let discovery = Static::new(backends);
        let mut upstreams = LoadBalancer::<BS>::from_backends(Backends::new(discovery));

        if let Some(check) = &options.health_check {
            upstreams.set_health_check(build_health_check(check));
            upstreams.health_check_frequency =
                Some(Duration::from_secs(check.interval_secs.max(1)));
        }

        let background = background_service("upstream health check", upstreams);
        let upstreams = background.task();
        Ok(Self {
            upstreams,
            service: Some(Box::new(background)),
        })
    }
}

fn build_backends(nodes: &[UpstreamNode]) -> XyResult<BTreeSet<Backend>> {
    let mut backends = BTreeSet::new();
    for node in nodes {
        let addr = node
            .address
            .to_socket_addrs()
            .map_err(|e| XyPrissError::Config(format!("invalid upstream {}: {e}", node.address)))?
            .next()
            .ok_or_else(|| {
                XyPrissError::Config(format!("unresolvable upstream {}", node.address))
            })?
            .to_string();

        let mut backend = Backend::new(&addr)
            .map_err(|e| XyPrissError::Config(format!("invalid upstream {addr}: {e}")))?;
        backend.weight = node.weight.max(1) as usize;

        let host = node.address.split(':').next().unwrap_or_default().to_string();
        let peer = HttpPeer::new(&addr, false, host);
        assert!(backend.ext.insert::<HttpPeer>(peer).is_none());
        backends.insert(backend);
    }
    Ok(backends)
}

fn build_health_check(
    options: &HealthCheckOptions,
) -> Box<dyn HealthCheckTrait + Send + Sync + 'static> {
    let mut check = HttpHealthCheck::new("localhost", false);
    check.peer_template.options.total_connection_timeout =
        Some(Duration::from_secs(options.timeout_secs.max(1)));
    check.consecutive_success = options.healthy_threshold;
    check.consecutive_failure = options.unhealthy_threshold;

    if let Ok(uri) = http::Uri::builder()
        .path_and_query(options.path.clone())
        .build()
    {
        check.req.set_uri(uri);
    }
    check.validator = Some(Box::new(|header: &ResponseHeader| {
        if header.status.is_success() {
            Ok(())
        } else {
            Err(PingoraError::new_str("unhealthy response"))
        }
    }));
    Box::new(check)
}

pub struct UpstreamPool {
    policy: LbPolicy,
    lb: SelectionLB,
    gauges: DashMap<String, Arc<NodeGauges>>,
    breaker: Option<CircuitBreakerOptions>,
    runtime: Option<Runtime>,
    watch: Option<watch::Sender<bool>>,
}

impl UpstreamPool {
    pub fn new(options: ProxyOptions) -> XyResult<Self> {
        if options.upstreams.is_empty() {
            return Err(XyPrissError::Config(
                "proxy enabled with no upstreams".to_string(),
            ));
        }
        let lb = match options.policy {
            LbPolicy::IpHash => SelectionLB::Ketama(LB::<KetamaHashing>::build(&options)?),
            _ => SelectionLB::RoundRobin(LB::<RoundRobin>::build(&options)?),
        };
        Ok(Self {
            policy: options.policy,
            lb,
            gauges: DashMap::new(),
            breaker: options.circuit_breaker,
            runtime: None,
            watch: None,
        })
    }

    /// Starts the discovery/health background service; runs only once.
    pub fn start_health_check(&mut self, work_stealing: bool) {
        if let Some(mut service) = self.take_background_service() {
            let (tx, rx) = watch::channel(false);
            self.watch = Some(tx);

            let threads = service.threads().unwrap_or(1);
            let runtime = if work_stealing {
                Runtime::new_steal(threads, service.name())
            } else {
                Runtime::new_no_steal(threads, service.name())
            };
            runtime.get_handle().spawn(async move {
                service.start_service(None, rx).await;
                log::info!("upstream health service exited");
            });
            self.runtime = Some(runtime);
        }
    }

    fn take_background_service(&mut self) -> Option<Box<dyn Service + 'static>> {
        match self.lb {
            SelectionLB::RoundRobin(ref mut lb) => lb.service.take(),
            SelectionLB::Ketama(ref mut lb) => lb.service.take(),
        }
    }

    fn gauges_for(&self, addr: &str) -> Arc<NodeGauges> {
        self.gauges
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(NodeGauges::default()))
            .clone()
    }

    fn breaker_open(&self, addr: &str) -> bool {
        if self.breaker.is_none() {
            return false;
        }
        let gauges = self.gauges_for(addr);
        let until = gauges.breaker_open_until_millis.load(Ordering::Relaxed);
        until != 0 && millis_now() < until
    }

    /// Selects a backend for a request from `client_ip`. Breaker-open nodes
    /// are skipped; selection falls back to any ready node.
    pub fn select(&self, client_ip: &str) -> Option<Backend> {
        match self.policy {
            LbPolicy::RoundRobin | LbPolicy::WeightedRoundRobin | LbPolicy::IpHash => {
                self.select_hashed(client_ip)
            }
            LbPolicy::LeastConnections => self.select_by(|g| g.active.load(Ordering::Relaxed) as u64),
            LbPolicy::LeastResponseTime => {
                self.select_by(|g| g.ewma_micros.load(Ordering::Relaxed))
            }
        }
    }

    fn select_hashed(&self, key: &str) -> Option<Backend> {
        // A second attempt with a perturbed key steps past a breaker-open
        // node picked by the ring.
        for attempt in 0..4u32 {
            let salted = format!("{key}#{attempt}");
            let backend = match &self.lb {
                SelectionLB::RoundRobin(lb) => lb.upstreams.select(salted.as_bytes(), 256),
                SelectionLB::Ketama(lb) => lb.upstreams.select(salted.as_bytes(), 256),
            }?;
            if !self.breaker_open(&backend.addr.to_string()) {
                return Some(backend);
            }
        }
        None
    }

    fn select_by<F>(&self, load: F) -> Option<Backend>
    where
        F: Fn(&NodeGauges) -> u64,
    {
        let backends = match &self.lb {
            SelectionLB::RoundRobin(lb) => lb.upstreams.backends().get_backend(),
            SelectionLB::Ketama(lb) => lb.upstreams.backends().get_backend(),
        };
        let ready = |backend: &Backend| match &self.lb {
            SelectionLB::RoundRobin(lb) => lb.upstreams.backends().ready(backend),
            SelectionLB::Ketama(lb) => lb.upstreams.backends().ready(backend),
        };

        backends
            .iter()
            .filter(|backend| ready(backend))
            .filter(|backend| !self.breaker_open(&backend.addr.to_string()))
            .min_by_key(|backend| load(&self.gauges_for(&backend.addr.to_string())))
            .cloned()
    }

    /// Resolves the peer carried by a selected backend.
    pub fn peer_of(&self, backend: &mut Backend) -> Option<Box<HttpPeer>> {
        backend.ext.get_mut::<HttpPeer>().map(|p| Box::new(p.clone()))
    }

    pub fn connection_opened(&self, addr: &str) {
        self.gauges_for(addr).active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, addr: &str) {
        let gauges = self.gauges_for(addr);
        let _ = gauges
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Feeds a request outcome into the latency gauge and the breaker.
    pub fn report(&self, addr: &str, latency: Option<Duration>, ok: bool) {
        let gauges = self.gauges_for(addr);

        if let Some(latency) = latency {
            let sample = latency.as_micros() as u64;
            let previous = gauges.ewma_micros.load(Ordering::Relaxed);
            let next = if previous == 0 {
                sample
            } else {
                // EWMA with alpha 1/8.
                previous - previous / 8 + sample / 8
            };
            gauges.ewma_micros.store(next, Ordering::Relaxed);
        }

        let Some(breaker) = &self.breaker else {
            return;
        };
        if ok {
            gauges.breaker_failures.store(0, Ordering::Relaxed);
            return;
        }
        let failures = gauges.breaker_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= breaker.failure_threshold {
            let until = millis_now() + breaker.open_secs * 1000;
            gauges
                .breaker_open_until_millis
                .store(until, Ordering::Relaxed);
            gauges.breaker_failures.store(0, Ordering::Relaxed);
            log::warn!("circuit breaker opened for upstream {addr} ({}s)", breaker.open_secs);
        }
    }

    fn stop_health_check(&mut self) {
        if let Some(tx) = self.watch.take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for UpstreamPool {
    fn drop(&mut self) {
        self.stop_health_check();
    }
}

fn millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
