//! Application assembly.
//!
//! Builds every runtime component from the merged configuration, wires the
//! built-in admin endpoints and ultra-fast templates, resolves the bind
//! port through the port manager, and drives the pingora server - directly,
//! or under the cluster supervisor when clustering is enabled.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use serde_json::json;

use crate::cache::backend::RedisBackend;
use crate::cache::{CacheStrategy, SecureCache};
use crate::classify::RequestClassifier;
use crate::cluster::worker::{MasterMessage, WorkerRuntime};
use crate::cluster::ClusterSupervisor;
use crate::config::registry::ConfigRegistry;
use crate::config::Config;
use crate::core::{Request, Response, XyPrissError, XyResult};
use crate::crypto::{CryptoProvider, DefaultCryptoProvider};
use crate::dispatch::limits::ConcurrencyController;
use crate::dispatch::Dispatcher;
use crate::middleware::security::{
    BruteForceMiddleware, BruteForceOptions, CorsMiddleware, CorsOptions, JwtAuthMiddleware,
    JwtOptions, SecurityHeadersMiddleware, XssProtectionMiddleware,
};
use crate::middleware::{MiddlewareChain, Priority, RegisterOptions};
use crate::network::{CompressionPlugin, NetworkPlugins, RateLimitPlugin, UpstreamPool};
use crate::plugins::{Hook, PluginEngine};
use crate::port::PortManager;
use crate::router::{HandlerFn, Pattern, RouteTable};
use crate::service::http::AppHttpService;
use crate::service::proxy::ProxyService;

/// Mount prefix for the built-in admin endpoints.
const ADMIN_PREFIX: &str = "/XyPriss";

/// The assembled application: one of each core component.
pub struct AppContext {
    pub registry: Arc<ConfigRegistry>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub cache: Arc<SecureCache>,
    pub chain: Arc<MiddlewareChain>,
    pub routes: Arc<RouteTable>,
    pub classifier: Arc<RequestClassifier>,
    pub plugins: Arc<PluginEngine>,
    pub network: Arc<NetworkPlugins>,
    pub dispatcher: Arc<Dispatcher>,
    pub port_manager: PortManager,
    proxy_pool: Option<Arc<UpstreamPool>>,
    started_at: Instant,
}

impl AppContext {
    /// Builds all components from configuration. No I/O happens here; call
    /// [`init`](Self::init) before accepting traffic.
    pub fn from_config(config: Config) -> XyResult<Arc<Self>> {
        let registry = Arc::new(ConfigRegistry::new(config));
        let snapshot = registry.load();
        let config = snapshot.config.clone();
        let production = snapshot.system.is_production();

        let crypto: Arc<dyn CryptoProvider> = Arc::new(DefaultCryptoProvider::new());

        let cache_options = config.cache.to_options(production);
        let cache = match (&config.cache.strategy, &config.cache.redis) {
            (CacheStrategy::Memory, _) | (_, None) => {
                Arc::new(SecureCache::new(cache_options, crypto.clone())?)
            }
            (_, Some(redis)) => {
                let backend = Arc::new(RedisBackend::new(&redis.url())?);
                Arc::new(SecureCache::with_backend(
                    cache_options,
                    crypto.clone(),
                    backend,
                )?)
            }
        };

        let chain = Arc::new(MiddlewareChain::new());
        Self::register_security_middleware(&chain, config.as_ref(), &cache)?;

        let routes = Arc::new(RouteTable::new());
        let classifier = Arc::new(RequestClassifier::new());
        let plugins = Arc::new(PluginEngine::new());

        let rate_limit_options = config.network.rate_limit.to_options();
        let network = Arc::new(NetworkPlugins {
            connection: config.network.connection.clone(),
            compression: config
                .network
                .compression
                .enabled
                .then(|| Arc::new(CompressionPlugin::new(config.network.compression.to_options()))),
            rate_limit: rate_limit_options.enabled.then(|| {
                Arc::new(RateLimitPlugin::new(
                    rate_limit_options.clone(),
                    Some(cache.clone()),
                ))
            }),
        });

        let proxy_pool = if config.network.proxy.enabled {
            let mut pool = UpstreamPool::new(config.network.proxy.to_options())?;
            pool.start_health_check(config.pingora.work_stealing);
            Some(Arc::new(pool))
        } else {
            None
        };

        let limits =
            ConcurrencyController::new(config.request_management.concurrency.to_options());
        let dispatcher = Arc::new(Dispatcher::new(
            classifier.clone(),
            chain.clone(),
            routes.clone(),
            cache.clone(),
            plugins.clone(),
            network.clone(),
            limits,
            config.request_management.timeout.to_options(),
            config
                .request_management
                .payload
                .to_options(&config.server),
        ));

        let port_manager = PortManager::new(
            config.server.host.clone(),
            config.server.auto_port_switch.to_options(),
        );

        let context = Arc::new(Self {
            registry,
            crypto,
            cache,
            chain,
            routes,
            classifier,
            plugins,
            network,
            dispatcher,
            port_manager,
            proxy_pool,
            started_at: Instant::now(),
        });
        context.register_admin_routes()?;
        Ok(context)
    }

    fn register_security_middleware(
        chain: &Arc<MiddlewareChain>,
        config: &Config,
        cache: &Arc<SecureCache>,
    ) -> XyResult<()> {
        let security = &config.security;
        if security.cors {
            chain.register(
                Arc::new(CorsMiddleware::new(CorsOptions::default())),
                RegisterOptions {
                    id: Some("cors".to_string()),
                    priority: Priority::Critical,
                    fast_safe: true,
                    ..Default::default()
                },
            )?;
        }
        if security.helmet {
            chain.register(
                Arc::new(SecurityHeadersMiddleware),
                RegisterOptions {
                    id: Some("security-headers".to_string()),
                    priority: Priority::Critical,
                    fast_safe: true,
                    ..Default::default()
                },
            )?;
        }
        if security.xss {
            chain.register(
                Arc::new(XssProtectionMiddleware),
                RegisterOptions {
                    id: Some("xss-protection".to_string()),
                    priority: Priority::Critical,
                    fast_safe: true,
                    ..Default::default()
                },
            )?;
        }
        if security.brute_force {
            chain.register(
                Arc::new(BruteForceMiddleware::new(
                    cache.clone(),
                    BruteForceOptions::default(),
                )),
                RegisterOptions {
                    id: Some("brute-force".to_string()),
                    priority: Priority::High,
                    ..Default::default()
                },
            )?;
        }
        if let Some(jwt) = &security.authentication.jwt {
            chain.register(
                Arc::new(JwtAuthMiddleware::new(JwtOptions {
                    secret: jwt.secret.clone(),
                    expose_claims: true,
                })),
                RegisterOptions {
                    id: Some("jwt-auth".to_string()),
                    priority: Priority::High,
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    /// Mounts `/XyPriss/{health,status,ping}`, all ultra-fast cached.
    fn register_admin_routes(self: &Arc<Self>) -> XyResult<()> {
        let health_path = format!("{ADMIN_PREFIX}/health");
        let status_path = format!("{ADMIN_PREFIX}/status");
        let ping_path = format!("{ADMIN_PREFIX}/ping");

        for path in [&health_path, &status_path, &ping_path] {
            self.classifier.register_template(path)?;
        }

        let registry = self.registry.clone();
        let started_at = self.started_at;
        self.routes.add(
            "GET",
            Pattern::Path(health_path),
            Vec::new(),
            Arc::new(HandlerFn(move |_req: &mut Request, res: &mut Response| {
                let snapshot = registry.load();
                let system = &snapshot.system;
                res.send_json(&json!({
                    "status": "ok",
                    "timestamp": unix_millis(),
                    "service": system.name,
                    "version": system.version,
                    "environment": system.environment,
                    "uptime": started_at.elapsed().as_secs(),
                    "cached": true,
                }));
                Ok(())
            })),
        )?;

        let context = Arc::downgrade(self);
        self.routes.add(
            "GET",
            Pattern::Path(status_path),
            Vec::new(),
            Arc::new(HandlerFn(move |_req: &mut Request, res: &mut Response| {
                let Some(context) = context.upgrade() else {
                    return Err(XyPrissError::Internal("runtime shut down".to_string()));
                };
                let snapshot = context.registry.load();
                let system = &snapshot.system;
                res.send_json(&json!({
                    "status": "ok",
                    "service": system.name,
                    "version": system.version,
                    "environment": system.environment,
                    "port": system.port,
                    "uptime": context.started_at.elapsed().as_secs(),
                    "cache": {
                        "health": context.cache.get_health(),
                        "stats": context.cache.get_stats(),
                    },
                    "middleware": context.chain.list(),
                    "plugins": context.plugins.get_plugin_stats(),
                    "routes": context.routes.len(),
                }));
                Ok(())
            })),
        )?;

        self.routes.add(
            "GET",
            Pattern::Path(ping_path),
            Vec::new(),
            Arc::new(HandlerFn(|_req: &mut Request, res: &mut Response| {
                res.send_json(&json!({"pong": true, "timestamp": unix_millis()}));
                Ok(())
            })),
        )?;
        Ok(())
    }

    /// Resolves the effective bind port (auto-switch aware) and records it
    /// in the system state.
    pub fn resolve_bind(&self) -> XyResult<u16> {
        let desired = self.registry.load().config.server.port;
        let resolved = self.port_manager.resolve_port(desired)?;
        if resolved != desired {
            self.registry.update_system(|system| system.port = resolved);
        }
        Ok(resolved)
    }

    /// The port the application serves on.
    pub fn port(&self) -> u16 {
        self.registry.load().system.port
    }

    /// Brings up I/O-touching components and flips the readiness signal.
    /// The serving loop refuses traffic until this completes.
    pub async fn init(self: &Arc<Self>) -> XyResult<()> {
        if let Err(e) = self.cache.connect().await {
            log::warn!("cache distributed tier unavailable at startup: {e}");
        }
        self.cache.spawn_sweeper();

        self.plugins
            .invoke_hook(Hook::ServerStart, &json!({"port": self.port()}))
            .await;
        for route in self.routes.all() {
            self.plugins
                .invoke_hook(
                    Hook::RouteRegister,
                    &json!({"pattern": route.pattern_text}),
                )
                .await;
        }

        self.registry.mark_ready();
        Ok(())
    }

    /// Graceful teardown: server-stop hooks and cache disconnect.
    pub async fn shutdown(self: &Arc<Self>) {
        self.plugins
            .invoke_hook(Hook::ServerStop, &json!({"port": self.port()}))
            .await;
        if let Err(e) = self.cache.disconnect().await {
            log::debug!("cache disconnect: {e}");
        }
    }

    /// Runs the serving process: binds the listener (or the proxy service)
    /// on the resolved port and hands control to the pingora server. Does
    /// not return.
    pub fn run(self: Arc<Self>, opt: Opt) -> XyResult<()> {
        let is_worker = WorkerRuntime::is_worker_process();
        // Workers bind the address the supervisor assigned; it is already
        // held by their peers through the listener's port sharing, so the
        // availability probe only runs on the master.
        let bind_port = if is_worker {
            self.registry.load().config.server.port
        } else {
            self.resolve_bind()?
        };
        let snapshot = self.registry.load();
        let config = snapshot.config.clone();
        let bind_addr = format!("{}:{bind_port}", config.server.host);

        let cluster_enabled = config.cluster.enabled;

        // Component init runs on a scratch runtime before pingora takes the
        // process over; the first listening loop awaits readiness.
        let init_runtime = tokio::runtime::Runtime::new()
            .map_err(|e| XyPrissError::Internal(format!("init runtime: {e}")))?;
        init_runtime.block_on(async { self.init().await })?;

        if is_worker {
            // Workers heartbeat to the supervisor and honor drain requests.
            let dispatcher = self.dispatcher.clone();
            let limits = dispatcher.limits.clone();
            init_runtime.spawn(async move {
                let mut runtime = WorkerRuntime::install(Duration::from_secs(2), move || {
                    dispatcher.limits.in_flight() as u32
                });
                while let Some(message) = runtime.messages.recv().await {
                    match message {
                        MasterMessage::Broadcast { payload } => {
                            log::info!("cluster broadcast: {payload}");
                        }
                        MasterMessage::Drain { grace_secs } => {
                            log::info!("drain requested, finishing in-flight within {grace_secs}s");
                            let deadline =
                                tokio::time::Instant::now() + Duration::from_secs(grace_secs);
                            while limits.in_flight() > 0 && tokio::time::Instant::now() < deadline
                            {
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                            std::process::exit(0);
                        }
                        MasterMessage::Shutdown => std::process::exit(0),
                    }
                }
            });
        }

        let mut master_serves = true;
        if !is_worker && cluster_enabled {
            // Master: supervise the worker fleet, optionally serving as a
            // peer worker itself.
            let cluster_options = config.cluster.config.to_options();
            master_serves = cluster_options.master_serves;
            let supervisor = ClusterSupervisor::new(bind_port, cluster_options);
            init_runtime.block_on(async { supervisor.start_cluster().await })?;
            // The supervisor tasks live on this runtime for the process
            // lifetime.
            std::mem::forget(supervisor);
        }
        std::mem::forget(init_runtime);

        let mut server = Server::new_with_opt_and_conf(Some(opt), clone_server_conf(&config.pingora));
        server.bootstrap();

        match self.proxy_pool.as_ref().filter(|_| master_serves) {
            Some(pool) => {
                log::info!("starting in reverse-proxy mode on {bind_addr}");
                let proxy = ProxyService::new(pool.clone(), self.network.rate_limit.clone());
                let mut service = pingora_proxy::http_proxy_service_with_name(
                    &server.configuration,
                    proxy,
                    "XyPriss Proxy",
                );
                service.add_tcp(&bind_addr);
                server.add_service(service);
            }
            None if master_serves => {
                log::info!("starting application server on {bind_addr}");
                let keepalive = config.network.connection.keep_alive.timeout_secs;
                let app =
                    AppHttpService::new(self.dispatcher.clone(), self.registry.clone(), keepalive);
                server.add_service(app.listening_service(&bind_addr));
            }
            None => log::info!("master supervising only; workers serve {bind_addr}"),
        }

        log::info!("bootstrapped, starting server on port {bind_port}");
        server.run_forever();
    }
}

// ServerConf is rebuilt through its serde form; the original stays inside
// the shared config snapshot.
fn clone_server_conf(
    conf: &pingora_core::server::configuration::ServerConf,
) -> pingora_core::server::configuration::ServerConf {
    serde_yaml::to_string(conf)
        .ok()
        .and_then(|s| serde_yaml::from_str(&s).ok())
        .unwrap_or_default()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};
    use serde_json::Value as JsonValue;

    fn context() -> Arc<AppContext> {
        AppContext::from_config(Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_admin_health_endpoint() {
        let app = context();
        let res = app
            .dispatcher
            .dispatch(Request::from_parts(Method::GET, "/XyPriss/health"))
            .await;
        assert_eq!(res.status, StatusCode::OK);
        let body: JsonValue = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "xypriss");
        assert_eq!(body["cached"], true);
        assert!(body["timestamp"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_admin_endpoints_are_ultra_fast_cached() {
        let app = context();
        let cold = app
            .dispatcher
            .dispatch(Request::from_parts(Method::GET, "/XyPriss/ping"))
            .await;
        assert_eq!(cold.headers.get("x-cache").unwrap(), "MISS");

        let warm = app
            .dispatcher
            .dispatch(Request::from_parts(Method::GET, "/XyPriss/ping"))
            .await;
        assert_eq!(warm.headers.get("x-cache").unwrap(), "HIT");
        // The cached body is bitwise identical: the timestamp froze at
        // warm-up.
        assert_eq!(cold.body(), warm.body());
    }

    #[tokio::test]
    async fn test_admin_status_aggregates_components() {
        let app = context();
        let res = app
            .dispatcher
            .dispatch(Request::from_parts(Method::GET, "/XyPriss/status"))
            .await;
        let body: JsonValue = serde_json::from_slice(res.body()).unwrap();
        assert!(body["cache"]["health"]["status"].is_string());
        assert!(body["routes"].as_u64().unwrap() >= 3);
    }

    #[tokio::test]
    async fn test_auto_port_switch_scenario() {
        // Occupy a port, then ask the app for exactly that port with
        // increment auto-switch.
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = blocker.local_addr().unwrap().port();

        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = busy_port;
        config.server.auto_port_switch.enabled = true;
        config.server.auto_port_switch.max_attempts = 3;

        let app = AppContext::from_config(config).unwrap();
        let switches = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let switches_clone = switches.clone();
        app.port_manager.on_port_switch(move |original, switched| {
            assert_eq!(original, busy_port);
            assert!(switched > original);
            switches_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let resolved = app.resolve_bind().unwrap();
        assert!(resolved > busy_port && resolved <= busy_port + 3);
        assert_eq!(app.port(), resolved);
        assert_eq!(switches.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_security_middleware_from_config() {
        let mut config = Config::default();
        config.security.cors = true;
        config.security.helmet = true;
        let app = AppContext::from_config(config).unwrap();

        let entries = app.chain.list();
        assert!(entries.iter().any(|e| e.id == "cors"));
        assert!(entries.iter().any(|e| e.id == "security-headers"));
        assert!(!entries.iter().any(|e| e.id == "jwt-auth"));

        let res = app
            .dispatcher
            .dispatch(Request::from_parts(Method::GET, "/XyPriss/ping"))
            .await;
        assert!(res.headers.contains_key("x-content-type-options"));
    }

    #[tokio::test]
    async fn test_init_marks_ready_and_fires_hooks() {
        use crate::plugins::{Plugin, PluginPolicy};

        struct StartTracker(Arc<std::sync::atomic::AtomicU32>);
        #[async_trait::async_trait]
        impl Plugin for StartTracker {
            fn id(&self) -> &str {
                "start-tracker"
            }
            async fn on_hook(&self, hook: Hook, _payload: &JsonValue) -> XyResult<()> {
                if hook == Hook::ServerStart {
                    self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                Ok(())
            }
        }

        let app = context();
        let started = Arc::new(std::sync::atomic::AtomicU32::new(0));
        app.plugins
            .register(
                Arc::new(StartTracker(started.clone())),
                PluginPolicy::default(),
            )
            .await
            .unwrap();

        assert!(!app.registry.is_ready());
        app.init().await.unwrap();
        assert!(app.registry.is_ready());
        assert_eq!(started.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
