//! Configuration registry and readiness signal.
//!
//! The merged configuration and the process-wide system state are published
//! as one immutable snapshot behind an atomic swap: readers load a snapshot
//! reference that stays consistent for the duration of the read, and
//! updates replace the whole snapshot. The readiness flag gates traffic
//! acceptance until every component reports initialized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::Notify;

use super::Config;

/// Process-wide identity and mode.
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub alias: String,
    pub name: String,
    pub version: String,
    pub port: u16,
    pub environment: String,
}

impl SystemState {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Environment variable carrying the environment mode.
pub const ENVIRONMENT_ENV: &str = "XYPRISS_ENV";

/// Resolves the environment mode; defaults to `development`.
pub fn environment_mode() -> String {
    std::env::var(ENVIRONMENT_ENV).unwrap_or_else(|_| "development".to_string())
}

/// One immutable view of configuration plus system state.
pub struct ConfigSnapshot {
    pub config: Arc<Config>,
    pub system: SystemState,
}

pub struct ConfigRegistry {
    snapshot: ArcSwap<ConfigSnapshot>,
    ready: AtomicBool,
    ready_notify: Notify,
}

impl ConfigRegistry {
    pub fn new(config: Config) -> Self {
        let system = SystemState {
            alias: "xypriss".to_string(),
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            port: config.server.port,
            environment: environment_mode(),
        };
        Self {
            snapshot: ArcSwap::from_pointee(ConfigSnapshot {
                config: Arc::new(config),
                system,
            }),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
        }
    }

    /// Current snapshot; valid and consistent for as long as it is held.
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    /// Replaces the configuration atomically, keeping the system state.
    pub fn set_config(&self, config: Config) {
        let current = self.snapshot.load();
        self.snapshot.store(Arc::new(ConfigSnapshot {
            config: Arc::new(config),
            system: current.system.clone(),
        }));
    }

    /// Mutates the system state through an atomic snapshot replacement.
    pub fn update_system<F>(&self, update: F)
    where
        F: FnOnce(&mut SystemState),
    {
        let current = self.snapshot.load();
        let mut system = current.system.clone();
        update(&mut system);
        self.snapshot.store(Arc::new(ConfigSnapshot {
            config: current.config.clone(),
            system,
        }));
    }

    /// Marks the runtime ready to accept traffic.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.ready_notify.notify_waiters();
        log::info!("runtime components initialized, accepting traffic");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Suspends until [`mark_ready`](Self::mark_ready) was called.
    pub async fn wait_for_ready(&self) {
        while !self.is_ready() {
            let notified = self.ready_notify.notified();
            if self.is_ready() {
                break;
            }
            notified.await;
        }
    }
}
