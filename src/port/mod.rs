//! Port availability probing and auto-switch.
//!
//! The availability probe is a bind-and-release on the candidate address;
//! an address-in-use error means "unavailable" and every other error
//! propagates. When auto-switch is enabled, exhausting the candidate list
//! raises [`XyPrissError::PortExhaustion`] carrying the attempted ports.

pub mod redirect;

use std::net::TcpListener;
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{XyPrissError, XyResult};

/// Candidate-selection strategy when the desired port is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SwitchStrategy {
    #[default]
    Increment,
    Random,
    Predefined,
}

/// Auto-switch configuration.
#[derive(Debug, Clone)]
pub struct PortSwitchOptions {
    pub enabled: bool,
    pub strategy: SwitchStrategy,
    pub max_attempts: u32,
    /// Inclusive bounds for increment/random search.
    pub port_range: Option<(u16, u16)>,
    pub predefined_ports: Vec<u16>,
}

impl Default for PortSwitchOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: SwitchStrategy::Increment,
            max_attempts: 10,
            port_range: None,
            predefined_ports: Vec::new(),
        }
    }
}

/// Host-provided process table access used by force-close. The core only
/// consumes this capability; the default inspector has no process table and
/// reports every lookup as unresolvable.
pub trait ProcessInspector: Send + Sync {
    /// Pid of the process bound to `port`, if resolvable.
    fn pid_holding_port(&self, port: u16) -> Option<u32>;
    /// Signals the process; true when the signal was delivered.
    fn terminate(&self, pid: u32) -> bool;
}

/// Inspector used when the host exposes no process table.
pub struct NullProcessInspector;

impl ProcessInspector for NullProcessInspector {
    fn pid_holding_port(&self, _port: u16) -> Option<u32> {
        None
    }

    fn terminate(&self, _pid: u32) -> bool {
        false
    }
}

type SwitchCallback = Box<dyn Fn(u16, u16) + Send + Sync>;

pub struct PortManager {
    host: String,
    options: PortSwitchOptions,
    inspector: Box<dyn ProcessInspector>,
    on_switch: Mutex<Option<SwitchCallback>>,
}

impl PortManager {
    pub fn new(host: impl Into<String>, options: PortSwitchOptions) -> Self {
        Self {
            host: host.into(),
            options,
            inspector: Box::new(NullProcessInspector),
            on_switch: Mutex::new(None),
        }
    }

    pub fn with_inspector(mut self, inspector: Box<dyn ProcessInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Registers the `on_port_switch(original, new)` callback.
    pub fn on_port_switch<F>(&self, callback: F)
    where
        F: Fn(u16, u16) + Send + Sync + 'static,
    {
        *self.on_switch.lock().unwrap() = Some(Box::new(callback));
    }

    /// Bind-and-release availability probe.
    pub fn is_available(&self, port: u16) -> XyResult<bool> {
        match TcpListener::bind((self.host.as_str(), port)) {
            Ok(listener) => {
                drop(listener);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Ok(false),
            Err(e) => Err(XyPrissError::Bind(format!(
                "probe of {}:{port} failed: {e}",
                self.host
            ))),
        }
    }

    /// Resolves the port to bind: the desired port when free, otherwise the
    /// first available candidate of the configured strategy. Fires the
    /// switch callback when a different port is chosen.
    pub fn resolve_port(&self, desired: u16) -> XyResult<u16> {
        if self.is_available(desired)? {
            return Ok(desired);
        }
        if !self.options.enabled {
            return Err(XyPrissError::Bind(format!(
                "port {desired} is in use and auto-switch is disabled"
            )));
        }

        let mut attempted = vec![desired];
        for candidate in self.candidates(desired) {
            if attempted.contains(&candidate) {
                continue;
            }
            attempted.push(candidate);
            if self.is_available(candidate)? {
                log::info!("port {desired} busy, switching to {candidate}");
                if let Some(callback) = self.on_switch.lock().unwrap().as_ref() {
                    callback(desired, candidate);
                }
                return Ok(candidate);
            }
            if attempted.len() > self.options.max_attempts as usize {
                break;
            }
        }
        Err(XyPrissError::PortExhaustion(attempted))
    }

    fn candidates(&self, desired: u16) -> Vec<u16> {
        let max = self.options.max_attempts as usize;
        match self.options.strategy {
            SwitchStrategy::Increment => {
                let (lo, hi) = self.options.port_range.unwrap_or((desired, u16::MAX));
                (1..=max as u16)
                    .filter_map(|offset| desired.checked_add(offset))
                    .filter(|p| *p >= lo && *p <= hi)
                    .collect()
            }
            SwitchStrategy::Random => {
                let (lo, hi) = self
                    .options
                    .port_range
                    .unwrap_or((49152, 65535));
                let mut rng = rand::thread_rng();
                (0..max).map(|_| rng.gen_range(lo..=hi)).collect()
            }
            SwitchStrategy::Predefined => self.options.predefined_ports.clone(),
        }
    }

    /// Best-effort close of whatever process holds `port`: resolve the pid
    /// through the host process table, signal it, and verify with a probe.
    pub fn force_close(&self, port: u16) -> bool {
        let Some(pid) = self.inspector.pid_holding_port(port) else {
            log::debug!("force-close: no process resolvable for port {port}");
            return false;
        };
        if !self.inspector.terminate(pid) {
            return false;
        }
        // Follow-up probe confirms the release.
        std::thread::sleep(std::time::Duration::from_millis(100));
        self.is_available(port).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager(options: PortSwitchOptions) -> PortManager {
        PortManager::new("127.0.0.1", options)
    }

    /// Binds an ephemeral listener and returns it with its port.
    fn occupy() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_probe_reports_occupancy() {
        let (listener, port) = occupy();
        let pm = manager(PortSwitchOptions::default());
        assert!(!pm.is_available(port).unwrap());
        drop(listener);
        assert!(pm.is_available(port).unwrap());
    }

    #[test]
    fn test_free_port_is_kept() {
        let (listener, port) = occupy();
        drop(listener);
        let pm = manager(PortSwitchOptions::default());
        assert_eq!(pm.resolve_port(port).unwrap(), port);
    }

    #[test]
    fn test_disabled_auto_switch_fails() {
        let (_listener, port) = occupy();
        let pm = manager(PortSwitchOptions::default());
        let err = pm.resolve_port(port).unwrap_err();
        assert!(matches!(err, XyPrissError::Bind(_)));
    }

    #[test]
    fn test_increment_switch_fires_callback_once() {
        let (_listener, port) = occupy();
        let pm = manager(PortSwitchOptions {
            enabled: true,
            max_attempts: 3,
            ..Default::default()
        });
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        pm.on_port_switch(move |original, switched| {
            assert_eq!(original, port);
            assert!(switched > original);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let resolved = pm.resolve_port(port).unwrap();
        assert!(resolved > port && resolved <= port + 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_predefined_strategy() {
        let (_busy, busy_port) = occupy();
        let (free_probe, free_port) = occupy();
        drop(free_probe);

        let pm = manager(PortSwitchOptions {
            enabled: true,
            strategy: SwitchStrategy::Predefined,
            predefined_ports: vec![busy_port, free_port],
            ..Default::default()
        });
        // Desired port is also busy, so the predefined list is walked.
        assert_eq!(pm.resolve_port(busy_port).unwrap(), free_port);
    }

    #[test]
    fn test_exhaustion_carries_attempts() {
        let (_busy, busy_port) = occupy();
        let pm = manager(PortSwitchOptions {
            enabled: true,
            strategy: SwitchStrategy::Predefined,
            predefined_ports: vec![],
            ..Default::default()
        });
        match pm.resolve_port(busy_port).unwrap_err() {
            XyPrissError::PortExhaustion(attempted) => {
                assert_eq!(attempted, vec![busy_port]);
            }
            other => panic!("expected PortExhaustion, got {other}"),
        }
    }

    #[test]
    fn test_random_respects_range() {
        let pm = manager(PortSwitchOptions {
            enabled: true,
            strategy: SwitchStrategy::Random,
            port_range: Some((50000, 50010)),
            max_attempts: 5,
            ..Default::default()
        });
        for candidate in pm.candidates(50000) {
            assert!((50000..=50010).contains(&candidate));
        }
    }

    struct StubInspector {
        pid: Option<u32>,
        terminated: AtomicU32,
    }

    impl ProcessInspector for StubInspector {
        fn pid_holding_port(&self, _port: u16) -> Option<u32> {
            self.pid
        }

        fn terminate(&self, _pid: u32) -> bool {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_force_close_unresolvable_returns_false() {
        let pm = manager(PortSwitchOptions::default());
        assert!(!pm.force_close(65535));
    }

    #[test]
    fn test_force_close_with_inspector() {
        let (listener, port) = occupy();
        drop(listener);
        // The stub "terminates" a fictional pid; the port is already free,
        // so the follow-up probe confirms the close.
        let pm = manager(PortSwitchOptions::default()).with_inspector(Box::new(StubInspector {
            pid: Some(4242),
            terminated: AtomicU32::new(0),
        }));
        assert!(pm.force_close(port));
    }
}
