//! Cluster supervision.
//!
//! One master process supervises N worker processes that share the listen
//! address. The supervisor restarts crashed workers within a bounded
//! restart budget, watches heartbeats, scales the fleet up and down with
//! graceful drains, performs rolling restarts (including debounced
//! file-watch reloads), and relays broadcasts over per-worker IPC.

pub mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, watch};

use crate::core::{XyPrissError, XyResult};

use worker::{
    HealthState, MasterMessage, WorkerCommand, WorkerEvent, WorkerHandle, WorkerMessage,
    WorkerSnapshot, WorkerStatus,
};

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Worker count; defaults to `max(1, cpu_count)`.
    pub workers: Option<usize>,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Restart budget within [`restart_window`](Self::restart_window).
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// Graceful drain deadline before a hard kill.
    pub grace_period: Duration,
    /// Heartbeat silence that marks a worker unhealthy.
    pub heartbeat_timeout: Duration,
    /// Supervision loop tick.
    pub check_interval: Duration,
    /// Debounce for file-watch reload bursts.
    pub watch_debounce: Duration,
    /// Pause between replacements in a rolling restart; also scales the
    /// hard-shutdown budget for file-watch reloads.
    pub restart_delay: Duration,
    /// Whether the master also accepts connections as a peer worker.
    pub master_serves: bool,
    pub command: WorkerCommand,
    /// Auto-scale: sustained per-worker in-flight above this adds a worker.
    pub high_water_in_flight: u32,
    /// Auto-scale: sustained per-worker in-flight below this removes one.
    pub low_water_in_flight: u32,
    pub scale_up_sustain: Duration,
    pub scale_down_sustain: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            workers: None,
            min_workers: 1,
            max_workers: 16,
            max_restarts: 10,
            restart_window: Duration::from_secs(600),
            grace_period: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(6),
            check_interval: Duration::from_secs(1),
            watch_debounce: Duration::from_millis(300),
            restart_delay: Duration::from_secs(1),
            master_serves: true,
            command: WorkerCommand::CurrentExe,
            high_water_in_flight: 64,
            low_water_in_flight: 4,
            scale_up_sustain: Duration::from_secs(10),
            scale_down_sustain: Duration::from_secs(60),
        }
    }
}

/// Supervisor notifications, observable through
/// [`ClusterSupervisor::subscribe`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    WorkerStarted { id: u32, restart_count: u32 },
    WorkerExited { id: u32 },
    WorkerRestarted { id: u32, replacement: u32, restart_count: u32 },
    WorkerUnhealthy { id: u32 },
    CriticalIssue { reason: String },
    ScaledUp { workers: usize },
    ScaledDown { workers: usize },
    RollingRestart,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterMetrics {
    pub workers: usize,
    pub running: usize,
    pub unhealthy: usize,
    pub total_in_flight: u32,
    pub restarts_in_window: usize,
    pub auto_restart_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Healthy,
    Degraded,
    Critical,
}

pub struct ClusterSupervisor {
    options: ClusterOptions,
    port: u16,
    workers: Mutex<Vec<Arc<WorkerHandle>>>,
    next_worker_id: AtomicU32,
    restarts: Mutex<VecDeque<Instant>>,
    auto_restart_enabled: AtomicBool,
    events: broadcast::Sender<ClusterEvent>,
    worker_events_tx: mpsc::UnboundedSender<WorkerEvent>,
    worker_events_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    watch_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    load_above_since: Mutex<Option<Instant>>,
    load_below_since: Mutex<Option<Instant>>,
}

impl ClusterSupervisor {
    pub fn new(port: u16, options: ClusterOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (worker_events_tx, worker_events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            options,
            port,
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicU32::new(1),
            restarts: Mutex::new(VecDeque::new()),
            auto_restart_enabled: AtomicBool::new(true),
            events,
            worker_events_tx,
            worker_events_rx: Mutex::new(Some(worker_events_rx)),
            shutdown_tx,
            watch_tx: Mutex::new(None),
            load_above_since: Mutex::new(None),
            load_below_since: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClusterEvent) {
        let _ = self.events.send(event);
    }

    /// Spawns the initial fleet and the supervision tasks.
    pub async fn start_cluster(self: &Arc<Self>) -> XyResult<()> {
        let target = self
            .options
            .workers
            .unwrap_or_else(|| num_cpus::get().max(1));
        for _ in 0..target {
            self.spawn_worker(0)?;
        }

        self.spawn_event_pump();
        self.spawn_supervision_loop();
        self.spawn_watch_task();
        log::info!("cluster started with {target} workers on port {}", self.port);
        Ok(())
    }

    fn spawn_worker(&self, restart_count: u32) -> XyResult<Arc<WorkerHandle>> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(WorkerHandle::spawn(
            id,
            self.port,
            restart_count,
            &self.options.command,
            self.worker_events_tx.clone(),
        )?);
        self.workers.lock().unwrap().push(handle.clone());
        self.emit(ClusterEvent::WorkerStarted { id, restart_count });
        Ok(handle)
    }

    fn worker_by_id(&self, id: u32) -> Option<Arc<WorkerHandle>> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.id == id)
            .cloned()
    }

    fn remove_worker(&self, id: u32) {
        self.workers.lock().unwrap().retain(|w| w.id != id);
    }

    /// Routes worker stdout messages into handle state.
    fn spawn_event_pump(self: &Arc<Self>) {
        let Some(mut rx) = self.worker_events_rx.lock().unwrap().take() else {
            return;
        };
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(supervisor) = supervisor.upgrade() else { break };
                if let Some(worker) = supervisor.worker_by_id(event.worker_id) {
                    match event.message {
                        WorkerMessage::Ready { .. } => worker.set_status(WorkerStatus::Running),
                        WorkerMessage::Heartbeat { in_flight } => worker.note_heartbeat(in_flight),
                    }
                }
            }
        });
    }

    fn spawn_supervision_loop(self: &Arc<Self>) {
        let supervisor = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let check_interval = self.options.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(supervisor) = supervisor.upgrade() else { break };
                        supervisor.supervise_once().await;
                    }
                }
            }
        });
    }

    /// One supervision pass: exit detection, heartbeat checks, auto-scale.
    async fn supervise_once(self: &Arc<Self>) {
        let workers: Vec<Arc<WorkerHandle>> = self.workers.lock().unwrap().clone();

        for worker in &workers {
            match worker.status() {
                WorkerStatus::Stopping | WorkerStatus::Stopped => continue,
                _ => {}
            }

            if worker.has_exited().await {
                self.emit(ClusterEvent::WorkerExited { id: worker.id });
                self.remove_worker(worker.id);
                self.handle_unexpected_exit(worker).await;
                continue;
            }

            if worker.status() == WorkerStatus::Running
                && worker.heartbeat_age() > self.options.heartbeat_timeout
            {
                let failures = worker.note_health_failure();
                self.emit(ClusterEvent::WorkerUnhealthy { id: worker.id });
                if failures >= 2 {
                    log::warn!(
                        "worker {} heartbeat silent for {:?}, restarting",
                        worker.id,
                        worker.heartbeat_age()
                    );
                    worker.set_status(WorkerStatus::Failed);
                    worker.kill().await;
                    self.remove_worker(worker.id);
                    self.handle_unexpected_exit(worker).await;
                }
            }
        }

        self.auto_scale().await;
    }

    async fn handle_unexpected_exit(self: &Arc<Self>, worker: &Arc<WorkerHandle>) {
        if !self.auto_restart_enabled.load(Ordering::SeqCst) {
            return;
        }

        let now = Instant::now();
        {
            let mut restarts = self.restarts.lock().unwrap();
            while let Some(front) = restarts.front() {
                if now.duration_since(*front) > self.options.restart_window {
                    restarts.pop_front();
                } else {
                    break;
                }
            }
            if restarts.len() >= self.options.max_restarts as usize {
                self.auto_restart_enabled.store(false, Ordering::SeqCst);
                let reason = format!(
                    "worker {} exceeded {} restarts within {:?}; auto-restart disabled",
                    worker.id, self.options.max_restarts, self.options.restart_window
                );
                log::error!("{reason}");
                self.emit(ClusterEvent::CriticalIssue { reason });
                return;
            }
            restarts.push_back(now);
        }

        match self.spawn_worker(worker.restart_count + 1) {
            Ok(replacement) => {
                self.emit(ClusterEvent::WorkerRestarted {
                    id: worker.id,
                    replacement: replacement.id,
                    restart_count: replacement.restart_count,
                });
            }
            Err(e) => {
                log::error!("failed to respawn worker {}: {e}", worker.id);
                self.emit(ClusterEvent::CriticalIssue {
                    reason: format!("respawn failed: {e}"),
                });
            }
        }
    }

    /// Evaluates the load signal with hysteresis bounds.
    async fn auto_scale(self: &Arc<Self>) {
        let (count, total_in_flight) = {
            let workers = self.workers.lock().unwrap();
            let total: u32 = workers.iter().map(|w| w.in_flight()).sum();
            (workers.len(), total)
        };
        if count == 0 {
            return;
        }
        let per_worker = total_in_flight / count as u32;

        if per_worker >= self.options.high_water_in_flight && count < self.options.max_workers {
            let mut above = self.load_above_since.lock().unwrap();
            match *above {
                None => *above = Some(Instant::now()),
                Some(since) if since.elapsed() >= self.options.scale_up_sustain => {
                    *above = None;
                    drop(above);
                    let _ = self.scale_up(1).await;
                }
                Some(_) => {}
            }
        } else {
            *self.load_above_since.lock().unwrap() = None;
        }

        if per_worker <= self.options.low_water_in_flight && count > self.options.min_workers {
            let mut below = self.load_below_since.lock().unwrap();
            match *below {
                None => *below = Some(Instant::now()),
                Some(since) if since.elapsed() >= self.options.scale_down_sustain => {
                    *below = None;
                    drop(below);
                    let _ = self.scale_down(1).await;
                }
                Some(_) => {}
            }
        } else {
            *self.load_below_since.lock().unwrap() = None;
        }
    }

    /// Adds workers, bounded by `max_workers`.
    pub async fn scale_up(self: &Arc<Self>, count: usize) -> XyResult<usize> {
        let current = self.workers.lock().unwrap().len();
        let target = (current + count.max(1)).min(self.options.max_workers);
        for _ in current..target {
            self.spawn_worker(0)?;
        }
        if target > current {
            self.emit(ClusterEvent::ScaledUp { workers: target });
        }
        Ok(target)
    }

    /// Removes workers with a graceful drain, bounded by `min_workers`.
    pub async fn scale_down(self: &Arc<Self>, count: usize) -> XyResult<usize> {
        let victims: Vec<Arc<WorkerHandle>> = {
            let workers = self.workers.lock().unwrap();
            let current = workers.len();
            let target = current.saturating_sub(count.max(1)).max(self.options.min_workers);
            workers[target..].to_vec()
        };
        if victims.is_empty() {
            return Ok(self.workers.lock().unwrap().len());
        }

        for victim in &victims {
            victim.set_status(WorkerStatus::Stopping);
            self.remove_worker(victim.id);
        }

        let grace = self.options.grace_period;
        for victim in victims {
            let _ = victim
                .send(&MasterMessage::Drain {
                    grace_secs: grace.as_secs(),
                })
                .await;
            tokio::spawn(async move {
                let deadline = Instant::now() + grace;
                while Instant::now() < deadline {
                    if victim.has_exited().await {
                        victim.set_status(WorkerStatus::Stopped);
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                log::warn!("worker {} did not drain in time, killing", victim.id);
                victim.kill().await;
                victim.set_status(WorkerStatus::Stopped);
            });
        }

        let remaining = self.workers.lock().unwrap().len();
        self.emit(ClusterEvent::ScaledDown { workers: remaining });
        Ok(remaining)
    }

    /// Replaces every worker one at a time to preserve availability.
    pub async fn restart_cluster(self: &Arc<Self>) -> XyResult<()> {
        self.emit(ClusterEvent::RollingRestart);
        let old: Vec<Arc<WorkerHandle>> = self.workers.lock().unwrap().clone();

        for worker in old {
            let replacement = self.spawn_worker(0)?;
            tokio::time::sleep(self.options.restart_delay.min(Duration::from_secs(2))).await;

            if replacement.has_exited().await {
                self.remove_worker(replacement.id);
                self.emit(ClusterEvent::CriticalIssue {
                    reason: format!(
                        "replacement worker {} exited during rolling restart",
                        replacement.id
                    ),
                });
                return Err(XyPrissError::WorkerCrash(
                    "rolling restart replacement died".to_string(),
                ));
            }

            worker.set_status(WorkerStatus::Stopping);
            self.remove_worker(worker.id);
            let _ = worker
                .send(&MasterMessage::Drain {
                    grace_secs: self.options.grace_period.as_secs(),
                })
                .await;
            let grace = self.options.grace_period;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if !worker.has_exited().await {
                    worker.kill().await;
                }
            });
        }
        Ok(())
    }

    /// Best-effort delivery to every worker, ordered per worker.
    pub async fn broadcast_to_workers(&self, payload: JsonValue) -> usize {
        let workers: Vec<Arc<WorkerHandle>> = self.workers.lock().unwrap().clone();
        let mut delivered = 0;
        for worker in workers {
            if worker
                .send(&MasterMessage::Broadcast {
                    payload: payload.clone(),
                })
                .await
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn send_to_random_worker(&self, payload: JsonValue) -> XyResult<u32> {
        let worker = {
            let workers = self.workers.lock().unwrap();
            if workers.is_empty() {
                return Err(XyPrissError::Internal("no workers available".to_string()));
            }
            workers[rand::thread_rng().gen_range(0..workers.len())].clone()
        };
        worker
            .send(&MasterMessage::Broadcast { payload })
            .await
            .map(|()| worker.id)
    }

    pub fn get_all_workers(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.snapshot())
            .collect()
    }

    pub fn get_cluster_metrics(&self) -> ClusterMetrics {
        let workers = self.workers.lock().unwrap();
        let running = workers
            .iter()
            .filter(|w| w.status() == WorkerStatus::Running)
            .count();
        let unhealthy = workers
            .iter()
            .filter(|w| w.health() == HealthState::Unhealthy)
            .count();
        ClusterMetrics {
            workers: workers.len(),
            running,
            unhealthy,
            total_in_flight: workers.iter().map(|w| w.in_flight()).sum(),
            restarts_in_window: self.restarts.lock().unwrap().len(),
            auto_restart_enabled: self.auto_restart_enabled.load(Ordering::SeqCst),
        }
    }

    pub fn get_cluster_health(&self) -> ClusterHealth {
        if !self.auto_restart_enabled.load(Ordering::SeqCst) {
            return ClusterHealth::Critical;
        }
        let metrics = self.get_cluster_metrics();
        if metrics.unhealthy > 0 || metrics.workers < self.options.min_workers {
            ClusterHealth::Degraded
        } else {
            ClusterHealth::Healthy
        }
    }

    /// Channel for the external file-watcher collaborator. Change events
    /// are debounced, then the fleet is rolled.
    pub fn file_watch_sender(self: &Arc<Self>) -> mpsc::UnboundedSender<String> {
        if let Some(tx) = self.watch_tx.lock().unwrap().as_ref() {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.watch_tx.lock().unwrap() = Some(tx.clone());
        self.spawn_watch_loop(rx);
        tx
    }

    fn spawn_watch_task(self: &Arc<Self>) {
        // Materialize the channel eagerly so reloads work without a caller
        // ever requesting the sender.
        let _ = self.file_watch_sender();
    }

    fn spawn_watch_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        let supervisor = Arc::downgrade(self);
        let debounce = self.options.watch_debounce;
        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                log::debug!("file change: {first}");
                // Collapse the burst: keep extending while events arrive
                // within the debounce window.
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(next)) => log::debug!("file change: {next}"),
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                let Some(supervisor) = supervisor.upgrade() else { return };
                log::info!("file changes settled, rolling the cluster");
                if let Err(e) = supervisor.restart_cluster().await {
                    let budget = supervisor.options.restart_delay
                        * supervisor.options.max_restarts;
                    log::error!(
                        "reload failed ({e}); hard shutdown after {budget:?} budget"
                    );
                    supervisor.shutdown().await;
                }
            }
        });
    }

    /// Drains and stops every worker and the supervision tasks.
    pub async fn shutdown(self: &Arc<Self>) {
        let _ = self.shutdown_tx.send(true);
        let workers: Vec<Arc<WorkerHandle>> = {
            let mut guard = self.workers.lock().unwrap();
            guard.drain(..).collect()
        };
        for worker in workers {
            worker.set_status(WorkerStatus::Stopping);
            let _ = worker.send(&MasterMessage::Shutdown).await;
            worker.kill().await;
            worker.set_status(WorkerStatus::Stopped);
        }
        log::info!("cluster shut down");
    }
}
