//! Worker processes and the supervisor IPC protocol.
//!
//! Workers are OS processes of the current executable started with
//! `XYPRISS_WORKER=1`; they share the listen address through the listener's
//! SO_REUSEPORT behavior. IPC is newline-delimited JSON: the master writes
//! [`MasterMessage`] lines to the worker's stdin, the worker writes
//! [`WorkerMessage`] lines to stdout. Delivery is best-effort and ordered
//! per worker.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use crate::core::{XyPrissError, XyResult};

/// Environment flag marking a process as a cluster worker.
pub const WORKER_ENV: &str = "XYPRISS_WORKER";
/// Environment variable carrying the worker id.
pub const WORKER_ID_ENV: &str = "XYPRISS_WORKER_ID";

/// Master -> worker control messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    /// Application-level broadcast payload.
    Broadcast { payload: JsonValue },
    /// Stop accepting, finish in-flight within the grace period, exit.
    Drain { grace_secs: u64 },
    Shutdown,
}

/// Worker -> master reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready { port: u16 },
    Heartbeat { in_flight: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// Event forwarded from a worker's stdout reader to the supervisor.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker_id: u32,
    pub message: WorkerMessage,
}

/// A supervised worker process.
pub struct WorkerHandle {
    pub id: u32,
    pub port: u16,
    pub started_at: Instant,
    pub restart_count: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    status: StdMutex<WorkerStatus>,
    health: StdMutex<HealthState>,
    consecutive_failures: AtomicU32,
    last_heartbeat: StdMutex<Instant>,
    in_flight: AtomicU32,
}

/// Point-in-time view of a worker, for metrics and tests.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: u32,
    pub port: u16,
    pub status: WorkerStatus,
    pub health: HealthState,
    pub restart_count: u32,
    pub uptime_secs: u64,
    pub in_flight: u32,
}

impl WorkerHandle {
    /// Spawns a worker process and its stdout reader. `command` defaults to
    /// the current executable; supervision tests substitute a script.
    pub fn spawn(
        id: u32,
        port: u16,
        restart_count: u32,
        command: &WorkerCommand,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> XyResult<Self> {
        let (program, args) = command.resolve()?;
        let mut child = Command::new(program)
            .args(args)
            .env(WORKER_ENV, "1")
            .env(WORKER_ID_ENV, id.to_string())
            .env("PORT", port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| XyPrissError::WorkerCrash(format!("spawn failed: {e}")))?;

        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(message) => {
                            if events.send(WorkerEvent { worker_id: id, message }).is_err() {
                                break;
                            }
                        }
                        Err(_) => log::debug!("worker {id} stdout: {line}"),
                    }
                }
            });
        }

        Ok(Self {
            id,
            port,
            started_at: Instant::now(),
            restart_count,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            status: StdMutex::new(WorkerStatus::Starting),
            health: StdMutex::new(HealthState::Unknown),
            consecutive_failures: AtomicU32::new(0),
            last_heartbeat: StdMutex::new(Instant::now()),
            in_flight: AtomicU32::new(0),
        })
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: WorkerStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn health(&self) -> HealthState {
        *self.health.lock().unwrap()
    }

    pub fn note_heartbeat(&self, in_flight: u32) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
        *self.health.lock().unwrap() = HealthState::Healthy;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.in_flight.store(in_flight, Ordering::Relaxed);
        if self.status() == WorkerStatus::Starting {
            self.set_status(WorkerStatus::Running);
        }
    }

    pub fn heartbeat_age(&self) -> std::time::Duration {
        self.last_heartbeat.lock().unwrap().elapsed()
    }

    /// Marks a missed-heartbeat check; returns the consecutive count.
    pub fn note_health_failure(&self) -> u32 {
        *self.health.lock().unwrap() = HealthState::Unhealthy;
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Sends a control message over the worker's stdin.
    pub async fn send(&self, message: &MasterMessage) -> XyResult<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(XyPrissError::WorkerCrash(format!(
                "worker {} stdin closed",
                self.id
            )));
        };
        let mut line = serde_json::to_vec(message)
            .map_err(|e| XyPrissError::Internal(e.to_string()))?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|e| XyPrissError::WorkerCrash(format!("worker {} write: {e}", self.id)))
    }

    /// True when the process has exited.
    pub async fn has_exited(&self) -> bool {
        self.child
            .lock()
            .await
            .try_wait()
            .map(|status| status.is_some())
            .unwrap_or(true)
    }

    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            log::debug!("worker {} kill: {e}", self.id);
        }
        let _ = child.wait().await;
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            port: self.port,
            status: self.status(),
            health: self.health(),
            restart_count: self.restart_count,
            uptime_secs: self.started_at.elapsed().as_secs(),
            in_flight: self.in_flight(),
        }
    }
}

/// How worker processes are launched.
#[derive(Debug, Clone, Default)]
pub enum WorkerCommand {
    /// Re-exec the current executable (production path).
    #[default]
    CurrentExe,
    /// Explicit program + args; used by supervision tests.
    Custom(String, Vec<String>),
}

impl WorkerCommand {
    fn resolve(&self) -> XyResult<(String, Vec<String>)> {
        match self {
            WorkerCommand::CurrentExe => {
                let exe = std::env::current_exe()
                    .map_err(|e| XyPrissError::Internal(format!("current_exe: {e}")))?;
                Ok((exe.to_string_lossy().into_owned(), Vec::new()))
            }
            WorkerCommand::Custom(program, args) => Ok((program.clone(), args.clone())),
        }
    }
}

/// Worker-process side of the IPC: emits heartbeats on stdout and surfaces
/// master messages from stdin.
pub struct WorkerRuntime {
    pub messages: mpsc::UnboundedReceiver<MasterMessage>,
}

impl WorkerRuntime {
    /// True when this process was spawned as a cluster worker.
    pub fn is_worker_process() -> bool {
        std::env::var(WORKER_ENV).map(|v| v == "1").unwrap_or(false)
    }

    /// Installs the stdin reader and the heartbeat writer. `in_flight` is
    /// polled for each heartbeat.
    pub fn install<F>(heartbeat_interval: std::time::Duration, in_flight: F) -> Self
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<MasterMessage>(&line) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::debug!("unparseable master message: {e}"),
                }
            }
        });

        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                let message = WorkerMessage::Heartbeat {
                    in_flight: in_flight(),
                };
                let Ok(mut line) = serde_json::to_vec(&message) else { continue };
                line.push(b'\n');
                if stdout.write_all(&line).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        Self { messages: rx }
    }
}
