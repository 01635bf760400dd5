//! Lifecycle supervision for the render worker process.
//!
//! The supervisor owns the whole worker lifecycle: reserve a loopback port,
//! spawn the process with `PORT` in its environment, poll `/health` until it
//! answers, and tear it down again. Once the worker is ready, request
//! traffic goes through a [`WorkerClient`] bound to the reserved port.

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex as StdMutex, PoisonError};

use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::{ApiKey, WorkerClient};
use crate::config::SupervisorConfig;
use crate::script::{Character, RenderJob};

/// Keep the worker console hidden when launched from a desktop frontend.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker entry point not found: {}", .0.display())]
    WorkerNotFound(PathBuf),

    #[error("failed to reserve a loopback port: {0}")]
    ReservePort(#[source] io::Error),

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] io::Error),

    #[error("worker exited during startup: {0}")]
    WorkerCrashed(std::process::ExitStatus),

    #[error("worker not ready after {attempts} health probes")]
    StartupTimeout { attempts: u32 },

    #[error("worker rejected configuration: HTTP {status}")]
    ConfigurationRejected { status: StatusCode },

    #[error("worker request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected worker response: {0}")]
    UnexpectedResponse(String),

    #[error("worker is not running")]
    NotReady,
}

/// Where the supervisor currently stands in the worker lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    Failed(String),
}

impl SupervisorState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// The failure reason, when the last start failed.
    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

struct WorkerHandle {
    child: Child,
    port: u16,
}

impl WorkerHandle {
    /// Poll the child without blocking. `true` while it has not exited.
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Supervisor for a single render worker process.
///
/// `start` and `stop` are serialized through one lock, so two racing starts
/// spawn exactly one process. Request operations never take that lock; they
/// go straight to the worker through the last known client.
///
/// Dropping the supervisor kills the worker too: the child is spawned with
/// `kill_on_drop`, so an abandoned supervisor cannot leak a process. Call
/// [`stop`](Self::stop) for an orderly shutdown with logging.
pub struct BackendSupervisor {
    config: SupervisorConfig,
    http: reqwest::Client,
    worker: Mutex<Option<WorkerHandle>>,
    state: StdMutex<SupervisorState>,
    client: StdMutex<Option<WorkerClient>>,
    api_key: StdMutex<Option<ApiKey>>,
}

impl BackendSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            config,
            http,
            worker: Mutex::new(None),
            state: StdMutex::new(SupervisorState::Stopped),
            client: StdMutex::new(None),
            api_key: StdMutex::new(None),
        }
    }

    /// Start the worker and wait until it answers health probes.
    ///
    /// Idempotent: when a worker is already running this returns without
    /// touching it. On any failure the state moves to
    /// [`SupervisorState::Failed`] and no worker process is left behind.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            debug!("worker already running, ignoring start");
            return Ok(());
        }

        self.set_state(SupervisorState::Starting);
        match self.start_worker().await {
            Ok(handle) => {
                let port = handle.port;
                *worker = Some(handle);
                let client =
                    WorkerClient::new(self.http.clone(), port, self.config.readiness_interval);
                self.set_client(Some(client.clone()));
                self.set_state(SupervisorState::Ready);
                info!(port, "worker ready");

                // Replay a key configured before this run. Best effort: the
                // caller can always retry through set_credential.
                if let Some(key) = self.stored_key() {
                    if let Err(e) = client.configure(&key).await {
                        warn!(error = %e, "failed to replay stored API key");
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.set_state(SupervisorState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Kill the worker and wait for it to exit.
    ///
    /// Always clears the handle, even when the kill fails, so a wedged
    /// process cannot hold the supervisor in `Ready` forever. Also resets a
    /// `Failed` state back to `Stopped`. Idempotent.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        self.set_client(None);
        let Some(mut handle) = worker.take() else {
            self.set_state(SupervisorState::Stopped);
            debug!("no worker running, ignoring stop");
            return;
        };

        if let Err(e) = handle.child.kill().await {
            warn!(error = %e, "failed to kill worker");
        }
        self.set_state(SupervisorState::Stopped);
        info!(port = handle.port, "worker stopped");
    }

    /// Store the API key and push it to the worker.
    ///
    /// The key is retained even when the worker is unreachable or rejects
    /// it, so a later [`start`](Self::start) replays it and the caller can
    /// retry without re-entering the key.
    pub async fn set_credential(&self, key: ApiKey) -> Result<(), SupervisorError> {
        self.store_key(key.clone());
        let client = self.ready_client()?;
        client.configure(&key).await
    }

    /// `true` when a worker is up and answering `/health`. Never errors.
    pub async fn check_health(&self) -> bool {
        match self.current_client() {
            Some(client) => client.health().await,
            None => false,
        }
    }

    /// Fetch the character roster from the running worker.
    pub async fn characters(&self) -> Result<Vec<Character>, SupervisorError> {
        self.ready_client()?.characters().await
    }

    /// Submit a render job and return the full URL of the produced video.
    pub async fn submit_render(&self, job: &RenderJob) -> Result<Url, SupervisorError> {
        self.ready_client()?.render(job).await
    }

    /// Whether the worker process is currently alive.
    pub async fn is_running(&self) -> bool {
        let mut worker = self.worker.lock().await;
        match worker.as_mut() {
            Some(handle) => handle.is_alive(),
            None => false,
        }
    }

    /// Port the current worker listens on, when one is running.
    pub fn port(&self) -> Option<u16> {
        self.current_client().map(|client| client.port())
    }

    /// OS process id of the worker, when one is running.
    pub async fn worker_pid(&self) -> Option<u32> {
        self.worker
            .lock()
            .await
            .as_ref()
            .and_then(|handle| handle.child.id())
    }

    pub fn state(&self) -> SupervisorState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    async fn start_worker(&self) -> Result<WorkerHandle, SupervisorError> {
        let entry_point = &self.config.worker.entry_point;
        if !entry_point.exists() {
            return Err(SupervisorError::WorkerNotFound(entry_point.clone()));
        }

        let port = reserve_loopback_port().await?;
        info!(
            port,
            program = %self.config.worker.program.display(),
            "starting worker"
        );

        let mut child = self.spawn_worker_process(port)?;
        forward_worker_output(&mut child);

        let probe = WorkerClient::new(self.http.clone(), port, self.config.readiness_interval);
        self.await_ready(&mut child, &probe).await?;
        Ok(WorkerHandle { child, port })
    }

    fn spawn_worker_process(&self, port: u16) -> Result<Child, SupervisorError> {
        let worker = &self.config.worker;
        let mut command = Command::new(&worker.program);
        command
            .args(&worker.args)
            .envs(worker.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            // PORT goes last so caller environment cannot mask it.
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &worker.working_dir {
            command.current_dir(dir);
        }
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        command.spawn().map_err(SupervisorError::Spawn)
    }

    /// Probe `/health` until the worker answers, fail fast when it dies, and
    /// kill it when it never becomes ready.
    async fn await_ready(
        &self,
        child: &mut Child,
        probe: &WorkerClient,
    ) -> Result<(), SupervisorError> {
        let attempts = self.config.readiness_attempts;
        for attempt in 1..=attempts {
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(%status, "worker exited during startup");
                    return Err(SupervisorError::WorkerCrashed(status));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "could not poll worker status"),
            }

            if probe.health().await {
                debug!(attempt, "worker answered health probe");
                return Ok(());
            }
            tokio::time::sleep(self.config.readiness_interval).await;
        }

        // The worker is alive but never became ready. Kill it so a failed
        // start does not leak a process.
        warn!(attempts, "worker missed its readiness window");
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill unready worker");
        }
        Err(SupervisorError::StartupTimeout { attempts })
    }

    fn ready_client(&self) -> Result<WorkerClient, SupervisorError> {
        self.current_client().ok_or(SupervisorError::NotReady)
    }

    fn current_client(&self) -> Option<WorkerClient> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_client(&self, client: Option<WorkerClient>) {
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = client;
    }

    fn set_state(&self, next: SupervisorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn stored_key(&self) -> Option<ApiKey> {
        self.api_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_key(&self, key: ApiKey) {
        *self.api_key.lock().unwrap_or_else(PoisonError::into_inner) = Some(key);
    }
}

/// Reserve an ephemeral loopback port by binding port 0 and releasing it.
///
/// The port is free at the moment of release, but another process could
/// claim it before the worker binds. The window is tiny on a developer
/// machine; a collision surfaces as a startup timeout on the next attempt.
async fn reserve_loopback_port() -> Result<u16, SupervisorError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(SupervisorError::ReservePort)?;
    let port = listener
        .local_addr()
        .map_err(SupervisorError::ReservePort)?
        .port();
    drop(listener);
    Ok(port)
}

/// Drain the worker's stdout and stderr into our log stream so its output
/// is never lost and never blocks the child on a full pipe.
fn forward_worker_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, "stderr"));
    }
}

async fn forward_lines(stream: impl AsyncRead + Unpin, source: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "tableread::worker", source, "{}", line);
    }
}
