// src/device/mod.rs - the single plotter and its device tool subprocess
pub mod command;
pub mod process;

use command::DeviceCommand;
use plotq_shared::config::DeviceConfig;
use plotq_shared::{ConnectionInfo, ControlResult, DeviceState, DeviceStatus, JobError, JobParameters, RunOutcome};
use process::{StopFn, collect_output, two_phase_stop};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long to wait for the stderr reader after the tool exited.
const STDERR_DRAIN: Duration = Duration::from_secs(2);

/// Reply is true once the device tool is gone, false when it could not be stopped.
type CancelRequest = oneshot::Sender<bool>;

#[derive(Debug)]
struct DeviceSession {
    state: DeviceState,
    current_job_id: Option<String>,
    connection: Option<ConnectionInfo>,
    jobs_completed: u64,
    /// Present exactly while a run is registered; carries cancel requests to it.
    cancel_tx: Option<mpsc::Sender<CancelRequest>>,
}

fn lock(session: &Mutex<DeviceSession>) -> MutexGuard<'_, DeviceSession> {
    // the session holds plain data, so a poisoned lock is still consistent
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the device session and the device tool subprocess.
///
/// `Busy` is the device's only mutual exclusion: `start_job` refuses to run unless the
/// session is `Idle`, and every run returns the session to `Idle` when it ends, however
/// it ends (see `SessionGuard`).
#[derive(Debug)]
pub struct DeviceController {
    command: DeviceCommand,
    model: String,
    probe_timeout: Duration,
    grace_period: Duration,
    stop: StopFn,
    session: Arc<Mutex<DeviceSession>>,
    started: Instant,
}

impl DeviceController {
    pub fn new(command: DeviceCommand, model: impl Into<String>) -> Self {
        Self {
            command,
            model: model.into(),
            probe_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            stop: two_phase_stop,
            session: Arc::new(Mutex::new(DeviceSession {
                state: DeviceState::Idle,
                current_job_id: None,
                connection: None,
                jobs_completed: 0,
                cancel_tx: None,
            })),
            started: Instant::now(),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(DeviceCommand::from_config(config), config.model.clone())
            .with_probe_timeout(config.probe_timeout())
            .with_grace_period(config.grace_period())
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_stop_fn(mut self, stop: StopFn) -> Self {
        self.stop = stop;
        self
    }

    pub fn state(&self) -> DeviceState {
        lock(&self.session).state
    }

    pub fn current_job_id(&self) -> Option<String> {
        lock(&self.session).current_job_id.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.session).connection.as_ref().is_some_and(|c| c.connected)
    }

    /// Runs the device tool's version probe, bounded by the probe timeout. A missing or
    /// unresponsive device is recorded as disconnected, never reported as an error.
    pub async fn check_connection(&self) -> ConnectionInfo {
        let mut probe = self.command.probe();
        let info = match tokio::time::timeout(self.probe_timeout, probe.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                tracing::info!("{} connected: {}", self.model, version);
                ConnectionInfo {
                    connected: true,
                    model: Some(self.model.clone()),
                    firmware: Some(version),
                }
            }
            Ok(Ok(output)) => {
                tracing::warn!("{} not detected (probe exited with {})", self.model, output.status);
                ConnectionInfo::disconnected()
            }
            Ok(Err(e)) => {
                tracing::error!("Error checking {} connection: {}", self.model, e);
                ConnectionInfo::disconnected()
            }
            Err(_) => {
                tracing::warn!("{} connection check timed out after {:?}", self.model, self.probe_timeout);
                ConnectionInfo::disconnected()
            }
        };
        lock(&self.session).connection = Some(info.clone());
        info
    }

    /// Claims the device for `job_id` and spawns the device tool. Fails with `DeviceBusy`
    /// unless the session is `Idle`. A spawn error is not returned here: it surfaces as a
    /// `Failure` outcome from `RunningJob::wait` so the caller has a single result path.
    pub fn start_job(&self, filepath: &Path, job_id: &str, params: &JobParameters) -> Result<RunningJob, JobError> {
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        {
            let mut session = lock(&self.session);
            if session.state != DeviceState::Idle {
                return Err(JobError::DeviceBusy);
            }
            session.state = DeviceState::Busy;
            session.current_job_id = Some(job_id.to_string());
            session.cancel_tx = Some(cancel_tx);
        }
        let guard = SessionGuard {
            session: self.session.clone(),
            job_id: job_id.to_string(),
        };

        tracing::info!(job_id = %job_id, "Starting plot: {}", self.command.describe(filepath, params));
        let child = self.command.plot(filepath, params).spawn().map_err(|e| {
            tracing::error!(job_id = %job_id, "Failed to start device tool: {}", e);
            format!("failed to start device tool: {e}")
        });

        Ok(RunningJob {
            guard,
            child,
            cancel_rx,
            timeout: Duration::from_secs(params.timeout),
            grace_period: self.grace_period,
            stop: self.stop,
        })
    }

    /// Plots `filepath` and waits for the outcome. The session is `Idle` again when this returns.
    pub async fn run_job(&self, filepath: &Path, job_id: &str, params: &JobParameters) -> Result<RunOutcome, JobError> {
        Ok(self.start_job(filepath, job_id, params)?.wait().await)
    }

    /// Stops the running device tool (graceful signal, grace period, kill). Returns true
    /// only once the tool is gone. Returns false without side effects when nothing is
    /// running or the tool could not be stopped; in the latter case the run keeps the
    /// device until the tool exits.
    pub async fn cancel(&self) -> bool {
        let (cancel_tx, job_id) = {
            let session = lock(&self.session);
            (session.cancel_tx.clone(), session.current_job_id.clone())
        };
        let (Some(cancel_tx), Some(job_id)) = (cancel_tx, job_id) else {
            tracing::warn!("No active process to cancel");
            return false;
        };

        tracing::info!(job_id = %job_id, "Cancelling job");
        let (reply_tx, reply_rx) = oneshot::channel();
        let stopped = match cancel_tx.send(reply_tx).await {
            Ok(()) => reply_rx.await.ok(),
            Err(_) => None,
        };
        match stopped {
            Some(true) => {}
            Some(false) => {
                tracing::error!(job_id = %job_id, "Device tool could not be stopped; job still running");
                return false;
            }
            None => {
                // the run finished on its own before it saw the request
                tracing::warn!(job_id = %job_id, "Job ended before it could be cancelled");
                return false;
            }
        }

        let mut session = lock(&self.session);
        if session.current_job_id.as_deref() == Some(job_id.as_str()) {
            session.reset();
        }
        true
    }

    /// The device tool has no pause primitive.
    pub fn pause(&self) -> ControlResult {
        tracing::warn!("Pause requested but the device tool cannot pause");
        ControlResult::Unsupported("pause")
    }

    /// The device tool has no resume primitive.
    pub fn resume(&self) -> ControlResult {
        tracing::warn!("Resume requested but the device tool cannot resume");
        ControlResult::Unsupported("resume")
    }

    pub fn status(&self) -> DeviceStatus {
        let session = lock(&self.session);
        let connection = session.connection.clone().unwrap_or_default();
        DeviceStatus {
            state: session.state,
            current_job: session.current_job_id.clone(),
            connected: connection.connected,
            model: connection.model,
            firmware: connection.firmware,
            uptime: self.uptime().as_secs(),
            jobs_completed: session.jobs_completed,
        }
    }
}

impl DeviceSession {
    fn reset(&mut self) {
        self.state = DeviceState::Idle;
        self.current_job_id = None;
        self.cancel_tx = None;
    }
}

/// Returns the session to `Idle` when a run ends on any path, including the run's
/// future being dropped.
#[derive(Debug)]
struct SessionGuard {
    session: Arc<Mutex<DeviceSession>>,
    job_id: String,
}

impl SessionGuard {
    fn set_state(&self, state: DeviceState) {
        lock(&self.session).state = state;
    }

    fn record_completion(&self) {
        lock(&self.session).jobs_completed += 1;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut session = lock(&self.session);
        if session.current_job_id.as_deref() == Some(self.job_id.as_str()) {
            session.reset();
        }
    }
}

enum RunEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    CancelRequested(CancelRequest),
}

/// A claimed device with its (possibly failed to spawn) device tool process.
#[derive(Debug)]
pub struct RunningJob {
    guard: SessionGuard,
    child: Result<Child, String>,
    cancel_rx: mpsc::Receiver<CancelRequest>,
    timeout: Duration,
    grace_period: Duration,
    stop: StopFn,
}

impl RunningJob {
    pub fn job_id(&self) -> &str {
        &self.guard.job_id
    }

    /// Waits for the device tool to exit, time out or be cancelled. Does not return while
    /// the tool is still alive: a stop that fails leaves the run waiting for the exit.
    pub async fn wait(mut self) -> RunOutcome {
        let job_id = self.guard.job_id.clone();
        let mut child = match std::mem::replace(&mut self.child, Err(String::new())) {
            Ok(child) => child,
            Err(reason) => {
                self.guard.set_state(DeviceState::Error);
                return RunOutcome::Failure(reason);
            }
        };
        let stderr = child.stderr.take().map(collect_output);
        let timed_out = || RunOutcome::Failure(format!("timed out after {}s", self.timeout.as_secs()));

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut expired = false;

        loop {
            let event = tokio::select! {
                status = child.wait() => RunEvent::Exited(status),
                _ = &mut deadline, if !expired => RunEvent::TimedOut,
                Some(reply) = self.cancel_rx.recv() => RunEvent::CancelRequested(reply),
            };

            match event {
                RunEvent::Exited(_) if expired => {
                    abort(stderr);
                    tracing::warn!(job_id = %job_id, "Timed out device tool exited on its own");
                    return timed_out();
                }
                RunEvent::Exited(Ok(status)) if status.success() => {
                    abort(stderr);
                    self.guard.record_completion();
                    tracing::info!(job_id = %job_id, "Job completed successfully");
                    return RunOutcome::Success;
                }
                RunEvent::Exited(Ok(status)) => {
                    let diagnostic = drain(stderr).await;
                    let message = if diagnostic.is_empty() {
                        format!("device tool exited with {status}")
                    } else {
                        diagnostic
                    };
                    tracing::error!(job_id = %job_id, "Job failed: {}", message);
                    self.guard.set_state(DeviceState::Error);
                    return RunOutcome::Failure(message);
                }
                RunEvent::Exited(Err(e)) => {
                    abort(stderr);
                    tracing::error!(job_id = %job_id, "Waiting for device tool failed: {}", e);
                    self.guard.set_state(DeviceState::Error);
                    return RunOutcome::Failure(format!("waiting for device tool failed: {e}"));
                }
                RunEvent::TimedOut => {
                    tracing::error!(job_id = %job_id, "Job timed out after {:?}", self.timeout);
                    self.guard.set_state(DeviceState::Error);
                    match (self.stop)(&mut child, self.grace_period).await {
                        Ok(_) => {
                            abort(stderr);
                            return timed_out();
                        }
                        Err(e) => {
                            tracing::error!(job_id = %job_id, "Stopping timed out device tool failed: {}", e);
                            expired = true;
                        }
                    }
                }
                RunEvent::CancelRequested(reply) => match (self.stop)(&mut child, self.grace_period).await {
                    Ok(kind) => {
                        abort(stderr);
                        tracing::info!(job_id = %job_id, "Device tool stopped ({:?})", kind);
                        let _ = reply.send(true);
                        return RunOutcome::Cancelled;
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, "Stopping device tool failed: {}", e);
                        let _ = reply.send(false);
                    }
                },
            }
        }
    }
}

fn abort(handle: Option<JoinHandle<String>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

async fn drain(handle: Option<JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let abort_handle = handle.abort_handle();
    match tokio::time::timeout(STDERR_DRAIN, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort_handle.abort();
            String::new()
        }
    }
}
