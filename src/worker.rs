// src/worker.rs - background loop that feeds queued jobs to the device
use crate::host::PlotterHost;
use plotq_shared::{DeviceState, JobError, RunOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// What one pass of the dispatch loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// The device was not idle.
    DeviceBusy,
    /// Nothing queued.
    QueueEmpty,
    /// A job ran to an outcome.
    Dispatched { job_id: String, outcome: RunOutcome },
    /// Shutdown arrived while a job was running; the job is left `running`.
    Interrupted { job_id: String },
}

/// Single cooperative dispatch loop. Started once at startup and stopped once at shutdown.
pub struct DispatchWorker {
    host: Arc<PlotterHost>,
    poll_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl DispatchWorker {
    pub fn new(host: Arc<PlotterHost>, poll_interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            host,
            poll_interval,
            shutdown_tx,
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn start(&mut self) {
        if self.is_running() {
            tracing::warn!("Worker already running");
            return;
        }
        let host = self.host.clone();
        let poll_interval = self.poll_interval;
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.handle = Some(tokio::spawn(work_loop(host, poll_interval, shutdown_rx)));
        tracing::info!("Job worker started");
    }

    /// Signals the loop and waits for it to exit. Interrupts poll sleeps and the wait on a
    /// running device tool, never the device tool itself.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            tracing::error!("Worker task ended abnormally: {}", e);
        }
        tracing::info!("Job worker stopped");
    }
}

async fn work_loop(host: Arc<PlotterHost>, poll_interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
    tracing::info!("Worker loop started");
    loop {
        let idle = match run_once(&host, &mut shutdown_rx).await {
            Ok(Tick::Dispatched { .. }) => false,
            Ok(Tick::Interrupted { .. }) => break,
            Ok(Tick::DeviceBusy) | Ok(Tick::QueueEmpty) => true,
            Err(e) => {
                tracing::error!("Error in worker loop: {}", e);
                true
            }
        };
        if idle {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        } else if !shutdown_rx.is_empty() {
            break;
        }
    }
    tracing::info!("Worker loop ended");
}

/// One pass of the loop: dispatch the next job if the device is idle and wait for it.
pub async fn run_once(host: &PlotterHost, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<Tick, JobError> {
    if host.device().state() != DeviceState::Idle {
        tracing::debug!(state = %host.device().state(), "Device not idle");
        return Ok(Tick::DeviceBusy);
    }
    let Some(dispatch) = host.dispatch_next().await? else {
        return Ok(Tick::QueueEmpty);
    };
    let job_id = dispatch.job.id.clone();

    let outcome = tokio::select! {
        outcome = dispatch.run.wait() => outcome,
        _ = shutdown_rx.recv() => {
            tracing::warn!(job_id = %job_id, "Shutdown while job running; leaving it running");
            return Ok(Tick::Interrupted { job_id });
        }
    };
    // on a store error the host keeps the outcome and writes it before the next dispatch
    host.finish(&job_id, outcome.clone()).await?;
    Ok(Tick::Dispatched { job_id, outcome })
}
