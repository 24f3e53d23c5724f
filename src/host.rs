// src/host.rs - the plotter host: queue and device behind one dispatch gate
use crate::device::{DeviceController, RunningJob};
use crate::queue::QueueManager;
use chrono::Utc;
use plotq_shared::api_models::HealthResponse;
use plotq_shared::config::OrphanPolicy;
use plotq_shared::{
    ConnectionInfo, ControlResult, DeviceState, DeviceStatus, Job, JobError, JobParameters, JobStatus,
    RunOutcome, StatusUpdate,
};
use std::path::PathBuf;
use tokio::sync::Mutex;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A job bound to the device: its record (already `running`) and the live run.
#[derive(Debug)]
pub struct Dispatch {
    pub job: Job,
    pub run: RunningJob,
}

/// Entry point for everything that touches jobs or the device.
///
/// `gate` serializes the two compound operations that would otherwise race: binding a
/// queued job to the device (status write + spawn) and cancelling a running job (device
/// stop + status write). A cancel therefore sees a job either still `queued` or attached
/// to a live run, and at most one job is ever `running`.
///
/// The gate also holds the outcome of a finished run whose status write failed. It is
/// written before anything else goes through the gate, so no job is dispatched while a
/// finished one still reads `running`.
pub struct PlotterHost {
    queue: QueueManager,
    device: DeviceController,
    gate: Mutex<Option<Unsettled>>,
    admission: Mutex<()>,
}

/// A run that ended but whose outcome is not in the store yet.
#[derive(Debug)]
struct Unsettled {
    job_id: String,
    outcome: RunOutcome,
}

impl PlotterHost {
    pub fn new(queue: QueueManager, device: DeviceController) -> Self {
        Self {
            queue,
            device,
            gate: Mutex::new(None),
            admission: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn device(&self) -> &DeviceController {
        &self.device
    }

    /// Queues a job and returns it with its queue position.
    pub async fn submit(
        &self,
        filename: &str,
        filepath: impl Into<PathBuf>,
        parameters: JobParameters,
    ) -> Result<(Job, usize), JobError> {
        let job = self.queue.create_job(filename, filepath, parameters).await?;
        let position = self.queue.queue_position(&job.id).await?;
        Ok((job, position))
    }

    /// Queues a job unless `max_queued` jobs are already waiting. Count and insert happen
    /// under one lock, so concurrent submissions cannot push the queue past the limit.
    pub async fn submit_bounded(
        &self,
        filename: &str,
        filepath: impl Into<PathBuf>,
        parameters: JobParameters,
        max_queued: usize,
    ) -> Result<(Job, usize), JobError> {
        let _admission = self.admission.lock().await;
        if self.queue.queue_size().await? >= max_queued {
            return Err(JobError::QueueFull(max_queued));
        }
        self.submit(filename, filepath, parameters).await
    }

    pub async fn job(&self, id: &str) -> Result<(Job, Option<usize>), JobError> {
        let job = self.queue.get_job(id).await?;
        let position = self.queue.position_of(&job).await?;
        Ok((job, position))
    }

    pub async fn jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<(Job, Option<usize>)>, JobError> {
        let jobs = self.queue.list_jobs(status, limit).await?;
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let position = self.queue.position_of(&job).await?;
            out.push((job, position));
        }
        Ok(out)
    }

    /// 1-indexed queue position, 0 once the job has left the queue.
    pub async fn position(&self, id: &str) -> Result<usize, JobError> {
        self.queue.get_job(id).await?;
        self.queue.queue_position(id).await
    }

    /// Binds the oldest queued job to the device. `None` when the device is not idle or
    /// the queue is empty.
    pub async fn dispatch_next(&self) -> Result<Option<Dispatch>, JobError> {
        let mut pending = self.gate.lock().await;
        self.settle_pending(&mut pending).await?;
        if self.device.state() != DeviceState::Idle {
            return Ok(None);
        }
        let Some(next) = self.queue.next_queued_job().await? else {
            return Ok(None);
        };

        let job = self.queue.update_status(&next.id, StatusUpdate::running()).await?;
        tracing::info!(job_id = %job.id, "Processing job: {}", job.filename);
        match self.device.start_job(&job.filepath, &job.id, &job.parameters) {
            Ok(run) => Ok(Some(Dispatch { job, run })),
            Err(e) => {
                // idle was checked under the gate, so only an outside caller of the device gets here
                tracing::error!(job_id = %job.id, "Device refused job: {}", e);
                self.queue.update_status(&job.id, StatusUpdate::failed(e.to_string())).await?;
                Err(e)
            }
        }
    }

    /// Writes the outcome of a run. A job that is no longer `running` was settled by a
    /// cancel and is left alone. When the store write fails the outcome is kept and
    /// retried before the next dispatch.
    pub async fn finish(&self, job_id: &str, outcome: RunOutcome) -> Result<Job, JobError> {
        // dispatch waits on an empty slot, so nothing else can be kept here
        let mut pending = self.gate.lock().await;
        match self.record_outcome(job_id, &outcome).await {
            Err(e @ JobError::Storage(_)) => {
                tracing::warn!(job_id = %job_id, "Outcome not stored, retrying before next dispatch: {}", e);
                *pending = Some(Unsettled {
                    job_id: job_id.to_string(),
                    outcome,
                });
                Err(e)
            }
            result => result,
        }
    }

    /// Retries a kept outcome. Storage errors put it back; any other error means the
    /// record is gone or already terminal, so it is dropped.
    async fn settle_pending(&self, pending: &mut Option<Unsettled>) -> Result<(), JobError> {
        let Some(unsettled) = pending.take() else {
            return Ok(());
        };
        match self.record_outcome(&unsettled.job_id, &unsettled.outcome).await {
            Ok(_) => Ok(()),
            Err(e @ JobError::Storage(_)) => {
                tracing::error!(job_id = %unsettled.job_id, "Outcome still not stored: {}", e);
                *pending = Some(unsettled);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(job_id = %unsettled.job_id, "Dropping kept outcome: {}", e);
                Ok(())
            }
        }
    }

    async fn record_outcome(&self, job_id: &str, outcome: &RunOutcome) -> Result<Job, JobError> {
        let job = self.queue.get_job(job_id).await?;
        if job.status != JobStatus::Running {
            tracing::debug!(job_id = %job_id, status = %job.status, "Run ended after job was settled");
            return Ok(job);
        }
        let update = match outcome {
            RunOutcome::Success => StatusUpdate::completed(),
            RunOutcome::Failure(error) => StatusUpdate::failed(error.clone()),
            RunOutcome::Cancelled => StatusUpdate::cancelled(),
        };
        let job = self.queue.update_status(job_id, update).await?;
        match job.status {
            JobStatus::Completed => tracing::info!(job_id = %job_id, "Job completed successfully"),
            JobStatus::Failed => tracing::error!(job_id = %job_id, "Job failed: {}", job.error.as_deref().unwrap_or("")),
            _ => tracing::info!(job_id = %job_id, status = %job.status, "Job finished"),
        }
        Ok(job)
    }

    /// Cancels a queued job directly, or stops the device for a running one before
    /// recording the cancel. If the device cannot be stopped the status is unchanged.
    pub async fn cancel_job(&self, id: &str) -> Result<Job, JobError> {
        let mut pending = self.gate.lock().await;
        self.settle_pending(&mut pending).await?;
        let job = self.queue.get_job(id).await?;
        match job.status {
            JobStatus::Queued => self.queue.update_status(id, StatusUpdate::cancelled()).await,
            JobStatus::Running | JobStatus::Paused => {
                if self.device.current_job_id().as_deref() != Some(id) {
                    return Err(JobError::DeviceFailure(format!(
                        "job {id} is {} but has no live device operation",
                        job.status
                    )));
                }
                if !self.device.cancel().await {
                    return Err(JobError::DeviceFailure(format!("device did not stop job {id}")));
                }
                self.queue.update_status(id, StatusUpdate::cancelled()).await
            }
            status => Err(JobError::InvalidState(format!("cannot cancel job in {status} state"))),
        }
    }

    /// Cancels whatever job the device is running.
    pub async fn cancel_current(&self) -> Result<Job, JobError> {
        let Some(job_id) = self.device.current_job_id() else {
            return Err(JobError::InvalidState("no active job to cancel".to_string()));
        };
        self.cancel_job(&job_id).await
    }

    pub async fn delete_job(&self, id: &str) -> Result<(), JobError> {
        if self.queue.delete_job(id).await? {
            Ok(())
        } else {
            Err(JobError::NotFound(id.to_string()))
        }
    }

    pub fn pause(&self) -> Result<(), JobError> {
        if self.device.state() != DeviceState::Busy {
            return Err(JobError::InvalidState("no active job to pause".to_string()));
        }
        control(self.device.pause())
    }

    pub fn resume(&self) -> Result<(), JobError> {
        if self.device.state() != DeviceState::Paused {
            return Err(JobError::InvalidState("plotter is not paused".to_string()));
        }
        control(self.device.resume())
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.device.status()
    }

    pub async fn check_connection(&self) -> ConnectionInfo {
        self.device.check_connection().await
    }

    pub async fn health(&self) -> Result<HealthResponse, JobError> {
        Ok(HealthResponse {
            status: "healthy".to_string(),
            uptime: self.device.uptime().as_secs(),
            queue_size: self.queue.queue_size().await?,
            plotter_connected: self.device.is_connected(),
            version: VERSION.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Startup step: settles jobs a previous process left `running`.
    pub async fn recover_orphans(&self, policy: OrphanPolicy) -> Result<usize, JobError> {
        let mut pending = self.gate.lock().await;
        self.settle_pending(&mut pending).await?;
        self.queue.recover_orphans(policy).await
    }
}

fn control(result: ControlResult) -> Result<(), JobError> {
    match result {
        ControlResult::Applied => Ok(()),
        ControlResult::Unsupported(operation) => Err(JobError::Unsupported(operation.to_string())),
    }
}
