// src/queue.rs - business rules over the job store
use crate::file_manager::FileManager;
use crate::store::JobStore;
use plotq_shared::config::OrphanPolicy;
use plotq_shared::{Job, JobError, JobParameters, JobStatus, NewJob, StatusUpdate};
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const ORPHAN_ERROR: &str = "interrupted by service restart";

/// Job creation, status transitions, FIFO position and deletion with file cleanup.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    files: FileManager,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>, files: FileManager) -> Self {
        Self { store, files }
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    pub async fn create_job(
        &self,
        filename: &str,
        filepath: impl Into<PathBuf>,
        parameters: JobParameters,
    ) -> Result<Job, JobError> {
        let job = self.store.insert(NewJob::new(filename, filepath, parameters)).await?;
        tracing::info!(job_id = %job.id, "Created job: {}", filename);
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, JobError> {
        self.store.get(id).await?.ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobError> {
        self.store.list(status, limit).await
    }

    pub async fn next_queued_job(&self) -> Result<Option<Job>, JobError> {
        self.store.next_queued().await
    }

    pub async fn queue_position(&self, id: &str) -> Result<usize, JobError> {
        self.store.queue_position(id).await
    }

    /// Position for queued jobs, `None` otherwise.
    pub async fn position_of(&self, job: &Job) -> Result<Option<usize>, JobError> {
        if job.status != JobStatus::Queued {
            return Ok(None);
        }
        Ok(Some(self.queue_position(&job.id).await?))
    }

    pub async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<Job, JobError> {
        let job = self.store.update_status(id, &update).await?;
        tracing::info!(job_id = %id, status = %job.status, progress = job.progress, "Updated job");
        Ok(job)
    }

    /// Deletes the record and, best-effort, its input file. `Ok(false)` for unknown ids.
    pub async fn delete_job(&self, id: &str) -> Result<bool, JobError> {
        let Some(job) = self.store.remove(id).await? else {
            return Ok(false);
        };
        self.files.remove_file(&job.filepath).await;
        tracing::info!(job_id = %id, "Deleted job");
        Ok(true)
    }

    pub async fn queue_size(&self) -> Result<usize, JobError> {
        self.store.count(JobStatus::Queued).await
    }

    /// Resolves jobs left `running` by a previous process. Returns how many were changed.
    pub async fn recover_orphans(&self, policy: OrphanPolicy) -> Result<usize, JobError> {
        let orphans = self.store.list(Some(JobStatus::Running), usize::MAX).await?;
        if orphans.is_empty() {
            return Ok(0);
        }
        match policy {
            OrphanPolicy::Keep => {
                tracing::warn!("{} job(s) left running by a previous run; keeping them as is", orphans.len());
                Ok(0)
            }
            OrphanPolicy::Fail => {
                for job in &orphans {
                    tracing::warn!(job_id = %job.id, "Failing orphaned running job");
                    self.store.update_status(&job.id, &StatusUpdate::failed(ORPHAN_ERROR)).await?;
                }
                Ok(orphans.len())
            }
        }
    }
}
