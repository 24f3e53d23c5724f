use super::{JobStore, not_deletable};
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use plotq_shared::{Job, JobError, JobStatus, NewJob, StatusUpdate};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Table {
    jobs: HashMap<String, Job>,
    next_seq: i64,
}

impl Table {
    fn queued(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(|job| job.status == JobStatus::Queued)
    }
}

/// Non-durable store for tests and throwaway instances.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<Table>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, JobError> {
        let mut table = self.inner.lock().await;
        table.next_seq += 1;
        let job = job.into_job(table.next_seq);
        table.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, JobError> {
        Ok(self.inner.lock().await.jobs.get(id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobError> {
        let table = self.inner.lock().await;
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.fifo_key().cmp(&a.fifo_key()));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn next_queued(&self) -> Result<Option<Job>, JobError> {
        let table = self.inner.lock().await;
        Ok(table.queued().min_by_key(|job| job.fifo_key()).cloned())
    }

    async fn queue_position(&self, id: &str) -> Result<usize, JobError> {
        let table = self.inner.lock().await;
        let Some(job) = table.jobs.get(id).filter(|job| job.status == JobStatus::Queued) else {
            return Ok(0);
        };
        let key = job.fifo_key();
        Ok(table.queued().filter(|other| other.fifo_key() <= key).count())
    }

    async fn count(&self, status: JobStatus) -> Result<usize, JobError> {
        let table = self.inner.lock().await;
        Ok(table.jobs.values().filter(|job| job.status == status).count())
    }

    async fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<Job, JobError> {
        let mut table = self.inner.lock().await;
        let job = table.jobs.get_mut(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let mut updated = job.clone();
        updated.apply(update, Utc::now().trunc_subsecs(6))?;
        *job = updated.clone();
        Ok(updated)
    }

    async fn remove(&self, id: &str) -> Result<Option<Job>, JobError> {
        let mut table = self.inner.lock().await;
        let Some(job) = table.jobs.get(id) else {
            return Ok(None);
        };
        if job.status.is_active() {
            return Err(not_deletable(job));
        }
        Ok(table.jobs.remove(id))
    }
}
