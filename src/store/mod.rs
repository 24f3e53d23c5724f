//! Durable job table behind a swappable trait.
//!
//! The queue is not a separate list: a job is "in the queue" while its status
//! column says `queued`, and FIFO order is `(created_at, seq)`. Both the next job
//! and a job's position are range queries against the one table.

mod memory;
mod sqlite;

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use plotq_shared::{Job, JobError, JobStatus, NewJob, StatusUpdate};

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Inserts a queued job and assigns its insertion sequence.
    async fn insert(&self, job: NewJob) -> Result<Job, JobError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, JobError>;

    /// Newest first, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobError>;

    /// Oldest queued job by `(created_at, seq)`.
    async fn next_queued(&self) -> Result<Option<Job>, JobError>;

    /// 1-indexed position among queued jobs, 0 when the job is not queued.
    async fn queue_position(&self, id: &str) -> Result<usize, JobError>;

    async fn count(&self, status: JobStatus) -> Result<usize, JobError>;

    /// Reads, applies and writes the update as one atomic step.
    async fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<Job, JobError>;

    /// Removes the record and returns it. Fails with `InvalidState` for active jobs,
    /// returns `None` for unknown ids.
    async fn remove(&self, id: &str) -> Result<Option<Job>, JobError>;
}

pub(crate) fn not_deletable(job: &Job) -> JobError {
    JobError::InvalidState(format!("cannot delete {} job {}; cancel it first", job.status, job.id))
}
