//! Data models for API requests and responses.

use crate::job::{Job, JobParameters, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents a job as returned by the jobs endpoints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobResponse {
    pub job_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub parameters: JobParameters,
    /// 1-indexed queue position, only present for queued jobs.
    pub position: Option<usize>,
}

impl JobResponse {
    pub fn from_job(job: Job, position: Option<usize>) -> Self {
        Self {
            job_id: job.id,
            filename: job.filename,
            status: job.status,
            progress: job.progress,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error,
            parameters: job.parameters,
            position,
        }
    }
}

/// Represents the response to a job submission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobSubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub position: usize,
}

/// Query string of the job listing endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub uptime: u64,
    pub queue_size: usize,
    pub plotter_connected: bool,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
