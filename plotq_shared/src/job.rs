//! Job records, the job status state machine and plotting parameters.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Device is busy")]
    DeviceBusy,
    #[error("Queue is full (max {0} jobs)")]
    QueueFull(usize),
    #[error("Storage error: {0}")]
    Storage(String), // String keeps rusqlite/io types out of the shared crate
    #[error("Device failure: {0}")]
    DeviceFailure(String),
    #[error("{0} is not supported by the device")]
    Unsupported(String),
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Storage(format!("parameter blob: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Running or paused: a device operation may still be attached to the job.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Queued => matches!(next, Running | Cancelled),
            Running => matches!(next, Running | Paused | Completed | Failed | Cancelled),
            Paused => matches!(next, Running | Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(JobError::Storage(format!("unknown job status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("layers may only contain digits, commas and spaces")]
    LayerSyntax,
    #[error("layers must be at most 100 characters")]
    LayerLength,
    #[error("speed must be between 1 and 100, got {0}")]
    Speed(u32),
    #[error("{name} must be between 0 and 5000 ms, got {value}")]
    PenDelay { name: &'static str, value: u32 },
    #[error("timeout must be between 1 and 86400 seconds, got {0}")]
    Timeout(u64),
}

pub const MAX_LAYERS_LEN: usize = 100;
pub const MAX_PEN_DELAY_MS: u32 = 5000;
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Plotting configuration captured at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    /// Comma-separated layer ids, e.g. "1,2,3".
    #[serde(default)]
    pub layers: Option<String>,
    /// Pen-down speed, 1-100.
    #[serde(default = "default_speed")]
    pub speed: u32,
    /// Milliseconds.
    #[serde(default = "default_pen_delay")]
    pub pen_up_delay: u32,
    /// Milliseconds.
    #[serde(default = "default_pen_delay")]
    pub pen_down_delay: u32,
    /// Simulate without moving the pen.
    #[serde(default)]
    pub preview: bool,
    /// Seconds the device tool may run before it is stopped.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_speed() -> u32 { 25 }
fn default_pen_delay() -> u32 { 150 }
fn default_timeout() -> u64 { 3600 }

impl Default for JobParameters {
    fn default() -> Self {
        Self {
            layers: None,
            speed: default_speed(),
            pen_up_delay: default_pen_delay(),
            pen_down_delay: default_pen_delay(),
            preview: false,
            timeout: default_timeout(),
        }
    }
}

impl JobParameters {
    pub fn validate(&self) -> Result<(), ParameterError> {
        if let Some(layers) = &self.layers {
            if layers.len() > MAX_LAYERS_LEN {
                return Err(ParameterError::LayerLength);
            }
            if !layers.chars().all(|c| c.is_ascii_digit() || c == ',' || c.is_whitespace()) {
                return Err(ParameterError::LayerSyntax);
            }
        }
        if !(1..=100).contains(&self.speed) {
            return Err(ParameterError::Speed(self.speed));
        }
        for (name, value) in [("pen_up_delay", self.pen_up_delay), ("pen_down_delay", self.pen_down_delay)] {
            if value > MAX_PEN_DELAY_MS {
                return Err(ParameterError::PenDelay { name, value });
            }
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout) {
            return Err(ParameterError::Timeout(self.timeout));
        }
        Ok(())
    }

    /// Layer filter with surrounding whitespace removed; `None` when empty.
    pub fn layer_filter(&self) -> Option<&str> {
        self.layers.as_deref().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// A job that has not been stored yet. The store assigns the insertion sequence.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub filename: String,
    pub filepath: PathBuf,
    pub created_at: DateTime<Utc>,
    pub parameters: JobParameters,
}

impl NewJob {
    pub fn new(filename: impl Into<String>, filepath: impl Into<PathBuf>, parameters: JobParameters) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.into(),
            filepath: filepath.into(),
            // stores keep microsecond precision
            created_at: Utc::now().trunc_subsecs(6),
            parameters,
        }
    }

    pub fn into_job(self, seq: i64) -> Job {
        Job {
            id: self.id,
            seq,
            filename: self.filename,
            filepath: self.filepath,
            status: JobStatus::Queued,
            progress: 0,
            created_at: self.created_at,
            started_at: None,
            completed_at: None,
            error: None,
            parameters: self.parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Insertion sequence; breaks `created_at` ties in FIFO order.
    pub seq: i64,
    pub filename: String,
    pub filepath: PathBuf,
    pub status: JobStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub parameters: JobParameters,
}

impl Job {
    /// FIFO ordering key.
    pub fn fifo_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.seq)
    }

    /// Applies a status update in place, stamping `started_at`/`completed_at` the first time
    /// the job enters `Running` or a terminal state. On error the job is left untouched.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<(), JobError> {
        if self.status.is_terminal() {
            return Err(JobError::InvalidState(format!(
                "job {} is already {} and cannot change",
                self.id, self.status
            )));
        }
        if !self.status.can_transition_to(update.status) {
            return Err(JobError::InvalidState(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, update.status
            )));
        }

        if let Some(progress) = update.progress {
            let progress = progress.min(100);
            self.progress = if self.status == JobStatus::Running && update.status == JobStatus::Running {
                self.progress.max(progress)
            } else {
                progress
            };
        }
        if update.status == JobStatus::Failed {
            if let Some(error) = &update.error {
                self.error = Some(error.clone());
            }
        }
        if update.status == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if update.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.status = update.status;
        Ok(())
    }
}

/// Requested transition for `Job::apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self { status, progress: None, error: None }
    }

    pub fn running() -> Self {
        Self { progress: Some(0), ..Self::new(JobStatus::Running) }
    }

    pub fn progress(progress: u8) -> Self {
        Self { progress: Some(progress), ..Self::new(JobStatus::Running) }
    }

    pub fn completed() -> Self {
        Self { progress: Some(100), ..Self::new(JobStatus::Completed) }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { error: Some(error.into()), ..Self::new(JobStatus::Failed) }
    }

    pub fn cancelled() -> Self {
        Self::new(JobStatus::Cancelled)
    }
}
