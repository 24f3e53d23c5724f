// plotq_shared: job, device and configuration types shared by the host, its web layer and tests

pub mod api_models;
pub mod config;
pub mod device;
pub mod job;

pub use device::{ConnectionInfo, ControlResult, DeviceState, DeviceStatus, RunOutcome};
pub use job::{Job, JobError, JobParameters, JobStatus, NewJob, ParameterError, StatusUpdate};
