//! Plotter job queue host: job store, device controller, dispatch worker and HTTP API.

pub mod device;
pub mod file_manager;
pub mod host;
pub mod queue;
pub mod store;
pub mod web;
pub mod worker;
