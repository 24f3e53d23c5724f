//! Device session types: the logical state of the single plotter.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Idle,
    Busy,
    Paused,
    Error,
    Disconnected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Idle => "idle",
            DeviceState::Busy => "busy",
            DeviceState::Paused => "paused",
            DeviceState::Error => "error",
            DeviceState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Result of the last connectivity probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub model: Option<String>,
    pub firmware: Option<String>,
}

impl ConnectionInfo {
    pub fn disconnected() -> Self {
        Self::default()
    }
}

/// Snapshot of the device session, also served as-is by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub state: DeviceState,
    pub current_job: Option<String>,
    pub connected: bool,
    pub model: Option<String>,
    pub firmware: Option<String>,
    /// Seconds since the controller was created.
    pub uptime: u64,
    pub jobs_completed: u64,
}

/// How a device run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// Non-zero exit, timeout or spawn error, with diagnostic text.
    Failure(String),
    /// Stopped on request through `cancel`.
    Cancelled,
}

/// Result of a device control request that the hardware may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResult {
    Applied,
    /// The device tool has no primitive for this operation.
    Unsupported(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&DeviceState::Disconnected).unwrap(), "\"disconnected\"");
        assert_eq!(DeviceState::Busy.to_string(), "busy");
    }

    #[test]
    fn disconnected_info_has_no_details() {
        let info = ConnectionInfo::disconnected();
        assert!(!info.connected);
        assert!(info.model.is_none() && info.firmware.is_none());
    }
}
