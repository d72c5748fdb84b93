//! Provider-reported instance state
//!
//! An [`Instance`] is the ephemeral view a cloud backend reports for a
//! workspace. It is recomputed on every list/get call and never persisted;
//! the registry record is the durable half of a workspace.

use serde::{Deserialize, Serialize};

/// Status of a provider instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Workload is up and reachable
    Running,
    /// Scaled to zero / task stopped, recoverable via resume
    Stopped,
    /// Registered but the provider resource is missing or not serving
    Unavailable,
    /// Provider is tearing the workload down
    Terminating,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Running => write!(f, "RUNNING"),
            InstanceStatus::Stopped => write!(f, "STOPPED"),
            InstanceStatus::Unavailable => write!(f, "UNAVAILABLE"),
            InstanceStatus::Terminating => write!(f, "TERMINATING"),
        }
    }
}

/// A single provider-reported workload instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub status: InstanceStatus,
    /// Externally reachable address, when the provider exposes one
    pub ip: Option<String>,
    /// Provider handle: task ARN, service id, or Kubernetes object name
    pub handle: Option<String>,
}

impl Instance {
    pub fn new(name: impl Into<String>, status: InstanceStatus) -> Self {
        Self {
            name: name.into(),
            status,
            ip: None,
            handle: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(InstanceStatus::Running.to_string(), "RUNNING");
        assert_eq!(InstanceStatus::Unavailable.to_string(), "UNAVAILABLE");
    }

    #[test]
    fn test_status_serde_roundtrip() {
        let json = serde_json::to_string(&InstanceStatus::Terminating).unwrap();
        assert_eq!(json, "\"TERMINATING\"");
        let back: InstanceStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InstanceStatus::Terminating);
    }
}
