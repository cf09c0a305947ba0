//! Compute instance descriptions exchanged with providers.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// What to create for a named node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_type: String,
    pub ami: String,
    pub region: String,
    pub zone: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group: String,
    /// Tags applied after creation, in insertion order.
    #[serde(default)]
    pub tags: IndexMap<String, String>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub root_size_gb: Option<u32>,
}

/// Provisioning state reported by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Error,
    Unknown(String),
}

impl InstanceState {
    /// Parse a provider state string (`docker-machine status` or EC2 state name).
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "starting" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" | "paused" | "saved" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "error" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Pending or running: a resource occupying its name.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// On its way out or already gone; its name may be reused.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
            Self::ShuttingDown => f.write_str("shutting-down"),
            Self::Terminated => f.write_str("terminated"),
            Self::Error => f.write_str("error"),
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// A compute resource as last seen by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub state: InstanceState,
    #[serde(default)]
    pub address: Option<String>,
    /// Whether the provider confirmed the tags were applied.
    #[serde(default)]
    pub tagged: bool,
}

impl InstanceRecord {
    pub fn new(name: impl Into<String>, state: InstanceState) -> Self {
        Self {
            name: name.into(),
            state,
            address: None,
            tagged: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_machine_and_ec2_states() {
        assert_eq!(InstanceState::parse("Running\n"), InstanceState::Running);
        assert_eq!(InstanceState::parse("Stopped"), InstanceState::Stopped);
        assert_eq!(InstanceState::parse("shutting-down"), InstanceState::ShuttingDown);
        assert_eq!(InstanceState::parse("Starting"), InstanceState::Pending);
        assert_eq!(InstanceState::parse("Timeout"), InstanceState::Unknown("timeout".into()));
    }

    #[test]
    fn live_and_gone_are_disjoint() {
        for state in [
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Stopped,
            InstanceState::ShuttingDown,
            InstanceState::Terminated,
        ] {
            assert!(!(state.is_live() && state.is_gone()), "{state} is both live and gone");
        }
    }
}
