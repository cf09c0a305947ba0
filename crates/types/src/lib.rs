//! Shared type definitions for the Corral workspace.
//!
//! Everything here is transient and process-local: node names, retry
//! policies, per-attempt outcomes and the instance descriptions exchanged
//! with compute providers.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod instance;
pub mod retry;

pub use instance::{InstanceRecord, InstanceSpec, InstanceState};
pub use retry::{AttemptError, FailureKind, Observation, OperationResult, PolicyError, ReadinessTarget, RetryPolicy};

/// Role a node plays in a test cluster.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// The Rancher control-plane node.
    Server,
    /// A worker node registered with the server.
    Agent,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministically derived name of a cloud compute node.
///
/// The name is assembled as `[{prefix}-]{version}-{os}-vtest-{role}{index}`:
/// dots in the prefix become dashes, dots are stripped from the version and
/// an empty prefix is omitted entirely.
///
/// ```rust
/// use corral_types::{NodeName, NodeRole};
///
/// let name = NodeName::new("ci.7", "v1.6.0", "ubuntu-1604", NodeRole::Server, 0);
/// assert_eq!(name.as_str(), "ci-7-v160-ubuntu-1604-vtest-server0");
/// ```
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(prefix: &str, version: &str, os: &str, role: NodeRole, index: u32) -> Self {
        let prefix = prefix.trim().replace('.', "-");
        let version = version.trim().replace('.', "");
        let mut name = String::new();
        if !prefix.is_empty() {
            name.push_str(&prefix);
            name.push('-');
        }
        name.push_str(&format!("{}-{}-vtest-{}{}", version, os.trim(), role, index));
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
