//! Error taxonomy surfaced by the engine.

use std::time::Duration;

use corral_types::{AttemptError, InstanceState, Observation, PolicyError, ReadinessTarget};
use corral_util::{ConfigError, HandoffError};
use thiserror::Error;

/// Every way a Corral operation can end unsuccessfully.
///
/// The variants keep enough context (operation name, attempt counts, last
/// captured output) for a CI log to explain the failure on its own.
#[derive(Debug, Error)]
pub enum CorralError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{operation} did not succeed after {attempts} attempt(s) in {elapsed:?}: {last_output}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        last_output: String,
    },

    #[error("{operation} failed on attempt {attempts} with a non-retryable error: {source}")]
    NonRetryable {
        operation: String,
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    #[error(
        "timed out waiting for {what} to reach {target} after {attempts} poll(s) in {elapsed:?} (last observed: {})",
        .last_observed.map(|observation| observation.to_string()).unwrap_or_else(|| "nothing".to_string())
    )]
    ReadinessTimeout {
        what: String,
        target: ReadinessTarget,
        last_observed: Option<Observation>,
        attempts: u32,
        elapsed: Duration,
        last_error: Option<String>,
    },

    #[error("provisioning '{name}' failed: {detail}")]
    ProvisioningFailed { name: String, detail: String },

    #[error("'{name}' already exists (state: {state})")]
    AlreadyExists { name: String, state: InstanceState },

    #[error("'{name}' was not found")]
    NotFound { name: String },

    #[error("teardown of '{name}' is incomplete: {}", .failures.join("; "))]
    TeardownIncomplete { name: String, failures: Vec<String> },

    #[error("`{command}` failed: {diagnostic}")]
    Command { command: String, diagnostic: String },

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

impl CorralError {
    /// Captured output worth printing below the one-line summary.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::RetryExhausted { last_output, .. } => Some(last_output),
            Self::ReadinessTimeout { last_error, .. } => last_error.as_deref(),
            Self::Command { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }

    /// Whether the failure was a provider-reported absence.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::NonRetryable { source, .. } => matches!(source.kind, corral_types::FailureKind::NotFound),
            _ => false,
        }
    }
}

impl From<PolicyError> for CorralError {
    fn from(error: PolicyError) -> Self {
        Self::Configuration(error.to_string())
    }
}

impl From<ConfigError> for CorralError {
    fn from(error: ConfigError) -> Self {
        Self::Configuration(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_timeout_names_the_last_observation() {
        let error = CorralError::ReadinessTimeout {
            what: "agents active".into(),
            target: ReadinessTarget::AtLeast(3),
            last_observed: Some(Observation::Count(2)),
            attempts: 5,
            elapsed: Duration::from_secs(1),
            last_error: None,
        };
        let message = error.to_string();
        assert!(message.contains("agents active"), "{message}");
        assert!(message.contains("last observed: 2"), "{message}");

        let never_observed = CorralError::ReadinessTimeout {
            what: "server".into(),
            target: ReadinessTarget::Flag,
            last_observed: None,
            attempts: 1,
            elapsed: Duration::ZERO,
            last_error: Some("connection refused".into()),
        };
        assert!(never_observed.to_string().contains("last observed: nothing"));
        assert_eq!(never_observed.diagnostic(), Some("connection refused"));
    }

    #[test]
    fn teardown_lists_every_failure() {
        let error = CorralError::TeardownIncomplete {
            name: "agents".into(),
            failures: vec!["a: boom".into(), "b: bang".into()],
        };
        assert_eq!(error.to_string(), "teardown of 'agents' is incomplete: a: boom; b: bang");
    }

    #[test]
    fn not_found_covers_provider_absence() {
        let provider_absence = CorralError::NonRetryable {
            operation: "terminate x".into(),
            attempts: 1,
            source: AttemptError::not_found("Host does not exist: \"x\""),
        };
        assert!(provider_absence.is_not_found());
        assert!(CorralError::NotFound { name: "x".into() }.is_not_found());
        assert!(!CorralError::Configuration("bad".into()).is_not_found());
    }
}
