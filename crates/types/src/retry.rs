//! Retry and readiness primitives shared by the engine and its collaborators.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounds and pacing for a retry or polling loop.
///
/// At least one of `max_attempts` or `timeout` must be set; see
/// [`RetryPolicy::validate`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, counting the first one.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget measured from just before the first attempt.
    pub timeout: Option<Duration>,
    /// Pause between consecutive attempts. Zero is legal but busy-loops.
    pub step_delay: Duration,
}

impl RetryPolicy {
    /// Policy bounded by an attempt count.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            timeout: None,
            step_delay: Duration::ZERO,
        }
    }

    /// Policy bounded by a wall-clock deadline.
    pub fn deadline(timeout: Duration) -> Self {
        Self {
            max_attempts: None,
            timeout: Some(timeout),
            step_delay: Duration::ZERO,
        }
    }

    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject policies that could loop forever or never run at all.
    pub fn validate(&self) -> Result<(), PolicyError> {
        match (self.max_attempts, self.timeout) {
            (None, None) => Err(PolicyError::Unbounded),
            (Some(0), _) => Err(PolicyError::ZeroAttempts),
            (_, Some(timeout)) if timeout.is_zero() => Err(PolicyError::ZeroTimeout),
            _ => Ok(()),
        }
    }

    /// True when consecutive attempts would run back to back.
    pub fn is_busy_loop(&self) -> bool {
        self.step_delay.is_zero()
    }
}

/// Invalid [`RetryPolicy`] configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("retry policy needs max_attempts or timeout; refusing to loop forever")]
    Unbounded,
    #[error("retry policy max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("retry policy timeout must be greater than zero")]
    ZeroTimeout,
}

/// How a single failed attempt should be treated by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection refused, 5xx, "not ready yet": worth trying again.
    Transient,
    /// The addressed resource does not exist.
    NotFound,
    /// Malformed request, authorization failure, quota exceeded.
    Fatal,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Structured failure reported by a collaborator for one attempt.
///
/// The collaborator decides the [`FailureKind`]; callers never inspect the
/// message text to classify it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct AttemptError {
    pub kind: FailureKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Outcome of one attempt, kept only until it is folded into the loop result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub succeeded: bool,
    /// Diagnostic output captured from the attempt.
    pub output: String,
    pub error: Option<AttemptError>,
}

impl OperationResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: AttemptError) -> Self {
        Self {
            succeeded: false,
            output: error.message.clone(),
            error: Some(error),
        }
    }
}

/// Value observed by a readiness predicate on one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observation {
    Flag(bool),
    Count(u64),
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(value) => write!(f, "{value}"),
            Self::Count(value) => write!(f, "{value}"),
        }
    }
}

/// What a readiness predicate must observe to count as ready.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessTarget {
    /// `Flag(true)` is ready.
    #[default]
    Flag,
    /// `Count(n)` with `n >= target` is ready.
    AtLeast(u64),
}

impl ReadinessTarget {
    pub fn is_satisfied_by(&self, observation: Observation) -> bool {
        match (self, observation) {
            (Self::Flag, Observation::Flag(value)) => value,
            (Self::AtLeast(target), Observation::Count(count)) => count >= *target,
            (Self::Flag, Observation::Count(count)) => count > 0,
            (Self::AtLeast(_), Observation::Flag(_)) => false,
        }
    }
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag => f.write_str("true"),
            Self::AtLeast(target) => write!(f, ">= {target}"),
        }
    }
}
