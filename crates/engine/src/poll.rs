//! Readiness polling on top of [`retry`].
//!
//! A predicate is sampled once per tick. An observation that does not meet
//! the target counts as a transient failure, so pacing, bounds and
//! non-retryable short-circuiting all come from the retry loop.

use std::time::Instant;

use corral_types::{AttemptError, Observation, ReadinessTarget, RetryPolicy};
use tracing::info;

use crate::{CorralError, retry};

/// Sample `predicate` until its observation satisfies `target`.
///
/// Returns the satisfying observation. On exhaustion the error carries the
/// last value that was observed, if any tick produced one.
pub fn poll_until<F>(what: &str, policy: &RetryPolicy, target: ReadinessTarget, mut predicate: F) -> Result<Observation, CorralError>
where
    F: FnMut() -> Result<Observation, AttemptError>,
{
    let started = Instant::now();
    let mut last_observed: Option<Observation> = None;

    let outcome = retry(what, policy, || {
        let observation = predicate()?;
        last_observed = Some(observation);
        if target.is_satisfied_by(observation) {
            Ok(observation)
        } else {
            Err(AttemptError::transient(format!("{what}: observed {observation}, waiting for {target}")))
        }
    });

    match outcome {
        Ok(observation) => {
            info!(what, observed = %observation, elapsed_ms = started.elapsed().as_millis() as u64, "ready");
            Ok(observation)
        }
        Err(CorralError::RetryExhausted {
            attempts,
            elapsed,
            last_output,
            ..
        }) => Err(CorralError::ReadinessTimeout {
            what: what.to_string(),
            target,
            last_observed,
            attempts,
            elapsed,
            last_error: Some(last_output),
        }),
        Err(other) => Err(other),
    }
}

/// Poll a boolean readiness check until it reports `true`.
pub fn wait_for_flag<F>(what: &str, policy: &RetryPolicy, mut predicate: F) -> Result<(), CorralError>
where
    F: FnMut() -> Result<bool, AttemptError>,
{
    poll_until(what, policy, ReadinessTarget::Flag, || predicate().map(Observation::Flag)).map(|_| ())
}

/// Poll a counter until it reaches at least `target`; returns the final count.
pub fn wait_for_count<F>(what: &str, policy: &RetryPolicy, target: u64, mut predicate: F) -> Result<u64, CorralError>
where
    F: FnMut() -> Result<u64, AttemptError>,
{
    match poll_until(what, policy, ReadinessTarget::AtLeast(target), || predicate().map(Observation::Count))? {
        Observation::Count(count) => Ok(count),
        Observation::Flag(_) => Ok(target),
    }
}
