//! Bounded retry executor.
//!
//! [`retry`] runs an operation until it succeeds, fails with a
//! non-retryable error, or the policy's attempt/time budget runs out. The
//! budget is checked before every attempt against a monotonic clock that
//! starts before the first one, and the pause between attempts is clamped to
//! whatever time remains.

use std::{
    thread,
    time::{Duration, Instant},
};

use corral_types::{AttemptError, OperationResult, RetryPolicy};
use tracing::{debug, info, warn};

use crate::CorralError;

/// Attempt and wall-clock budget of one [`retry`] call.
#[derive(Debug)]
struct Budget {
    started: Instant,
    max_attempts: Option<u32>,
    timeout: Option<Duration>,
    step_delay: Duration,
}

impl Budget {
    fn start(policy: &RetryPolicy) -> Self {
        Self {
            started: Instant::now(),
            max_attempts: policy.max_attempts,
            timeout: policy.timeout,
            step_delay: policy.step_delay,
        }
    }

    fn allows(&self, attempts_made: u32) -> bool {
        let attempts_left = self.max_attempts.is_none_or(|max| attempts_made < max);
        let time_left = self.timeout.is_none_or(|timeout| self.started.elapsed() < timeout);
        attempts_left && time_left
    }

    fn pause(&self) -> Duration {
        match self.timeout {
            Some(timeout) => self.step_delay.min(timeout.saturating_sub(self.started.elapsed())),
            None => self.step_delay,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Run `operation` under `policy`.
///
/// Transient failures are retried; any other [`corral_types::FailureKind`]
/// ends the loop immediately with [`CorralError::NonRetryable`]. With
/// `max_attempts = N` the operation runs at most `N` times, and with a
/// `timeout` the loop returns no later than `timeout + step_delay` after it
/// started (plus the duration of an attempt already in flight).
///
/// A policy with neither bound is rejected before the operation runs.
///
/// The operation may run more than once, so it must be safe to repeat: a
/// retried attempt has to tolerate whatever a failed earlier attempt left
/// behind.
pub fn retry<T, F>(operation: &str, policy: &RetryPolicy, mut attempt: F) -> Result<T, CorralError>
where
    F: FnMut() -> Result<T, AttemptError>,
{
    policy.validate()?;
    if policy.is_busy_loop() {
        warn!(operation, "retry policy has no step delay; attempts run back to back");
    }

    let budget = Budget::start(policy);
    let mut attempts = 0u32;
    let mut last = OperationResult {
        output: "no attempt ran".to_string(),
        ..OperationResult::default()
    };

    while budget.allows(attempts) {
        if attempts > 0 {
            thread::sleep(budget.pause());
            if !budget.allows(attempts) {
                break;
            }
        }

        attempts += 1;
        match attempt() {
            Ok(value) => {
                if attempts > 1 {
                    info!(operation, attempts, elapsed_ms = budget.elapsed().as_millis() as u64, "succeeded after retrying");
                }
                return Ok(value);
            }
            Err(error) if error.is_retryable() => {
                debug!(operation, attempt = attempts, error = %error, "attempt failed; will retry");
                last = OperationResult::failure(error);
            }
            Err(error) => {
                warn!(operation, attempt = attempts, kind = ?error.kind, error = %error, "attempt failed; not retrying");
                return Err(CorralError::NonRetryable {
                    operation: operation.to_string(),
                    attempts,
                    source: error,
                });
            }
        }
    }

    let elapsed = budget.elapsed();
    warn!(operation, attempts, elapsed_ms = elapsed.as_millis() as u64, "retry budget exhausted");
    Err(CorralError::RetryExhausted {
        operation: operation.to_string(),
        attempts,
        elapsed,
        last_output: last.output,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use corral_types::FailureKind;

    use super::*;

    #[test]
    fn exhausts_exactly_max_attempts() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::attempts(4);
        let result: Result<(), _> = retry("always failing", &policy, || {
            calls.set(calls.get() + 1);
            Err(AttemptError::transient(format!("failure {}", calls.get())))
        });

        assert_eq!(calls.get(), 4);
        match result {
            Err(CorralError::RetryExhausted {
                attempts, last_output, ..
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_output, "failure 4");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn returns_the_first_success() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::attempts(5).with_step_delay(Duration::from_millis(1));
        let value = retry("third time lucky", &policy, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(AttemptError::transient("connection refused"))
            } else {
                Ok("ready")
            }
        })
        .unwrap();

        assert_eq!(value, "ready");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn time_bound_stops_within_timeout_plus_one_step() {
        let timeout = Duration::from_millis(120);
        let step = Duration::from_millis(50);
        let policy = RetryPolicy::deadline(timeout).with_step_delay(step);
        let started = Instant::now();
        let result: Result<(), _> = retry("never ready", &policy, || Err(AttemptError::transient("not yet")));
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(CorralError::RetryExhausted { .. })));
        assert!(elapsed >= timeout, "{elapsed:?}");
        assert!(elapsed < timeout + step + Duration::from_millis(100), "{elapsed:?}");
    }

    #[test]
    fn unbounded_policy_never_invokes_the_operation() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy {
            max_attempts: None,
            timeout: None,
            step_delay: Duration::ZERO,
        };
        let result: Result<(), _> = retry("unbounded", &policy, || {
            calls.set(calls.get() + 1);
            Ok(())
        });

        assert!(matches!(result, Err(CorralError::Configuration(_))));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn fatal_and_not_found_errors_stop_immediately() {
        for kind in [FailureKind::Fatal, FailureKind::NotFound] {
            let calls = Cell::new(0u32);
            let policy = RetryPolicy::attempts(10);
            let result: Result<(), _> = retry("rejected", &policy, || {
                calls.set(calls.get() + 1);
                Err(AttemptError::new(kind, "403 Forbidden"))
            });

            assert_eq!(calls.get(), 1);
            match result {
                Err(CorralError::NonRetryable { attempts, source, .. }) => {
                    assert_eq!(attempts, 1);
                    assert_eq!(source.kind, kind);
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn attempt_cap_wins_over_a_long_deadline() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::attempts(2).with_timeout(Duration::from_secs(60));
        let started = Instant::now();
        let _ = retry::<(), _>("capped", &policy, || {
            calls.set(calls.get() + 1);
            Err(AttemptError::transient("busy"))
        });

        assert_eq!(calls.get(), 2);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
