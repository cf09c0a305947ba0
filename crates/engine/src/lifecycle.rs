//! Idempotent create / wait / destroy of named compute nodes.
//!
//! [`Lifecycle`] sits on top of a [`ComputeProvider`] and turns its
//! primitive calls into two operations: [`Lifecycle::ensure`] (look up,
//! create if absent, tag, wait until running) and
//! [`Lifecycle::deprovision`] (look up, terminate, release credentials).
//! Provider calls are retried only for transient failures, and a retried
//! create first re-checks whether an earlier attempt already made the node.

use std::time::Duration;

use corral_types::{AttemptError, InstanceRecord, InstanceSpec, InstanceState, Observation, ReadinessTarget, RetryPolicy};
use corral_util::Timeouts;
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::{CorralError, poll_until, retry};

const PROVIDER_CALL_ATTEMPTS: u32 = 3;

/// Primitive operations a compute backend exposes for named nodes.
///
/// Implementations classify their own failures: an absent node is reported
/// as `Ok(None)` from [`find`](ComputeProvider::find) and as
/// [`corral_types::FailureKind::NotFound`] everywhere else.
pub trait ComputeProvider {
    fn find(&self, name: &str) -> Result<Option<InstanceRecord>, AttemptError>;
    fn create(&self, name: &str, spec: &InstanceSpec) -> Result<InstanceRecord, AttemptError>;
    fn tag(&self, name: &str, tags: &IndexMap<String, String>) -> Result<(), AttemptError>;
    fn start(&self, name: &str) -> Result<(), AttemptError>;
    fn state(&self, name: &str) -> Result<InstanceState, AttemptError>;
    /// Public address other nodes and the API client use to reach the node.
    fn address(&self, name: &str) -> Result<String, AttemptError>;
    fn terminate(&self, name: &str) -> Result<(), AttemptError>;
    /// Remove locally held access material (keys, certificates) for the node.
    fn release_credentials(&self, name: &str) -> Result<(), AttemptError>;
}

/// Run a shell command on a provisioned node.
pub trait RemoteExec {
    fn exec(&self, name: &str, command: &str) -> Result<String, AttemptError>;
}

/// Retry policies used by [`Lifecycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicies {
    /// Individual provider calls (find, create, start, terminate).
    pub provider_call: RetryPolicy,
    /// Waiting for a node to report `running`.
    pub ready: RetryPolicy,
}

impl Default for LifecyclePolicies {
    fn default() -> Self {
        Self {
            provider_call: RetryPolicy::attempts(PROVIDER_CALL_ATTEMPTS).with_step_delay(Duration::from_secs(5)),
            ready: RetryPolicy::deadline(Duration::from_secs(600)).with_step_delay(Duration::from_secs(10)),
        }
    }
}

impl LifecyclePolicies {
    /// Policies derived from the configured timeouts.
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            provider_call: RetryPolicy::attempts(PROVIDER_CALL_ATTEMPTS).with_step_delay(timeouts.poll_interval),
            ready: timeouts.machine_ready_policy(),
        }
    }
}

/// What [`Lifecycle::deprovision`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Nothing existed under the name; no provider mutation was made.
    Absent,
    Terminated,
}

pub struct Lifecycle<P> {
    provider: P,
    policies: LifecyclePolicies,
}

impl<P: ComputeProvider> Lifecycle<P> {
    pub fn new(provider: P, policies: LifecyclePolicies) -> Self {
        Self { provider, policies }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn policies(&self) -> &LifecyclePolicies {
        &self.policies
    }

    /// Look a node up, retrying transient provider failures. Nodes that are
    /// terminated or shutting down count as absent.
    pub fn find(&self, name: &str) -> Result<Option<InstanceRecord>, CorralError> {
        let record = retry(&format!("look up {name}"), &self.policies.provider_call, || self.provider.find(name))?;
        Ok(record.filter(|record| !record.state.is_gone()))
    }

    /// Make sure a node named `name` exists and is running.
    ///
    /// Fails with [`CorralError::AlreadyExists`] when a live node already
    /// carries the name; a stopped node is started instead of replaced.
    pub fn ensure(&self, name: &str, spec: &InstanceSpec) -> Result<InstanceRecord, CorralError> {
        info!(node = name, "ensuring node");
        if let Some(existing) = self.find(name).map_err(|error| provisioning_failed(name, error))? {
            if existing.state.is_live() {
                return Err(CorralError::AlreadyExists {
                    name: name.to_string(),
                    state: existing.state,
                });
            }
            if existing.state != InstanceState::Stopped {
                return Err(CorralError::ProvisioningFailed {
                    name: name.to_string(),
                    detail: format!("existing node is {}; refusing to create another one", existing.state),
                });
            }
            info!(node = name, "node is stopped; starting it");
            retry(&format!("start {name}"), &self.policies.provider_call, || self.provider.start(name))
                .map_err(|error| provisioning_failed(name, error))?;
            self.wait_until_running(name).map_err(|error| provisioning_failed(name, error))?;
            return Ok(InstanceRecord {
                state: InstanceState::Running,
                ..existing
            });
        }

        let mut first_attempt = true;
        let mut record = retry(&format!("create {name}"), &self.policies.provider_call, || {
            if !first_attempt
                && let Some(existing) = self.provider.find(name)?
                && !existing.state.is_gone()
            {
                debug!(node = name, state = %existing.state, "earlier create attempt left a node behind; reusing it");
                return Ok(existing);
            }
            first_attempt = false;
            self.provider.create(name, spec)
        })
        .map_err(|error| provisioning_failed(name, error))?;

        if !spec.tags.is_empty() && !record.tagged {
            retry(&format!("tag {name}"), &self.policies.provider_call, || self.provider.tag(name, &spec.tags))
                .map_err(|error| provisioning_failed(name, error))?;
            record.tagged = true;
        }

        self.wait_until_running(name).map_err(|error| provisioning_failed(name, error))?;
        record.state = InstanceState::Running;
        info!(node = name, "node is running");
        Ok(record)
    }

    /// Terminate the node called `name` and release its credentials.
    ///
    /// With `missing_ok` an absent node is a no-op; otherwise it is
    /// [`CorralError::NotFound`]. Both teardown steps run even if the first
    /// fails; failures are collected into [`CorralError::TeardownIncomplete`].
    pub fn deprovision(&self, name: &str, missing_ok: bool) -> Result<Teardown, CorralError> {
        if self.find(name)?.is_none() {
            if missing_ok {
                info!(node = name, "node is absent; nothing to deprovision");
                return Ok(Teardown::Absent);
            }
            return Err(CorralError::NotFound { name: name.to_string() });
        }

        info!(node = name, "deprovisioning node");
        let mut failures = Vec::new();
        let terminate = retry(&format!("terminate {name}"), &self.policies.provider_call, || {
            self.provider.terminate(name)
        });
        collect_failure(&mut failures, terminate);
        let release = retry(&format!("release credentials of {name}"), &self.policies.provider_call, || {
            self.provider.release_credentials(name)
        });
        collect_failure(&mut failures, release);

        if failures.is_empty() {
            Ok(Teardown::Terminated)
        } else {
            Err(CorralError::TeardownIncomplete {
                name: name.to_string(),
                failures,
            })
        }
    }

    fn wait_until_running(&self, name: &str) -> Result<(), CorralError> {
        poll_until(
            &format!("{name} running"),
            &self.policies.ready,
            ReadinessTarget::Flag,
            || {
                let state = self.provider.state(name)?;
                match state {
                    InstanceState::Error | InstanceState::Terminated => {
                        Err(AttemptError::fatal(format!("{name} entered state {state} while starting")))
                    }
                    state => Ok(Observation::Flag(state == InstanceState::Running)),
                }
            },
        )
        .map(|_| ())
    }
}

fn provisioning_failed(name: &str, error: CorralError) -> CorralError {
    match error {
        CorralError::NonRetryable { source, .. } => CorralError::ProvisioningFailed {
            name: name.to_string(),
            detail: source.message,
        },
        other => other,
    }
}

/// Vanishing between lookup and teardown is fine; anything else is recorded.
fn collect_failure(failures: &mut Vec<String>, outcome: Result<(), CorralError>) {
    match outcome {
        Ok(()) => {}
        Err(error) if error.is_not_found() => debug!(error = %error, "node vanished during teardown"),
        Err(error) => {
            warn!(error = %error, "teardown step failed; continuing");
            failures.push(error.to_string());
        }
    }
}
