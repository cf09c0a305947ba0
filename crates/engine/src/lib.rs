//! # Corral Engine
//!
//! Sequential, bounded orchestration of ephemeral Rancher test clusters.
//!
//! ## Layers
//!
//! - **`retry`**: run an operation until it succeeds or its attempt/time
//!   budget runs out; only transient failures are retried.
//! - **`poll`**: sample a readiness predicate until it reaches a target.
//! - **`lifecycle`**: idempotent ensure/deprovision of named nodes on top
//!   of a [`ComputeProvider`].
//! - **`docker_machine`**: the docker-machine/EC2 provider.
//! - **`rancher`**: server and agent provisioning through the Rancher API.
//! - **`puppet`**: `puppet apply` of a manifest.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//!
//! use corral_engine::{retry, wait_for_count};
//! use corral_types::{AttemptError, RetryPolicy};
//!
//! let policy = RetryPolicy::attempts(3).with_step_delay(Duration::from_millis(1));
//! let mut calls = 0;
//! let value = retry("flaky call", &policy, || {
//!     calls += 1;
//!     if calls < 2 { Err(AttemptError::transient("connection refused")) } else { Ok(calls) }
//! })?;
//! assert_eq!(value, 2);
//!
//! let mut active = 0;
//! let count = wait_for_count("active agents", &policy, 2, || {
//!     active += 1;
//!     Ok(active)
//! })?;
//! assert_eq!(count, 2);
//! # Ok::<(), corral_engine::CorralError>(())
//! ```

pub mod docker_machine;
pub mod error;
pub mod lifecycle;
pub mod poll;
pub mod puppet;
pub mod rancher;
pub mod retry;

#[cfg(test)]
mod testing;

pub use docker_machine::DockerMachine;
pub use error::CorralError;
pub use lifecycle::{ComputeProvider, Lifecycle, LifecyclePolicies, RemoteExec, Teardown};
pub use poll::{poll_until, wait_for_count, wait_for_flag};
pub use puppet::PuppetApply;
pub use rancher::{RancherAgents, RancherApi, RancherServer, ServerRegistration};
pub use retry::retry;
