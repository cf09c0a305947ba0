//! Bridge from the sequential provisioning flow to async HTTP calls.
//!
//! The engine polls with blocking sleeps; the Rancher client is built on
//! async `reqwest`. Each call is driven to completion here, reusing an
//! ambient Tokio runtime when one exists.

use std::future::Future;

use corral_types::AttemptError;
use tokio::{runtime::Handle, task};

/// Drive `future` to completion from synchronous code.
///
/// Failing to build a runtime is reported as a fatal [`AttemptError`] so it
/// is never retried by a polling loop.
pub fn block_on_future<F, T>(future: F) -> Result<T, AttemptError>
where
    F: Future<Output = Result<T, AttemptError>> + Send + 'static,
    T: Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        return task::block_in_place(|| handle.block_on(future));
    }
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| AttemptError::fatal(format!("could not start async runtime: {error}")))?
        .block_on(future)
}
