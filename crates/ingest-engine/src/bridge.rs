//! Run the async pipeline from synchronous code.
//!
//! [`block_on`] builds a private current-thread runtime for the duration of
//! one call. It refuses to run when the calling thread is already inside a
//! Tokio runtime, since blocking there would stall that runtime's scheduler;
//! async callers should `.await` the pipeline directly instead.

use std::future::Future;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Called from within a running Tokio runtime.
    #[error("block_on called from inside an async runtime; await the pipeline instead")]
    NestedRuntime,

    #[error("Failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Whether the current thread is inside a Tokio runtime.
pub fn in_runtime() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

/// Drive `future` to completion on a fresh current-thread runtime.
///
/// # Errors
/// Returns `BridgeError::NestedRuntime` if a runtime is already active on this
/// thread, and `BridgeError::Runtime` if the runtime cannot be built.
pub fn block_on<F: Future>(future: F) -> Result<F::Output, BridgeError> {
    if in_runtime() {
        return Err(BridgeError::NestedRuntime);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    Ok(runtime.block_on(future))
}
