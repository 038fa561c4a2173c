//! Tokio runtime access for background drivers.
//!
//! Canopy does most of its work inside futures that the caller polls. The few
//! pieces that need a task of their own (the run loop of a
//! [`SerialQueue`](crate::SerialQueue)) spawn it on the handle returned by
//! [`AsyncRuntime::try_current_or_global`].
//!
//! Inside a Tokio runtime the ambient runtime is used, so embedding
//! applications and `#[tokio::test]` keep control over scheduling. Outside of
//! any runtime a lazily created global runtime is used.
//!
//! ```
//! use canopy_core::runtime::AsyncRuntime;
//!
//! let handle = AsyncRuntime::try_current_or_global().expect("runtime");
//! let task = handle.spawn(async { 1 + 1 });
//! # let _ = task;
//! ```

use std::sync::OnceLock;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::AsyncRuntimeError;
use crate::logging::targets;

static GLOBAL_RUNTIME: OnceLock<AsyncRuntime> = OnceLock::new();

const GLOBAL_WORKERS: usize = 2;
const GLOBAL_THREAD_NAME: &str = "canopy-async";

/// The process-wide fallback runtime.
pub struct AsyncRuntime {
    /// Kept alive so the runtime does not shut down.
    _runtime: Runtime,
    handle: Handle,
}

impl AsyncRuntime {
    fn build() -> Result<Self, AsyncRuntimeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(GLOBAL_WORKERS)
            .thread_name(GLOBAL_THREAD_NAME)
            .enable_time()
            .build()
            .map_err(|e| AsyncRuntimeError::CreationFailed(e.to_string()))?;
        let handle = runtime.handle().clone();
        tracing::debug!(target: targets::RUNTIME, workers = GLOBAL_WORKERS, "created global runtime");
        Ok(Self {
            _runtime: runtime,
            handle,
        })
    }

    /// The global fallback runtime, created on first use.
    pub fn global() -> Result<&'static AsyncRuntime, AsyncRuntimeError> {
        if let Some(runtime) = GLOBAL_RUNTIME.get() {
            return Ok(runtime);
        }
        let runtime = Self::build()?;
        // Another thread may have won the race; either runtime is fine.
        let _ = GLOBAL_RUNTIME.set(runtime);
        GLOBAL_RUNTIME.get().ok_or(AsyncRuntimeError::Unavailable)
    }

    /// The ambient runtime handle if called inside a runtime, otherwise the
    /// handle of the global fallback runtime.
    pub fn try_current_or_global() -> Result<Handle, AsyncRuntimeError> {
        match Handle::try_current() {
            Ok(handle) => Ok(handle),
            Err(_) => Ok(Self::global()?.handle.clone()),
        }
    }
}

impl std::fmt::Debug for AsyncRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRuntime").finish_non_exhaustive()
    }
}
