//! Core async plumbing for Canopy.
//!
//! This crate provides the building blocks the visibility engine is composed
//! from:
//!
//! - **Signals**: [`Signal`] for change notification with scoped connections
//! - **Cancellation**: [`CancellationToken`] for cooperative cancellation
//!   with a recorded [`CancelReason`]
//! - **Serial queue**: [`SerialQueue`] runs async units strictly one after
//!   another and withdraws superseded waiting units
//! - **Memo**: [`Memo`] coalesces concurrent requests for the same key into
//!   one shared computation
//! - **Runtime**: [`runtime::AsyncRuntime`] resolves the Tokio handle used
//!   for background run loops
//!
//! # Coalescing Example
//!
//! ```
//! use canopy_core::Memo;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let memo = Memo::<u64, String, String>::new();
//! let first = memo.get_or_start(1, || async { Ok("fetched once".to_string()) });
//! let second = memo.get_or_start(1, || async { Ok("never runs".to_string()) });
//! assert_eq!(first.await, second.await);
//! assert_eq!(memo.starts(), 1);
//! # }
//! ```

mod cancellation;
mod error;
pub mod logging;
mod memo;
pub mod runtime;
mod serial_queue;
pub mod signal;

pub use cancellation::{CancelReason, CancellationToken};
pub use error::{AsyncRuntimeError, QueueError};
pub use logging::PerfSpan;
pub use memo::{Memo, SharedResult};
pub use serial_queue::SerialQueue;
pub use signal::{ConnectionGuard, ConnectionId, Signal};
