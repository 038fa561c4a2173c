//! Error types for Canopy core plumbing.

use std::fmt;

/// Errors that can occur when obtaining an async runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncRuntimeError {
    /// Failed to create the runtime.
    CreationFailed(String),
    /// The global runtime could not be installed.
    Unavailable,
}

impl fmt::Display for AsyncRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreationFailed(msg) => write!(f, "Failed to create async runtime: {msg}"),
            Self::Unavailable => write!(f, "Global async runtime is unavailable"),
        }
    }
}

impl std::error::Error for AsyncRuntimeError {}

/// Errors reported by a [`SerialQueue`](crate::SerialQueue) to the submitter
/// of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed before the unit started.
    Closed,
    /// A newer unit with the same key replaced this one before it started.
    Superseded,
    /// The unit started but its task ended without producing a result.
    Aborted,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Queue is closed"),
            Self::Superseded => write!(f, "Queued unit was superseded by a newer request"),
            Self::Aborted => write!(f, "Queued unit ended without a result"),
        }
    }
}

impl std::error::Error for QueueError {}
