//! Error types for the visibility engine.
//!
//! All errors are `Clone` so a failed shared computation can report the same
//! error to every caller waiting on it.

use canopy_core::{AsyncRuntimeError, QueueError};
use thiserror::Error;

use crate::node::NodeKey;

/// A failure reported by the [`QueryExecutor`](crate::QueryExecutor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The executor restarted the query. Retrying with the same restart token
    /// is the executor's business; the engine never retries on its own.
    #[error("query `{token}` was aborted by a restart")]
    Aborted {
        /// Restart token of the aborted query.
        token: String,
    },
    /// The query failed.
    #[error("query failed: {0}")]
    Failed(String),
    /// The executor returned a row of the wrong shape.
    #[error("unexpected `{row}` row in response to a `{query}` query")]
    UnexpectedRow {
        /// Kind of the query that was run.
        query: &'static str,
        /// Kind of the row that came back.
        row: &'static str,
    },
}

impl QueryError {
    /// Whether the executor reported this failure as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Errors returned by [`VisibilityHandler`](crate::VisibilityHandler).
#[derive(Debug, Clone, Error)]
pub enum VisibilityError {
    /// A structural query failed. Nothing was changed.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// The node cannot be resolved or mutated as given.
    #[error("invalid node {key}: {reason}")]
    InvalidNode {
        /// The offending node.
        key: NodeKey,
        /// What is wrong with it.
        reason: String,
    },

    /// The handler was disposed.
    #[error("visibility handler has been disposed")]
    Disposed,

    /// The mutation queue reported a failure.
    #[error("mutation queue failure: {0}")]
    Queue(#[from] QueueError),

    /// No async runtime was available to run the mutation queue.
    #[error(transparent)]
    Runtime(#[from] AsyncRuntimeError),
}

impl VisibilityError {
    pub(crate) fn invalid_node(key: NodeKey, reason: impl Into<String>) -> Self {
        Self::InvalidNode {
            key,
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, VisibilityError>;

static_assertions::assert_impl_all!(VisibilityError: Send, Sync, Clone);
