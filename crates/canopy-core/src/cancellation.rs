//! Cooperative cancellation for async pipelines.
//!
//! A [`CancellationToken`] is shared between the party that may cancel work
//! and the pipeline doing the work. The pipeline either polls
//! [`is_cancelled`](CancellationToken::is_cancelled) or races its work against
//! [`cancelled`](CancellationToken::cancelled). The first cancellation wins and
//! records a [`CancelReason`]; later calls are ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CancelReason {
    /// A newer request for the same target replaced this one.
    Superseded = 1,
    /// The state the work depended on changed underneath it.
    Invalidated = 2,
    /// The owner was torn down.
    Disposed = 3,
}

impl CancelReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Superseded),
            2 => Some(Self::Invalidated),
            3 => Some(Self::Disposed),
            _ => None,
        }
    }
}

const NOT_CANCELLED: u8 = 0;

/// A cancellation token for async tasks.
///
/// Cloning a token yields a handle to the same cancellation state.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<CancellationState>,
}

#[derive(Debug)]
struct CancellationState {
    reason: AtomicU8,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new, non-cancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState {
                reason: AtomicU8::new(NOT_CANCELLED),
                notify: Notify::new(),
            }),
        }
    }

    /// Check if cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.load(Ordering::Acquire) != NOT_CANCELLED
    }

    /// The reason recorded by the first cancellation, if any.
    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::from_u8(self.inner.reason.load(Ordering::Acquire))
    }

    /// Request cancellation with the given reason.
    ///
    /// Returns `true` if this call cancelled the token, `false` if it was
    /// already cancelled (the original reason is kept).
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let won = self
            .inner
            .reason
            .compare_exchange(
                NOT_CANCELLED,
                reason as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.inner.notify.notify_waiters();
        }
        won
    }

    /// Wait asynchronously until cancellation is requested.
    ///
    /// Returns immediately if already cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Returns `true` if both handles share the same state.
    pub fn same_token(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(CancellationToken: Send, Sync);
