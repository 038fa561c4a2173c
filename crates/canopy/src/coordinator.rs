//! The visibility handler.
//!
//! [`VisibilityHandler`] composes the structural cache, the resolver and the
//! mutator into the interface a tree view consumes, and coordinates them:
//!
//! - each tracked node has at most one resolve in flight; a new resolve or
//!   mutation for the same node supersedes it
//! - any display surface change cancels every in-flight resolve and starts a
//!   new state generation, immediately
//! - mutations run one at a time on a serial queue; while any mutation is
//!   pending, change notifications are held back and replaced by a single
//!   notification once the last one finishes
//! - resolves share the read side of a gate whose write side is held while a
//!   mutation commits, so a resolve never observes half a mutation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use canopy_core::logging::{async_span, span_names, targets};
use canopy_core::{CancelReason, CancellationToken, ConnectionGuard, QueueError, SerialQueue, Signal};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::Instrument;

use crate::cache::StructuralCache;
use crate::config::EngineConfig;
use crate::error::{Result, VisibilityError};
use crate::mutator::Mutator;
use crate::node::{HierarchyNode, NodeKey};
use crate::query::QueryExecutor;
use crate::resolver::Resolver;
use crate::status::VisibilityStatus;
use crate::surface::{DisplaySurface, SurfaceChange};

/// How a [`resolve`](VisibilityHandler::resolve) call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveOutcome {
    /// The node's status.
    Resolved(VisibilityStatus),
    /// A newer request for the same node took over.
    Superseded,
    /// The display state changed, or the handler was disposed, before the
    /// status was known.
    Cancelled,
}

impl ResolveOutcome {
    /// The status, if one was resolved.
    pub fn status(self) -> Option<VisibilityStatus> {
        match self {
            Self::Resolved(status) => Some(status),
            Self::Superseded | Self::Cancelled => None,
        }
    }
}

/// How a [`set_visibility`](VisibilityHandler::set_visibility) call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOutcome {
    /// The mutation was committed with this many surface writes.
    Applied {
        /// Number of surface writes.
        writes: usize,
    },
    /// A newer mutation for the same node replaced this one before it
    /// started. Nothing was changed.
    Superseded,
}

struct InFlight {
    id: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct Suppression {
    depth: usize,
    pending: bool,
}

struct Inner {
    surface: Arc<dyn DisplaySurface>,
    cache: Arc<StructuralCache>,
    resolver: Arc<Resolver>,
    mutator: Arc<Mutator>,
    queue: SerialQueue<NodeKey>,
    gate: Arc<RwLock<()>>,
    in_flight: Mutex<HashMap<NodeKey, InFlight>>,
    next_resolve: AtomicU64,
    suppression: Mutex<Suppression>,
    visibility_changed: Arc<Signal<()>>,
    surface_connection: Mutex<Option<ConnectionGuard<SurfaceChange>>>,
    disposed: AtomicBool,
}

impl Inner {
    /// Register a resolve for `key`, superseding the previous one.
    fn track(&self, key: &NodeKey) -> (u64, CancellationToken) {
        let id = self.next_resolve.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.in_flight.lock().insert(
            key.clone(),
            InFlight {
                id,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel(CancelReason::Superseded);
        }
        (id, token)
    }

    fn untrack(&self, key: &NodeKey, id: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(key).is_some_and(|entry| entry.id == id) {
            in_flight.remove(key);
        }
    }

    fn supersede(&self, key: &NodeKey) {
        if let Some(previous) = self.in_flight.lock().remove(key) {
            previous.token.cancel(CancelReason::Superseded);
        }
    }

    fn cancel_all(&self, reason: CancelReason) -> usize {
        let cancelled: Vec<InFlight> = self.in_flight.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &cancelled {
            entry.token.cancel(reason);
        }
        cancelled.len()
    }

    fn on_surface_changed(&self, change: SurfaceChange) {
        self.invalidate();
        {
            let mut suppression = self.suppression.lock();
            if suppression.depth > 0 {
                suppression.pending = true;
                tracing::trace!(target: targets::COORDINATOR, ?change, "surface change notification held back");
                return;
            }
        }
        tracing::trace!(target: targets::COORDINATOR, ?change, "surface changed");
        self.visibility_changed.emit(());
    }

    /// Cancel in-flight resolves and start a new state generation.
    fn invalidate(&self) {
        let cancelled = self.cancel_all(CancelReason::Invalidated);
        self.resolver.invalidate();
        if cancelled > 0 {
            tracing::debug!(target: targets::COORDINATOR, cancelled, "in-flight resolves invalidated");
        }
    }

    fn suppress(self: &Arc<Self>) -> SuppressionGuard {
        self.suppression.lock().depth += 1;
        SuppressionGuard {
            inner: Arc::downgrade(self),
        }
    }

    fn release(&self) {
        let flush = {
            let mut suppression = self.suppression.lock();
            suppression.depth = suppression.depth.saturating_sub(1);
            suppression.depth == 0 && std::mem::take(&mut suppression.pending)
        };
        if flush && !self.disposed.load(Ordering::Acquire) {
            tracing::trace!(target: targets::COORDINATOR, "emitting held change notification");
            self.visibility_changed.emit(());
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(VisibilityError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// Holds back change notifications until dropped.
///
/// Lives inside the queued mutation unit, so it is released when the unit
/// finishes, fails or is withdrawn.
struct SuppressionGuard {
    inner: Weak<Inner>,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.release();
        }
    }
}

/// Resolves and changes the visibility of hierarchy nodes for one tree view.
///
/// Create one per tree view and [`dispose`](Self::dispose) it when the view
/// goes away. Dropping the handler disposes it.
///
/// ```
/// use std::sync::Arc;
/// use canopy::{
///     EngineConfig, HierarchyNode, MemoryDataset, ResolveOutcome, ViewState, VisibilityHandler,
///     VisibilityStatus,
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> canopy::Result<()> {
/// let dataset = Arc::new(MemoryDataset::new().with_item(1, 100, 10));
/// let view = Arc::new(ViewState::new());
/// let handler = VisibilityHandler::new(dataset, view, EngineConfig::default())?;
///
/// let model = HierarchyNode::container(100);
/// assert_eq!(
///     handler.resolve(&model).await?,
///     ResolveOutcome::Resolved(VisibilityStatus::Hidden)
/// );
///
/// handler.set_visibility(&model, true).await?;
/// assert_eq!(
///     handler.resolve(&model).await?.status(),
///     Some(VisibilityStatus::Visible)
/// );
/// # Ok(())
/// # }
/// ```
pub struct VisibilityHandler {
    inner: Arc<Inner>,
}

impl VisibilityHandler {
    /// Create a handler over `executor` and `surface`.
    ///
    /// Must be called where a Tokio runtime is reachable (inside one, or with
    /// the global fallback runtime available).
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        surface: Arc<dyn DisplaySurface>,
        config: EngineConfig,
    ) -> Result<Self> {
        let cache = Arc::new(StructuralCache::new(executor, &config));
        let resolver = Arc::new(Resolver::new(cache.clone(), surface.clone()));
        let mutator = Arc::new(Mutator::new(cache.clone(), surface.clone(), &config));
        let queue = SerialQueue::new("visibility-mutations")?
            .with_supersede(config.supersede_queued_mutations);

        let inner = Arc::new(Inner {
            surface: surface.clone(),
            cache,
            resolver,
            mutator,
            queue,
            gate: Arc::new(RwLock::new(())),
            in_flight: Mutex::new(HashMap::new()),
            next_resolve: AtomicU64::new(1),
            suppression: Mutex::new(Suppression::default()),
            visibility_changed: Arc::new(Signal::new()),
            surface_connection: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let connection = surface.changed().connect_scoped(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_surface_changed(*change);
            }
        });
        *inner.surface_connection.lock() = Some(connection);

        tracing::debug!(target: targets::COORDINATOR, ?config, "visibility handler created");
        Ok(Self { inner })
    }

    /// Resolve the visibility status of `node`.
    ///
    /// Returns [`ResolveOutcome::Superseded`] if another resolve or a
    /// mutation for the same node arrives first, and
    /// [`ResolveOutcome::Cancelled`] if the display state changes first.
    #[tracing::instrument(skip_all, target = "canopy::coordinator", level = "trace", fields(node = %node.key()))]
    pub async fn resolve(&self, node: &HierarchyNode) -> Result<ResolveOutcome> {
        self.inner.ensure_live()?;
        node.validate_for_resolve()?;

        let key = node.key();
        let (id, token) = self.inner.track(&key);
        let _tracked = Tracked {
            inner: &self.inner,
            key: &key,
            id,
        };

        let gate = self.inner.gate.clone();
        let resolver = self.inner.resolver.clone();
        let work = async move {
            let _read = gate.read().await;
            resolver.resolve(node).await
        }
        .instrument(async_span(span_names::RESOLVE));

        tokio::select! {
            biased;
            reason = token.cancelled() => {
                tracing::trace!(target: targets::COORDINATOR, ?reason, "resolve cancelled");
                Ok(match reason {
                    CancelReason::Superseded => ResolveOutcome::Superseded,
                    CancelReason::Invalidated | CancelReason::Disposed => ResolveOutcome::Cancelled,
                })
            }
            status = work => status.map(ResolveOutcome::Resolved),
        }
    }

    /// Turn `node` on or off.
    ///
    /// Mutations are applied strictly in submission order. Each one is
    /// planned against the current state and committed atomically; if
    /// planning fails nothing changes and the error is returned. A waiting
    /// mutation for the same node is replaced by this one and reports
    /// [`MutationOutcome::Superseded`].
    #[tracing::instrument(skip_all, target = "canopy::coordinator", level = "debug", fields(node = %node.key(), on = on))]
    pub async fn set_visibility(&self, node: &HierarchyNode, on: bool) -> Result<MutationOutcome> {
        self.inner.ensure_live()?;
        let key = node.key();
        self.inner.supersede(&key);

        let guard = self.inner.suppress();
        let mutator = self.inner.mutator.clone();
        let resolver = self.inner.resolver.clone();
        let gate = self.inner.gate.clone();
        let node = node.clone();
        let unit = async move {
            let _guard = guard;
            let plan = mutator
                .plan(&node, on)
                .instrument(async_span(span_names::PLAN))
                .await?;
            let _write = gate.write().await;
            let writes = plan.commit();
            resolver.invalidate();
            Ok::<_, VisibilityError>(writes)
        };

        match self.inner.queue.submit(Some(key), unit).await {
            Ok(Ok(writes)) => Ok(MutationOutcome::Applied { writes }),
            Ok(Err(error)) => {
                tracing::warn!(target: targets::COORDINATOR, %error, "mutation failed");
                Err(error)
            }
            Err(QueueError::Superseded) => Ok(MutationOutcome::Superseded),
            Err(QueueError::Closed) => Err(VisibilityError::Disposed),
            Err(error) => Err(error.into()),
        }
    }

    /// Signal emitted whenever resolved statuses may have changed.
    ///
    /// Emitted once per external surface change, and once after each burst
    /// of mutations.
    pub fn on_visibility_change(&self) -> &Arc<Signal<()>> {
        &self.inner.visibility_changed
    }

    /// Wait until every mutation submitted so far has finished.
    pub async fn flush(&self) -> Result<()> {
        self.inner.ensure_live()?;
        self.inner
            .queue
            .flush()
            .await
            .map_err(|_| VisibilityError::Disposed)
    }

    /// Release the structural cache, cancel in-flight resolves and stop
    /// listening to the display surface. Later calls fail with
    /// [`VisibilityError::Disposed`]. Calling this twice is harmless.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.surface_connection.lock().take();
        let cancelled = self.inner.cancel_all(CancelReason::Disposed);
        self.inner.queue.close();
        self.inner.resolver.invalidate();
        self.inner.cache.dispose();
        self.inner.visibility_changed.disconnect_all();
        tracing::debug!(target: targets::COORDINATOR, cancelled, "visibility handler disposed");
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// The structural cache shared by this handler.
    pub fn cache(&self) -> &Arc<StructuralCache> {
        &self.inner.cache
    }

    /// The display surface this handler works on.
    pub fn surface(&self) -> &Arc<dyn DisplaySurface> {
        &self.inner.surface
    }

    /// Number of resolves currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }
}

impl Drop for VisibilityHandler {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for VisibilityHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityHandler")
            .field("resolver", &self.inner.resolver)
            .field("queue", &self.inner.queue)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Stops tracking a resolve when it ends, however it ends.
struct Tracked<'a> {
    inner: &'a Inner,
    key: &'a NodeKey,
    id: u64,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        self.inner.untrack(self.key, self.id);
    }
}

static_assertions::assert_impl_all!(VisibilityHandler: Send, Sync);
