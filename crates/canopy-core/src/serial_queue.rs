//! FIFO queue of async units executed strictly one after another.
//!
//! A [`SerialQueue`] owns a single run loop task. Submitted units are executed
//! in submission order, and a unit never starts before the previous one has
//! finished. A unit that has started always runs to completion, even if the
//! submitter stops waiting for its result.
//!
//! Units may carry a key. When a new unit is submitted with the same key as a
//! unit that is still waiting in the queue, the waiting unit is withdrawn and
//! its submitter receives [`QueueError::Superseded`].
//!
//! # Example
//!
//! ```
//! use canopy_core::SerialQueue;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = SerialQueue::<&'static str>::new("example").unwrap();
//! let first = queue.submit(Some("node-a"), async { 1 });
//! let second = queue.submit(Some("node-b"), async { 2 });
//! assert_eq!(first.await, Ok(1));
//! assert_eq!(second.await, Ok(2));
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::{AsyncRuntimeError, QueueError};
use crate::logging::targets;
use crate::runtime::AsyncRuntime;

/// Lifecycle of a single queued unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum UnitState {
    Queued = 0,
    Started = 1,
    Superseded = 2,
    Closed = 3,
}

impl UnitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Started,
            2 => Self::Superseded,
            3 => Self::Closed,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug)]
struct UnitTicket {
    state: AtomicU8,
}

impl UnitTicket {
    fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: UnitState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

struct QueuedUnit<K> {
    id: u64,
    key: Option<K>,
    ticket: Arc<UnitTicket>,
    work: BoxFuture<'static, ()>,
}

/// Bookkeeping for units that have been submitted but not started.
struct Waiting<K> {
    tickets: HashMap<u64, Arc<UnitTicket>>,
    latest_by_key: HashMap<K, u64>,
}

impl<K: Eq + Hash> Waiting<K> {
    fn new() -> Self {
        Self {
            tickets: HashMap::new(),
            latest_by_key: HashMap::new(),
        }
    }
}

/// A FIFO queue that runs async units one at a time.
pub struct SerialQueue<K> {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedUnit<K>>>>,
    waiting: Arc<Mutex<Waiting<K>>>,
    next_id: AtomicU64,
    supersede: bool,
}

impl<K> SerialQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Create a queue whose run loop is spawned on the ambient runtime, or on
    /// the global fallback runtime outside of any runtime.
    pub fn new(name: impl Into<String>) -> Result<Self, AsyncRuntimeError> {
        Ok(Self::with_handle(name, &AsyncRuntime::try_current_or_global()?))
    }

    /// Create a queue whose run loop is spawned on `handle`.
    pub fn with_handle(name: impl Into<String>, handle: &Handle) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let waiting = Arc::new(Mutex::new(Waiting::new()));

        handle.spawn(run_loop(name.clone(), receiver, waiting.clone()));
        tracing::debug!(target: targets::QUEUE, queue = %name, "serial queue started");

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            waiting,
            next_id: AtomicU64::new(1),
            supersede: true,
        }
    }

    /// Enable or disable withdrawal of waiting units with a repeated key.
    pub fn with_supersede(mut self, supersede: bool) -> Self {
        self.supersede = supersede;
        self
    }

    /// Submit a unit of work.
    ///
    /// The unit is enqueued immediately; the returned future only reports its
    /// result. Dropping the returned future does not withdraw the unit.
    pub fn submit<F, T>(
        &self,
        key: Option<K>,
        work: F,
    ) -> impl Future<Output = Result<T, QueueError>> + Send + use<K, F, T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ticket = Arc::new(UnitTicket {
            state: AtomicU8::new(UnitState::Queued as u8),
        });
        let (result_tx, result_rx) = oneshot::channel();

        let unit = QueuedUnit {
            id,
            key: key.clone(),
            ticket: ticket.clone(),
            work: async move {
                let _ = result_tx.send(work.await);
            }
            .boxed(),
        };

        let accepted = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(sender) => {
                    let mut waiting = self.waiting.lock();
                    if self.supersede {
                        if let Some(key) = key {
                            if let Some(previous) = waiting.latest_by_key.insert(key, id) {
                                if let Some(previous) = waiting.tickets.remove(&previous) {
                                    previous.set(UnitState::Superseded);
                                    tracing::trace!(target: targets::QUEUE, queue = %self.name, "withdrew superseded unit");
                                }
                            }
                        }
                    }
                    waiting.tickets.insert(id, ticket.clone());
                    drop(waiting);
                    if sender.send(unit).is_ok() {
                        true
                    } else {
                        self.waiting.lock().tickets.remove(&id);
                        false
                    }
                }
                None => false,
            }
        };

        if !accepted {
            ticket.set(UnitState::Closed);
        }

        async move {
            if !accepted {
                return Err(QueueError::Closed);
            }
            match result_rx.await {
                Ok(value) => Ok(value),
                Err(_) => Err(match ticket.state() {
                    UnitState::Superseded => QueueError::Superseded,
                    UnitState::Closed | UnitState::Queued => QueueError::Closed,
                    UnitState::Started => QueueError::Aborted,
                }),
            }
        }
    }

    /// Wait until every unit submitted before this call has finished.
    pub async fn flush(&self) -> Result<(), QueueError> {
        self.submit(None, async {}).await
    }

    /// Close the queue.
    ///
    /// Units that have not started are withdrawn and report
    /// [`QueueError::Closed`]; the running unit (if any) completes. Later
    /// submissions fail immediately.
    pub fn close(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        let mut waiting = self.waiting.lock();
        for ticket in waiting.tickets.values() {
            ticket.set(UnitState::Closed);
        }
        let withdrawn = waiting.tickets.len();
        waiting.tickets.clear();
        waiting.latest_by_key.clear();
        tracing::debug!(target: targets::QUEUE, queue = %self.name, withdrawn, "serial queue closed");
    }
}

impl<K> std::fmt::Debug for SerialQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.name)
            .field("supersede", &self.supersede)
            .finish()
    }
}

async fn run_loop<K: Eq + Hash>(
    name: String,
    mut receiver: mpsc::UnboundedReceiver<QueuedUnit<K>>,
    waiting: Arc<Mutex<Waiting<K>>>,
) {
    while let Some(unit) = receiver.recv().await {
        let runnable = {
            let mut waiting = waiting.lock();
            if let Some(key) = &unit.key {
                if waiting.latest_by_key.get(key) == Some(&unit.id) {
                    waiting.latest_by_key.remove(key);
                }
            }
            // A ticket missing from the table was superseded or closed.
            if waiting.tickets.remove(&unit.id).is_some() {
                unit.ticket.set(UnitState::Started);
                true
            } else {
                false
            }
        };

        if !runnable {
            tracing::trace!(target: targets::QUEUE, queue = %name, unit = unit.id, "skipping withdrawn unit");
            continue;
        }

        tracing::trace!(target: targets::QUEUE, queue = %name, unit = unit.id, "running unit");
        unit.work.await;
    }
    tracing::debug!(target: targets::QUEUE, queue = %name, "serial queue run loop finished");
}

static_assertions::assert_impl_all!(SerialQueue<u64>: Send, Sync);
