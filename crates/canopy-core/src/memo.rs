//! Request coalescing for async computations.
//!
//! A [`Memo`] maps keys to shared futures. The first request for a key starts
//! the computation; every later request for the same key, whether it arrives
//! while the computation is in flight or after it finished, receives a clone of
//! the same [`Shared`] future and therefore the same result. The computation is
//! never started twice for one key.
//!
//! Failures are replayed to everyone already waiting, then the entry is
//! evicted so that a later request starts a fresh computation. There is no
//! automatic retry.
//!
//! # Example
//!
//! ```
//! use canopy_core::Memo;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let memo = Memo::<&'static str, u32, String>::new();
//! let a = memo.get_or_start("answer", || async { Ok(42) });
//! let b = memo.get_or_start("answer", || async { unreachable!() });
//! assert_eq!(a.await, Ok(42));
//! assert_eq!(b.await, Ok(42));
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;

/// A shared, cloneable future yielding `Result<V, E>`.
pub type SharedResult<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct Entry<V, E> {
    id: u64,
    future: SharedResult<V, E>,
}

type Entries<K, V, E> = Mutex<HashMap<K, Entry<V, E>>>;

/// A coalescing map from keys to shared computations.
pub struct Memo<K, V, E> {
    entries: Arc<Entries<K, V, E>>,
    next_id: AtomicU64,
    starts: AtomicU64,
}

impl<K, V, E> Default for Memo<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> Memo<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty memo.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            starts: AtomicU64::new(0),
        }
    }

    /// Return the shared computation for `key`, starting it with `start` if
    /// there is none.
    ///
    /// `start` is only called on a miss. The computation does not make
    /// progress until one of the returned futures is polled.
    pub fn get_or_start<F, Fut>(&self, key: K, start: F) -> SharedResult<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            return entry.future.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let computation = start();
        let weak: Weak<Entries<K, V, E>> = Arc::downgrade(&self.entries);
        let evict_key = key.clone();
        let future = async move {
            let result = computation.await;
            if result.is_err() {
                evict(&weak, &evict_key, id);
            }
            result
        }
        .boxed()
        .shared();

        entries.insert(
            key,
            Entry {
                id,
                future: future.clone(),
            },
        );
        self.starts.fetch_add(1, Ordering::Relaxed);
        future
    }

    /// Drop the entry for `key`. Futures already handed out keep working.
    pub fn remove(&self, key: &K) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Drop every entry. Futures already handed out keep working.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of computations started so far.
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }
}

fn evict<K: Eq + Hash, V, E>(entries: &Weak<Entries<K, V, E>>, key: &K, id: u64) {
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let mut entries = entries.lock();
    // Only evict the entry this computation belongs to; it may have been
    // cleared and replaced in the meantime.
    if entries.get(key).is_some_and(|entry| entry.id == id) {
        entries.remove(key);
    }
}

impl<K, V, E> std::fmt::Debug for Memo<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memo")
            .field("entries", &self.entries.lock().len())
            .field("starts", &self.starts.load(Ordering::Relaxed))
            .finish()
    }
}
