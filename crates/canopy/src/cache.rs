//! Structural cache.
//!
//! Memoizes the containment graph of one hierarchy view: which collections
//! belong to which containers, how many items each (container, collection)
//! pair has, which items root a nested container, item parent/child relations
//! and item locations.
//!
//! Every relationship is fetched through a [`Memo`], so concurrent lookups
//! share one in-flight query and later lookups replay its result. Item counts
//! requested in the same scheduling tick are grouped into one batched query.
//! Failed fetches are reported to every waiting caller and then forgotten;
//! nothing is retried automatically.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use canopy_core::logging::{async_span, span_names, targets};
use canopy_core::{Memo, SharedResult};
use futures_util::future::join_all;
use futures_util::{FutureExt, TryStreamExt};
use parking_lot::Mutex;
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::error::QueryError;
use crate::ids::{CollectionId, ContainerId, ItemId};
use crate::node::Dimension;
use crate::query::{QueryExecutor, QueryRow, RestartToken, RestartTokens, StructuralQuery};

type Pair = (ContainerId, CollectionId);

/// A collection as seen under one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionSummary {
    /// The collection.
    pub id: CollectionId,
    /// Whether the collection has items under this container.
    pub has_items: bool,
}

/// An item that roots a nested container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubModel {
    /// The root item.
    pub item: ItemId,
    /// Container of the root item.
    pub container: ContainerId,
    /// Collection of the root item.
    pub collection: CollectionId,
    /// The nested container.
    pub sub_model: ContainerId,
    /// Dimensionality of the nested container.
    pub dimension: Dimension,
}

/// Container and collection of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemLocation {
    /// The item's container.
    pub container: ContainerId,
    /// The item's collection.
    pub collection: CollectionId,
}

#[derive(Debug, Default)]
pub(crate) struct CollectionIndex {
    by_container: HashMap<ContainerId, Vec<CollectionSummary>>,
}

impl CollectionIndex {
    pub(crate) fn of_container(&self, container: ContainerId) -> &[CollectionSummary] {
        self.by_container
            .get(&container)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub(crate) struct SubModelIndex {
    by_item: HashMap<ItemId, SubModel>,
    by_container: HashMap<ContainerId, Vec<SubModel>>,
    by_pair: HashMap<Pair, Vec<SubModel>>,
    dimensions: HashMap<ContainerId, Dimension>,
}

impl SubModelIndex {
    fn insert(&mut self, sub_model: SubModel) {
        // A container nested in itself would make status resolution recurse
        // forever.
        if sub_model.sub_model == sub_model.container {
            tracing::warn!(target: targets::CACHE, item = %sub_model.item, "ignoring self-nested sub-model");
            return;
        }
        self.by_item.insert(sub_model.item, sub_model);
        self.dimensions.insert(sub_model.sub_model, sub_model.dimension);
        self.by_container
            .entry(sub_model.container)
            .or_default()
            .push(sub_model);
        self.by_pair
            .entry((sub_model.container, sub_model.collection))
            .or_default()
            .push(sub_model);
    }

    pub(crate) fn of_item(&self, item: ItemId) -> Option<&SubModel> {
        self.by_item.get(&item)
    }

    pub(crate) fn of_container(&self, container: ContainerId) -> &[SubModel] {
        self.by_container
            .get(&container)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn of_pair(&self, container: ContainerId, collection: CollectionId) -> &[SubModel] {
        self.by_pair
            .get(&(container, collection))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Dimensionality of a nested container, if any item roots it.
    pub(crate) fn dimension_of(&self, container: ContainerId) -> Option<Dimension> {
        self.dimensions.get(&container).copied()
    }
}

type CountMap = Arc<HashMap<Pair, u64>>;

struct CountBatch {
    id: u64,
    pairs: Arc<Mutex<Vec<Pair>>>,
    result: SharedResult<CountMap, QueryError>,
}

/// Per-item lookups whose answers never change once fetched.
struct ItemLookup<V> {
    known: Arc<Mutex<HashMap<ItemId, V>>>,
    pending: Memo<Vec<ItemId>, (), QueryError>,
}

impl<V> ItemLookup<V>
where
    V: Clone + Default + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            known: Arc::new(Mutex::new(HashMap::new())),
            pending: Memo::new(),
        }
    }

    /// Answer for each of `ids`, fetching the unknown ones with one query.
    async fn get<F, Fut>(&self, ids: &[ItemId], fetch_missing: F) -> Result<HashMap<ItemId, V>, QueryError>
    where
        F: FnOnce(Vec<ItemId>) -> Fut,
        Fut: Future<Output = Result<HashMap<ItemId, V>, QueryError>> + Send + 'static,
    {
        let mut wanted = ids.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let missing: Vec<ItemId> = {
            let known = self.known.lock();
            wanted
                .iter()
                .copied()
                .filter(|id| !known.contains_key(id))
                .collect()
        };

        if !missing.is_empty() {
            let known = self.known.clone();
            let key = missing.clone();
            self.pending
                .get_or_start(key.clone(), move || {
                    let fetched = fetch_missing(missing.clone());
                    async move {
                        let found = fetched.await?;
                        let mut known = known.lock();
                        for id in missing {
                            known.insert(id, found.get(&id).cloned().unwrap_or_default());
                        }
                        Ok::<(), QueryError>(())
                    }
                })
                .await?;
            self.pending.remove(&key);
        }

        let known = self.known.lock();
        Ok(wanted
            .into_iter()
            .map(|id| (id, known.get(&id).cloned().unwrap_or_default()))
            .collect())
    }

    fn clear(&self) {
        self.pending.clear();
        self.known.lock().clear();
    }
}

/// Lazily materialized containment graph shared by all consumers of one view.
///
/// ```
/// use std::sync::Arc;
/// use canopy::{ContainerId, EngineConfig, MemoryDataset, StructuralCache};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let dataset = Arc::new(MemoryDataset::new().with_item(1, 100, 10));
/// let cache = StructuralCache::new(dataset.clone(), &EngineConfig::default());
///
/// let collections = cache.collections_of(ContainerId::new(100)).await.unwrap();
/// assert_eq!(collections.len(), 1);
/// assert!(collections[0].has_items);
/// # }
/// ```
pub struct StructuralCache {
    executor: Arc<dyn QueryExecutor>,
    tokens: RestartTokens,
    batch_limit: usize,
    collections: Memo<(), Arc<CollectionIndex>, QueryError>,
    sub_models: Memo<(), Arc<SubModelIndex>, QueryError>,
    counts: Memo<Pair, u64, QueryError>,
    count_batch: Arc<Mutex<Option<CountBatch>>>,
    next_batch: AtomicU64,
    children: ItemLookup<Vec<ItemId>>,
    locations: ItemLookup<Option<ItemLocation>>,
}

impl StructuralCache {
    /// Create an empty cache over `executor`.
    pub fn new(executor: Arc<dyn QueryExecutor>, config: &EngineConfig) -> Self {
        Self {
            executor,
            tokens: RestartTokens::new(config.restart_token_prefix.clone()),
            batch_limit: config.batch_limit(),
            collections: Memo::new(),
            sub_models: Memo::new(),
            counts: Memo::new(),
            count_batch: Arc::new(Mutex::new(None)),
            next_batch: AtomicU64::new(1),
            children: ItemLookup::new(),
            locations: ItemLookup::new(),
        }
    }

    /// Collections of each of `containers`. Containers without collections
    /// map to an empty list.
    pub async fn collections(
        &self,
        containers: &[ContainerId],
    ) -> Result<HashMap<ContainerId, Vec<CollectionSummary>>, QueryError> {
        let index = self.collection_index().await?;
        Ok(containers
            .iter()
            .map(|container| (*container, index.of_container(*container).to_vec()))
            .collect())
    }

    /// Collections of one container.
    pub async fn collections_of(
        &self,
        container: ContainerId,
    ) -> Result<Vec<CollectionSummary>, QueryError> {
        Ok(self.collection_index().await?.of_container(container).to_vec())
    }

    /// The nested container rooted at each of `items`, for those that root
    /// one.
    pub async fn sub_models(
        &self,
        items: &[ItemId],
    ) -> Result<HashMap<ItemId, ContainerId>, QueryError> {
        let index = self.sub_model_index().await?;
        Ok(items
            .iter()
            .filter_map(|item| Some((*item, index.of_item(*item)?.sub_model)))
            .collect())
    }

    /// Number of items in one (container, collection) pair.
    ///
    /// Counts requested before the current task yields are fetched together.
    pub async fn item_count(
        &self,
        container: ContainerId,
        collection: CollectionId,
    ) -> Result<u64, QueryError> {
        let pair = (container, collection);
        self.counts
            .get_or_start(pair, || {
                let batch = self.join_count_batch(pair);
                async move { Ok::<_, QueryError>(batch.await?.get(&pair).copied().unwrap_or(0)) }
            })
            .await
    }

    /// Direct children of each of `items`.
    pub async fn child_items(
        &self,
        items: &[ItemId],
    ) -> Result<HashMap<ItemId, Vec<ItemId>>, QueryError> {
        let executor = self.executor.clone();
        let tokens = self.tokens.clone();
        self.children
            .get(items, move |parents| async move {
                let token = tokens.keyed_token("child-items", digest(&parents));
                let rows = fetch(executor, StructuralQuery::ChildItems { parents }, token).await?;
                let mut children: HashMap<ItemId, Vec<ItemId>> = HashMap::new();
                for row in rows {
                    match row {
                        QueryRow::ChildItem { parent, child } => {
                            children.entry(parent).or_default().push(child)
                        }
                        other => return Err(unexpected("child-items", &other)),
                    }
                }
                for list in children.values_mut() {
                    list.sort_unstable();
                }
                Ok(children)
            })
            .await
    }

    /// Every item below `item` in its item sub-tree, parents before children.
    pub async fn descendants(&self, item: ItemId) -> Result<Vec<ItemId>, QueryError> {
        let mut seen = HashSet::from([item]);
        let mut all = Vec::new();
        let mut frontier = vec![item];
        while !frontier.is_empty() {
            let children = self.child_items(&frontier).await?;
            let mut next: Vec<ItemId> = frontier
                .iter()
                .flat_map(|parent| children.get(parent).into_iter().flatten().copied())
                .filter(|child| seen.insert(*child))
                .collect();
            next.sort_unstable();
            all.extend_from_slice(&next);
            frontier = next;
        }
        Ok(all)
    }

    /// Location of each of `items`. Unknown items are left out.
    pub async fn item_locations(
        &self,
        items: &[ItemId],
    ) -> Result<HashMap<ItemId, ItemLocation>, QueryError> {
        let executor = self.executor.clone();
        let tokens = self.tokens.clone();
        let found = self
            .locations
            .get(items, move |items| async move {
                let token = tokens.keyed_token("item-locations", digest(&items));
                let rows = fetch(executor, StructuralQuery::ItemLocations { items }, token).await?;
                let located: Result<HashMap<ItemId, Option<ItemLocation>>, QueryError> = rows
                    .into_iter()
                    .map(|row| match row {
                        QueryRow::ItemLocation {
                            item,
                            container,
                            collection,
                        } => Ok((
                            item,
                            Some(ItemLocation {
                                container,
                                collection,
                            }),
                        )),
                        other => Err(unexpected("item-locations", &other)),
                    })
                    .collect();
                located
            })
            .await?;
        Ok(found
            .into_iter()
            .filter_map(|(item, location)| Some((item, location?)))
            .collect())
    }

    /// Drop every cached relationship. Computations already handed out run to
    /// completion for their current waiters.
    pub fn dispose(&self) {
        self.collections.clear();
        self.sub_models.clear();
        self.counts.clear();
        self.count_batch.lock().take();
        self.children.clear();
        self.locations.clear();
        tracing::debug!(target: targets::CACHE, "structural cache disposed");
    }

    pub(crate) async fn collection_index(&self) -> Result<Arc<CollectionIndex>, QueryError> {
        let executor = self.executor.clone();
        let token = self.tokens.token("container-collections");
        self.collections
            .get_or_start((), move || async move {
                let rows = fetch(executor, StructuralQuery::ContainerCollections, token).await?;
                let mut index = CollectionIndex::default();
                for row in rows {
                    match row {
                        QueryRow::ContainerCollection {
                            container,
                            collection,
                            has_items,
                        } => index
                            .by_container
                            .entry(container)
                            .or_default()
                            .push(CollectionSummary {
                                id: collection,
                                has_items,
                            }),
                        other => return Err(unexpected("container-collections", &other)),
                    }
                }
                Ok(Arc::new(index))
            })
            .await
    }

    pub(crate) async fn sub_model_index(&self) -> Result<Arc<SubModelIndex>, QueryError> {
        let executor = self.executor.clone();
        let token = self.tokens.token("sub-models");
        self.sub_models
            .get_or_start((), move || async move {
                let rows = fetch(executor, StructuralQuery::SubModels, token).await?;
                let mut index = SubModelIndex::default();
                for row in rows {
                    match row {
                        QueryRow::SubModel {
                            item,
                            container,
                            collection,
                            sub_model,
                            dimension,
                        } => index.insert(SubModel {
                            item,
                            container,
                            collection,
                            sub_model,
                            dimension,
                        }),
                        other => return Err(unexpected("sub-models", &other)),
                    }
                }
                Ok(Arc::new(index))
            })
            .await
    }

    /// Add `pair` to the open count batch, opening one if needed.
    ///
    /// A batch stays open until its first poll yields once; everything joined
    /// by then is fetched together, split into chunks of at most
    /// `batch_limit` pairs.
    fn join_count_batch(&self, pair: Pair) -> SharedResult<CountMap, QueryError> {
        let mut slot = self.count_batch.lock();
        if let Some(batch) = slot.as_ref() {
            batch.pairs.lock().push(pair);
            return batch.result.clone();
        }

        let id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let pairs = Arc::new(Mutex::new(vec![pair]));
        let result = run_count_batch(
            id,
            Arc::downgrade(&self.count_batch),
            pairs.clone(),
            self.executor.clone(),
            self.tokens.clone(),
            self.batch_limit,
        )
        .boxed()
        .shared();
        *slot = Some(CountBatch {
            id,
            pairs,
            result: result.clone(),
        });
        result
    }
}

async fn run_count_batch(
    id: u64,
    slot: Weak<Mutex<Option<CountBatch>>>,
    pairs: Arc<Mutex<Vec<Pair>>>,
    executor: Arc<dyn QueryExecutor>,
    tokens: RestartTokens,
    limit: usize,
) -> Result<CountMap, QueryError> {
    tokio::task::yield_now().await;

    // Close the batch; joins happen under the slot lock, so none can follow.
    if let Some(slot) = slot.upgrade() {
        let mut slot = slot.lock();
        if slot.as_ref().is_some_and(|batch| batch.id == id) {
            *slot = None;
        }
    }
    let pairs = std::mem::take(&mut *pairs.lock());
    tracing::trace!(target: targets::CACHE, batch = id, pairs = pairs.len(), "item-count batch closed");

    let fetches = pairs.chunks(limit).map(|chunk| {
        let token = tokens.keyed_token("item-counts", digest(chunk));
        let query = StructuralQuery::ItemCounts {
            pairs: chunk.to_vec(),
        };
        fetch(executor.clone(), query, token)
    });

    let mut counts = HashMap::with_capacity(pairs.len());
    for rows in join_all(fetches).await {
        for row in rows? {
            match row {
                QueryRow::ItemCount {
                    container,
                    collection,
                    count,
                } => {
                    counts.insert((container, collection), count);
                }
                other => return Err(unexpected("item-counts", &other)),
            }
        }
    }
    Ok(Arc::new(counts))
}

async fn fetch(
    executor: Arc<dyn QueryExecutor>,
    query: StructuralQuery,
    token: RestartToken,
) -> Result<Vec<QueryRow>, QueryError> {
    let relationship = query.relationship();
    async move {
        tracing::debug!(target: targets::CACHE, relationship, token = %token, "structural fetch");
        let rows: Vec<QueryRow> = executor
            .run_query(query, token.clone())
            .try_collect()
            .await
            .inspect_err(|error| {
                tracing::warn!(target: targets::CACHE, relationship, token = %token, %error, "structural fetch failed");
            })?;
        tracing::trace!(target: targets::CACHE, relationship, rows = rows.len(), "structural fetch done");
        Ok(rows)
    }
    .instrument(async_span(span_names::FETCH))
    .await
}

fn unexpected(query: &'static str, row: &QueryRow) -> QueryError {
    QueryError::UnexpectedRow {
        query,
        row: row.kind(),
    }
}

/// Short stable key for a set of lookup keys.
fn digest<T: Hash + ?Sized>(keys: &T) -> String {
    let mut hasher = DefaultHasher::new();
    keys.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl std::fmt::Debug for StructuralCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuralCache")
            .field("tokens", &self.tokens)
            .field("batch_limit", &self.batch_limit)
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(StructuralCache: Send, Sync);
