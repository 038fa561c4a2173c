//! An in-memory [`QueryExecutor`].
//!
//! [`MemoryDataset`] answers structural queries from a hand-built model
//! graph. It records every query it runs, can be paused to keep queries in
//! flight, and can be told to fail the next query of a given relationship.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::QueryError;
use crate::ids::{CollectionId, ContainerId, ItemId};
use crate::node::Dimension;
use crate::query::{QueryExecutor, QueryRow, RestartToken, StructuralQuery};

#[derive(Debug, Clone)]
struct ItemRecord {
    container: ContainerId,
    collection: CollectionId,
    parent: Option<ItemId>,
    sub_model: Option<ContainerId>,
}

#[derive(Debug, Default)]
struct Graph {
    dimensions: HashMap<ContainerId, Dimension>,
    collections: BTreeMap<ContainerId, BTreeSet<CollectionId>>,
    items: BTreeMap<ItemId, ItemRecord>,
}

impl Graph {
    fn rows(&self, query: &StructuralQuery) -> Vec<QueryRow> {
        match query {
            StructuralQuery::ContainerCollections => self
                .collections
                .iter()
                .flat_map(|(container, collections)| {
                    collections.iter().map(|collection| QueryRow::ContainerCollection {
                        container: *container,
                        collection: *collection,
                        has_items: self.count(*container, *collection) > 0,
                    })
                })
                .collect(),
            StructuralQuery::ItemCounts { pairs } => pairs
                .iter()
                .map(|(container, collection)| QueryRow::ItemCount {
                    container: *container,
                    collection: *collection,
                    count: self.count(*container, *collection),
                })
                .collect(),
            StructuralQuery::SubModels => self
                .items
                .iter()
                .filter_map(|(id, item)| {
                    let sub_model = item.sub_model?;
                    Some(QueryRow::SubModel {
                        item: *id,
                        container: item.container,
                        collection: item.collection,
                        sub_model,
                        dimension: self.dimension(sub_model),
                    })
                })
                .collect(),
            StructuralQuery::ChildItems { parents } => self
                .items
                .iter()
                .filter_map(|(id, item)| {
                    let parent = item.parent?;
                    parents.contains(&parent).then_some(QueryRow::ChildItem {
                        parent,
                        child: *id,
                    })
                })
                .collect(),
            StructuralQuery::ItemLocations { items } => items
                .iter()
                .filter_map(|id| {
                    let item = self.items.get(id)?;
                    Some(QueryRow::ItemLocation {
                        item: *id,
                        container: item.container,
                        collection: item.collection,
                    })
                })
                .collect(),
        }
    }

    fn count(&self, container: ContainerId, collection: CollectionId) -> u64 {
        self.items
            .values()
            .filter(|item| item.container == container && item.collection == collection)
            .count() as u64
    }

    fn dimension(&self, container: ContainerId) -> Dimension {
        self.dimensions.get(&container).copied().unwrap_or_default()
    }
}

/// A record of one query run against a [`MemoryDataset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLogEntry {
    /// The query.
    pub query: StructuralQuery,
    /// The restart token it was issued with.
    pub restart: RestartToken,
}

/// An in-memory model graph that answers structural queries.
///
/// ```
/// use canopy::MemoryDataset;
///
/// let dataset = MemoryDataset::new()
///     .with_item(1, 100, 10)
///     .with_item(2, 100, 10)
///     .with_item(3, 100, 20);
/// assert_eq!(dataset.item_ids().len(), 3);
/// ```
pub struct MemoryDataset {
    graph: Mutex<Graph>,
    log: Mutex<Vec<QueryLogEntry>>,
    failures: Mutex<HashMap<&'static str, QueryError>>,
    paused: watch::Sender<bool>,
}

impl Default for MemoryDataset {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataset {
    /// An empty dataset.
    pub fn new() -> Self {
        Self {
            graph: Mutex::new(Graph::default()),
            log: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            paused: watch::Sender::new(false),
        }
    }

    /// Declare a container with its dimensionality.
    pub fn with_container(self, id: impl Into<ContainerId>, dimension: Dimension) -> Self {
        self.graph.lock().dimensions.insert(id.into(), dimension);
        self
    }

    /// Declare a collection under a container, possibly without items.
    pub fn with_collection(
        self,
        container: impl Into<ContainerId>,
        collection: impl Into<CollectionId>,
    ) -> Self {
        self.graph
            .lock()
            .collections
            .entry(container.into())
            .or_default()
            .insert(collection.into());
        self
    }

    /// Add an item. Its container and collection are declared implicitly.
    pub fn with_item(
        self,
        id: impl Into<ItemId>,
        container: impl Into<ContainerId>,
        collection: impl Into<CollectionId>,
    ) -> Self {
        let (container, collection) = (container.into(), collection.into());
        {
            let mut graph = self.graph.lock();
            graph
                .collections
                .entry(container)
                .or_default()
                .insert(collection);
            graph.items.insert(
                id.into(),
                ItemRecord {
                    container,
                    collection,
                    parent: None,
                    sub_model: None,
                },
            );
        }
        self
    }

    /// Make `child` a child of `parent`. Both must already exist.
    pub fn with_parent(self, child: impl Into<ItemId>, parent: impl Into<ItemId>) -> Self {
        if let Some(item) = self.graph.lock().items.get_mut(&child.into()) {
            item.parent = Some(parent.into());
        }
        self
    }

    /// Make `item` the root of the nested container `sub_model`.
    pub fn with_sub_model(self, item: impl Into<ItemId>, sub_model: impl Into<ContainerId>) -> Self {
        if let Some(item) = self.graph.lock().items.get_mut(&item.into()) {
            item.sub_model = Some(sub_model.into());
        }
        self
    }

    /// All item ids, sorted.
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.graph.lock().items.keys().copied().collect()
    }

    /// Collections declared under `container`, sorted.
    pub fn collections_of(&self, container: ContainerId) -> Vec<CollectionId> {
        self.graph
            .lock()
            .collections
            .get(&container)
            .map(|collections| collections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every query run so far.
    pub fn query_log(&self) -> Vec<QueryLogEntry> {
        self.log.lock().clone()
    }

    /// Number of queries run so far for one relationship
    /// (see [`StructuralQuery::relationship`]).
    pub fn query_count(&self, relationship: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|entry| entry.query.relationship() == relationship)
            .count()
    }

    /// Fail the next query for `relationship` with `error`.
    pub fn fail_next(&self, relationship: &'static str, error: QueryError) {
        self.failures.lock().insert(relationship, error);
    }

    /// Hold every query (including ones already started) until resumed.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Release held queries.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }
}

impl QueryExecutor for MemoryDataset {
    fn run_query(
        &self,
        query: StructuralQuery,
        restart: RestartToken,
    ) -> BoxStream<'static, Result<QueryRow, QueryError>> {
        let relationship = query.relationship();
        self.log.lock().push(QueryLogEntry {
            query: query.clone(),
            restart,
        });

        let rows: Vec<Result<QueryRow, QueryError>> =
            match self.failures.lock().remove(relationship) {
                Some(error) => vec![Err(error)],
                None => self.graph.lock().rows(&query).into_iter().map(Ok).collect(),
            };

        let mut paused = self.paused.subscribe();
        stream::once(async move {
            // Always yield once so callers observe the query as in flight.
            tokio::task::yield_now().await;
            let _ = paused.wait_for(|paused| !paused).await;
            stream::iter(rows)
        })
        .flatten()
        .boxed()
    }
}

impl std::fmt::Debug for MemoryDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.graph.lock();
        f.debug_struct("MemoryDataset")
            .field("containers", &graph.collections.len())
            .field("items", &graph.items.len())
            .field("queries", &self.log.lock().len())
            .finish()
    }
}
