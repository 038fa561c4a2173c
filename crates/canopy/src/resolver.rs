//! Visibility status resolution.
//!
//! The resolver reconciles four sources of truth into one status per node:
//!
//! 1. the always-shown and never-shown item sets (never-shown wins),
//! 2. the per-(container, collection) override table,
//! 3. the category selector of the display surface,
//! 4. the status of nested containers rooted at items.
//!
//! Container and (container, collection) statuses are memoized for the
//! current state generation, so sibling nodes asking for the same
//! sub-computation share one future. The memo is dropped whenever the
//! display state changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use canopy_core::logging::targets;
use canopy_core::{Memo, SharedResult};
use futures_util::future::try_join_all;

use crate::cache::StructuralCache;
use crate::error::{QueryError, Result};
use crate::ids::{CollectionId, ContainerId, ItemId};
use crate::node::{Dimension, HierarchyNode, ItemNode};
use crate::status::{StatusMerger, VisibilityStatus, status_from_counts};
use crate::surface::{DisplaySurface, category_status};

type Pair = (ContainerId, CollectionId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StatusKey {
    Container(ContainerId, Dimension),
    Pair(ContainerId, CollectionId),
}

/// The override sets of one generation, indexed by pair.
#[derive(Debug, Default)]
struct Membership {
    /// Always-shown items that are not also never-shown.
    always: HashSet<ItemId>,
    never: HashSet<ItemId>,
    exclusive: bool,
    always_by_pair: HashMap<Pair, u64>,
    never_by_pair: HashMap<Pair, u64>,
}

impl Membership {
    fn always_in(&self, pair: Pair) -> u64 {
        self.always_by_pair.get(&pair).copied().unwrap_or(0)
    }

    fn never_in(&self, pair: Pair) -> u64 {
        self.never_by_pair.get(&pair).copied().unwrap_or(0)
    }
}

pub(crate) struct Resolver {
    cache: Arc<StructuralCache>,
    surface: Arc<dyn DisplaySurface>,
    statuses: Memo<StatusKey, VisibilityStatus, QueryError>,
    membership: Memo<(), Arc<Membership>, QueryError>,
    generation: AtomicU64,
}

impl Resolver {
    pub(crate) fn new(cache: Arc<StructuralCache>, surface: Arc<dyn DisplaySurface>) -> Self {
        Self {
            cache,
            surface,
            statuses: Memo::new(),
            membership: Memo::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Start a new state generation.
    pub(crate) fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.statuses.clear();
        self.membership.clear();
        tracing::trace!(target: targets::RESOLVER, generation, "status memo cleared");
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of status computations started since creation.
    #[cfg(test)]
    pub(crate) fn computations(&self) -> u64 {
        self.statuses.starts()
    }

    pub(crate) async fn resolve(self: &Arc<Self>, node: &HierarchyNode) -> Result<VisibilityStatus> {
        node.validate_for_resolve()?;
        let status = match node {
            HierarchyNode::Container(container) => {
                self.container_status(container.id, container.dimension)
                    .await?
            }
            HierarchyNode::Collection(collection) => {
                let per_container = try_join_all(
                    collection
                        .containers
                        .iter()
                        .map(|container| self.pair_status(*container, collection.id)),
                )
                .await?;
                StatusMerger::from_iter(per_container).finish_or(VisibilityStatus::Hidden)
            }
            HierarchyNode::Item(item) => self.item_status(item).await?,
        };
        tracing::trace!(target: targets::RESOLVER, node = %node.key(), %status, "resolved");
        Ok(status)
    }

    fn container_status(
        self: &Arc<Self>,
        id: ContainerId,
        dimension: Dimension,
    ) -> SharedResult<VisibilityStatus, QueryError> {
        let this = self.clone();
        self.statuses
            .get_or_start(StatusKey::Container(id, dimension), move || async move {
                this.compute_container(id, dimension).await
            })
    }

    fn pair_status(
        self: &Arc<Self>,
        container: ContainerId,
        collection: CollectionId,
    ) -> SharedResult<VisibilityStatus, QueryError> {
        let this = self.clone();
        self.statuses
            .get_or_start(StatusKey::Pair(container, collection), move || async move {
                this.compute_pair(container, collection).await
            })
    }

    fn membership(&self) -> SharedResult<Arc<Membership>, QueryError> {
        let cache = self.cache.clone();
        let surface = self.surface.clone();
        self.membership.get_or_start((), move || async move {
            let never = surface.never_shown();
            let mut always = surface.always_shown();
            always.retain(|item| !never.contains(item));
            let exclusive = surface.is_always_shown_exclusive();

            let listed: Vec<ItemId> = always.iter().chain(&never).copied().collect();
            let locations = if listed.is_empty() {
                HashMap::new()
            } else {
                cache.item_locations(&listed).await?
            };

            let mut membership = Membership {
                always,
                never,
                exclusive,
                ..Membership::default()
            };
            for (item, location) in &locations {
                let pair = (location.container, location.collection);
                if membership.never.contains(item) {
                    *membership.never_by_pair.entry(pair).or_default() += 1;
                } else {
                    *membership.always_by_pair.entry(pair).or_default() += 1;
                }
            }
            Ok::<_, QueryError>(Arc::new(membership))
        })
    }

    async fn compute_container(
        self: Arc<Self>,
        id: ContainerId,
        dimension: Dimension,
    ) -> std::result::Result<VisibilityStatus, QueryError> {
        if dimension != self.surface.view_mode() {
            return Ok(VisibilityStatus::Disabled);
        }

        if !self.surface.is_container_shown(id) {
            // Only nested containers can still show something.
            let sub_models = self.cache.sub_model_index().await?;
            let nested = try_join_all(
                sub_models
                    .of_container(id)
                    .iter()
                    .map(|sub_model| self.container_status(sub_model.sub_model, sub_model.dimension)),
            )
            .await?;
            let merged: StatusMerger = nested
                .into_iter()
                .map(VisibilityStatus::through_hidden_parent)
                .collect();
            return Ok(merged.finish_or(VisibilityStatus::Hidden));
        }

        // Empty collections have nothing to show and do not take part.
        let collections = self.cache.collections_of(id).await?;
        let statuses = try_join_all(
            collections
                .iter()
                .filter(|collection| collection.has_items)
                .map(|collection| self.pair_status(id, collection.id)),
        )
        .await?;
        Ok(StatusMerger::from_iter(statuses).finish_or(VisibilityStatus::Visible))
    }

    async fn compute_pair(
        self: Arc<Self>,
        container: ContainerId,
        collection: CollectionId,
    ) -> std::result::Result<VisibilityStatus, QueryError> {
        let mut merger = StatusMerger::new();
        if self.surface.is_container_shown(container) {
            merger.push(self.direct_pair_status(container, collection).await?);
        } else {
            merger.push(VisibilityStatus::Hidden);
        }
        if merger.is_settled() {
            return Ok(VisibilityStatus::Partial);
        }

        let sub_models = self.cache.sub_model_index().await?;
        let nested = try_join_all(
            sub_models
                .of_pair(container, collection)
                .iter()
                .map(|sub_model| self.container_status(sub_model.sub_model, sub_model.dimension)),
        )
        .await?;
        merger.extend(nested);
        Ok(merger.finish_or(VisibilityStatus::Hidden))
    }

    /// Status of a pair's own items under a shown container.
    async fn direct_pair_status(
        &self,
        container: ContainerId,
        collection: CollectionId,
    ) -> std::result::Result<VisibilityStatus, QueryError> {
        let pair = (container, collection);
        let membership = self.membership().await?;
        let (always, never) = (membership.always_in(pair), membership.never_in(pair));

        if membership.exclusive {
            if always == 0 {
                return Ok(VisibilityStatus::Hidden);
            }
            let total = self.cache.item_count(container, collection).await?;
            return Ok(status_from_counts(total, always, never, VisibilityStatus::Hidden));
        }

        let default = category_status(&*self.surface, container, collection);
        if always == 0 && never == 0 {
            return Ok(default);
        }
        let total = self.cache.item_count(container, collection).await?;
        Ok(status_from_counts(total, always, never, default))
    }

    async fn item_status(
        self: &Arc<Self>,
        item: &ItemNode,
    ) -> std::result::Result<VisibilityStatus, QueryError> {
        let sub_models = self.cache.sub_model_index().await?;
        let nested = match item.sub_model {
            Some(id) => Some((
                id,
                sub_models
                    .dimension_of(id)
                    .unwrap_or_else(|| self.surface.view_mode()),
            )),
            None => sub_models
                .of_item(item.id)
                .map(|sub_model| (sub_model.sub_model, sub_model.dimension)),
        };

        if !self.surface.is_container_shown(item.container) {
            return match nested {
                Some((id, dimension)) => Ok(self
                    .container_status(id, dimension)
                    .await?
                    .through_hidden_parent()),
                None => Ok(VisibilityStatus::Hidden),
            };
        }

        let membership = self.membership().await?;
        let direct = if membership.never.contains(&item.id) {
            VisibilityStatus::Hidden
        } else if membership.always.contains(&item.id) {
            VisibilityStatus::Visible
        } else if membership.exclusive {
            VisibilityStatus::Hidden
        } else {
            category_status(&*self.surface, item.container, item.collection)
        };

        match nested {
            Some((id, dimension)) => Ok(direct.merge(self.container_status(id, dimension).await?)),
            None => Ok(direct),
        }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("generation", &self.generation())
            .field("statuses", &self.statuses)
            .finish_non_exhaustive()
    }
}
