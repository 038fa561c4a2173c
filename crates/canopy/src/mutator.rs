//! Visibility mutation planning and commit.
//!
//! A mutation is planned against a [`Plan`], a staged overlay of the display
//! surface that records every write and answers reads as if the writes had
//! already happened. Planning may fetch structure and may fail; nothing
//! reaches the surface until [`Plan::commit`] applies the recorded operations
//! in order. Failing midway therefore leaves the surface untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use canopy_core::logging::{PerfSpan, span_names, targets};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::cache::{ItemLocation, StructuralCache};
use crate::config::EngineConfig;
use crate::error::QueryError;
use crate::ids::{CollectionId, ContainerId, ItemId};
use crate::node::{CollectionNode, Dimension, HierarchyNode, ItemNode};
use crate::status::VisibilityStatus;
use crate::surface::{
    CategoryOverride, DisplaySurface, OverrideScope, SurfaceRead, category_status,
};

/// One staged write.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SurfaceOp {
    ShowContainers(Vec<ContainerId>, bool),
    CategorySelector(Vec<CollectionId>, bool),
    SetOverride(ContainerId, CollectionId, CategoryOverride),
    ClearOverrides(OverrideScope),
}

/// Staged writes over a display surface.
pub(crate) struct Plan {
    base: Arc<dyn DisplaySurface>,
    ops: Vec<SurfaceOp>,
    containers: HashMap<ContainerId, bool>,
    selectors: HashMap<CollectionId, bool>,
    overrides: HashMap<(ContainerId, CollectionId), CategoryOverride>,
    cleared: Vec<OverrideScope>,
    always: Option<HashSet<ItemId>>,
    never: Option<HashSet<ItemId>>,
    visited: HashSet<(ContainerId, bool)>,
}

impl Plan {
    pub(crate) fn new(base: Arc<dyn DisplaySurface>) -> Self {
        Self {
            base,
            ops: Vec::new(),
            containers: HashMap::new(),
            selectors: HashMap::new(),
            overrides: HashMap::new(),
            cleared: Vec::new(),
            always: None,
            never: None,
            visited: HashSet::new(),
        }
    }

    fn show_container(&mut self, id: ContainerId, shown: bool) {
        self.containers.insert(id, shown);
        self.ops.push(SurfaceOp::ShowContainers(vec![id], shown));
    }

    fn set_selector(&mut self, id: CollectionId, on: bool) {
        self.selectors.insert(id, on);
        self.ops.push(SurfaceOp::CategorySelector(vec![id], on));
    }

    fn set_override(&mut self, container: ContainerId, collection: CollectionId, value: CategoryOverride) {
        self.overrides.insert((container, collection), value);
        self.ops
            .push(SurfaceOp::SetOverride(container, collection, value));
    }

    fn clear_overrides(&mut self, scope: OverrideScope) {
        self.overrides
            .retain(|(container, collection), _| !scope.covers(*container, *collection));
        self.cleared.push(scope);
        self.ops.push(SurfaceOp::ClearOverrides(scope));
    }

    fn always_mut(&mut self) -> &mut HashSet<ItemId> {
        let base = &self.base;
        self.always.get_or_insert_with(|| base.always_shown())
    }

    fn never_mut(&mut self) -> &mut HashSet<ItemId> {
        let base = &self.base;
        self.never.get_or_insert_with(|| base.never_shown())
    }

    /// Number of surface writes the commit will perform.
    pub(crate) fn len(&self) -> usize {
        self.ops.len() + usize::from(self.always.is_some()) + usize::from(self.never.is_some())
    }

    /// Apply every staged write to the surface, in planning order.
    pub(crate) fn commit(self) -> usize {
        let _span = PerfSpan::new(span_names::COMMIT);
        let writes = self.len();
        for op in self.ops {
            match op {
                SurfaceOp::ShowContainers(ids, shown) => self.base.set_containers_shown(&ids, shown),
                SurfaceOp::CategorySelector(ids, on) => self.base.set_category_selector(&ids, on),
                SurfaceOp::SetOverride(container, collection, value) => {
                    self.base.set_category_override(container, collection, value)
                }
                SurfaceOp::ClearOverrides(scope) => self.base.clear_category_overrides(scope),
            }
        }
        if let Some(always) = self.always {
            self.base.set_always_shown(always);
        }
        if let Some(never) = self.never {
            self.base.set_never_shown(never);
        }
        tracing::debug!(target: targets::MUTATOR, writes, "mutation committed");
        writes
    }
}

impl SurfaceRead for Plan {
    fn view_mode(&self) -> Dimension {
        self.base.view_mode()
    }

    fn is_container_shown(&self, id: ContainerId) -> bool {
        match self.containers.get(&id) {
            Some(shown) => *shown,
            None => self.base.is_container_shown(id),
        }
    }

    fn is_category_selector_on(&self, id: CollectionId) -> bool {
        match self.selectors.get(&id) {
            Some(on) => *on,
            None => self.base.is_category_selector_on(id),
        }
    }

    fn category_override(&self, container: ContainerId, collection: CollectionId) -> CategoryOverride {
        if let Some(value) = self.overrides.get(&(container, collection)) {
            return *value;
        }
        if self.cleared.iter().any(|scope| scope.covers(container, collection)) {
            return CategoryOverride::None;
        }
        self.base.category_override(container, collection)
    }

    fn always_shown(&self) -> HashSet<ItemId> {
        match &self.always {
            Some(always) => always.clone(),
            None => self.base.always_shown(),
        }
    }

    fn never_shown(&self) -> HashSet<ItemId> {
        match &self.never {
            Some(never) => never.clone(),
            None => self.base.never_shown(),
        }
    }

    fn is_always_shown_exclusive(&self) -> bool {
        self.base.is_always_shown_exclusive()
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("ops", &self.ops)
            .field("always", &self.always.as_ref().map(HashSet::len))
            .field("never", &self.never.as_ref().map(HashSet::len))
            .finish()
    }
}

/// Plans visibility changes.
pub(crate) struct Mutator {
    cache: Arc<StructuralCache>,
    surface: Arc<dyn DisplaySurface>,
    isolate_on_activation: bool,
}

impl Mutator {
    pub(crate) fn new(
        cache: Arc<StructuralCache>,
        surface: Arc<dyn DisplaySurface>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            cache,
            surface,
            isolate_on_activation: config.isolate_on_activation,
        }
    }

    /// Plan turning `node` on or off.
    pub(crate) async fn plan(&self, node: &HierarchyNode, on: bool) -> Result<Plan, QueryError> {
        let mut plan = Plan::new(self.surface.clone());
        match node {
            HierarchyNode::Container(container) => self.set_container(&mut plan, container.id, on).await?,
            HierarchyNode::Collection(collection) => self.set_collection(&mut plan, collection, on).await?,
            HierarchyNode::Item(item) => self.set_item(&mut plan, item, on).await?,
        }
        tracing::debug!(target: targets::MUTATOR, node = %node.key(), on, writes = plan.len(), "mutation planned");
        Ok(plan)
    }

    fn set_container<'a>(
        &'a self,
        plan: &'a mut Plan,
        id: ContainerId,
        on: bool,
    ) -> BoxFuture<'a, Result<(), QueryError>> {
        async move {
            // Nested containers may be reachable along several paths.
            if !plan.visited.insert((id, on)) {
                return Ok(());
            }
            if on {
                plan.show_container(id, true);
                for collection in self.cache.collections_of(id).await? {
                    if collection.has_items {
                        self.set_pair(plan, id, collection.id, true).await?;
                    }
                }
            } else {
                plan.clear_overrides(OverrideScope::Container(id));
                plan.show_container(id, false);
                let sub_models = self.cache.sub_model_index().await?;
                for sub_model in sub_models.of_container(id) {
                    self.set_container(plan, sub_model.sub_model, false).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn set_collection(
        &self,
        plan: &mut Plan,
        collection: &CollectionNode,
        on: bool,
    ) -> Result<(), QueryError> {
        if collection.containers.is_empty() {
            // The collection everywhere: drive its global selector.
            plan.clear_overrides(OverrideScope::Collection(collection.id));
            plan.set_selector(collection.id, on);
            return Ok(());
        }
        for container in &collection.containers {
            self.set_pair(plan, *container, collection.id, on).await?;
        }
        Ok(())
    }

    async fn set_pair(
        &self,
        plan: &mut Plan,
        container: ContainerId,
        collection: CollectionId,
        on: bool,
    ) -> Result<(), QueryError> {
        if on && !plan.is_container_shown(container) {
            self.activate(plan, container).await?;
        }
        let value = if on {
            CategoryOverride::Show
        } else {
            CategoryOverride::Hide
        };
        plan.set_override(container, collection, value);
        self.forget_items(plan, |location| {
            location.container == container && location.collection == collection
        })
        .await?;

        let sub_models = self.cache.sub_model_index().await?;
        for sub_model in sub_models.of_pair(container, collection) {
            self.set_container(plan, sub_model.sub_model, on).await?;
        }
        Ok(())
    }

    async fn set_item(&self, plan: &mut Plan, item: &ItemNode, on: bool) -> Result<(), QueryError> {
        if on && !plan.is_container_shown(item.container) {
            self.activate(plan, item.container).await?;
        }

        let descendants = self.cache.descendants(item.id).await?;
        let locations = self.cache.item_locations(&descendants).await?;
        let mut affected = vec![(item.id, item.container, item.collection)];
        affected.extend(descendants.iter().map(|child| {
            let location = locations.get(child);
            (
                *child,
                location.map_or(item.container, |l| l.container),
                location.map_or(item.collection, |l| l.collection),
            )
        }));

        let exclusive = plan.is_always_shown_exclusive();
        for (id, container, collection) in &affected {
            let shown_by_default = plan.is_container_shown(*container)
                && category_status(&*plan, *container, *collection) == VisibilityStatus::Visible;
            if on {
                plan.never_mut().remove(id);
                if exclusive || !shown_by_default {
                    plan.always_mut().insert(*id);
                }
            } else {
                plan.always_mut().remove(id);
                if shown_by_default && !exclusive {
                    plan.never_mut().insert(*id);
                }
            }
        }

        let sub_models = self.cache.sub_model_index().await?;
        let mut nested: Vec<ContainerId> = affected
            .iter()
            .filter_map(|(id, _, _)| sub_models.of_item(*id).map(|sub_model| sub_model.sub_model))
            .collect();
        nested.extend(item.sub_model);
        nested.sort_unstable();
        nested.dedup();
        for container in nested {
            self.set_container(plan, container, on).await?;
        }
        Ok(())
    }

    /// Show a hidden container before turning one of its collections or
    /// items on.
    ///
    /// With isolation, every collection of the container is set to `Hide`
    /// and the container's always-shown items are dropped, so the request
    /// that follows is the only thing that becomes visible.
    async fn activate(&self, plan: &mut Plan, container: ContainerId) -> Result<(), QueryError> {
        plan.show_container(container, true);
        if !self.isolate_on_activation {
            return Ok(());
        }
        tracing::trace!(target: targets::MUTATOR, %container, "isolating container on activation");
        for collection in self.cache.collections_of(container).await? {
            if collection.has_items {
                plan.set_override(container, collection.id, CategoryOverride::Hide);
            }
        }
        let always = plan.always_shown();
        if always.is_empty() {
            return Ok(());
        }
        let ids: Vec<ItemId> = always.into_iter().collect();
        let locations = self.cache.item_locations(&ids).await?;
        plan.always_mut()
            .retain(|id| locations.get(id).is_none_or(|l| l.container != container));
        Ok(())
    }

    /// Drop always/never-shown entries whose location matches.
    async fn forget_items<F>(&self, plan: &mut Plan, matches: F) -> Result<(), QueryError>
    where
        F: Fn(&ItemLocation) -> bool,
    {
        let mut listed: Vec<ItemId> = plan.always_shown().into_iter().collect();
        listed.extend(plan.never_shown());
        if listed.is_empty() {
            return Ok(());
        }
        let locations = self.cache.item_locations(&listed).await?;
        let stale: HashSet<ItemId> = locations
            .iter()
            .filter_map(|(id, location)| matches(location).then_some(*id))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        plan.always_mut().retain(|id| !stale.contains(id));
        plan.never_mut().retain(|id| !stale.contains(id));
        Ok(())
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("isolate_on_activation", &self.isolate_on_activation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemoryDataset;
    use crate::view_state::ViewState;

    const M1: u64 = 100;
    const C1: u64 = 10;
    const C2: u64 = 20;

    fn m(id: u64) -> ContainerId {
        ContainerId::new(id)
    }

    fn c(id: u64) -> CollectionId {
        CollectionId::new(id)
    }

    fn setup(config: EngineConfig) -> (Arc<ViewState>, Mutator) {
        let dataset = Arc::new(
            MemoryDataset::new()
                .with_item(1, M1, C1)
                .with_item(2, M1, C1)
                .with_item(3, M1, C2)
                .with_item(4, M1, C2)
                .with_parent(4, 3)
                .with_sub_model(2, 300)
                .with_item(5, 300, C1),
        );
        let view = Arc::new(ViewState::new());
        let cache = Arc::new(StructuralCache::new(dataset, &config));
        let mutator = Mutator::new(cache, view.clone(), &config);
        (view, mutator)
    }

    #[tokio::test]
    async fn test_plan_reads_its_own_writes() {
        let (view, _) = setup(EngineConfig::default());
        let mut plan = Plan::new(view.clone());
        plan.set_override(m(M1), c(C1), CategoryOverride::Show);
        plan.clear_overrides(OverrideScope::Container(m(M1)));
        assert_eq!(plan.category_override(m(M1), c(C1)), CategoryOverride::None);
        plan.set_override(m(M1), c(C1), CategoryOverride::Hide);
        assert_eq!(plan.category_override(m(M1), c(C1)), CategoryOverride::Hide);

        // Nothing reaches the surface before commit.
        assert!(view.category_overrides().is_empty());
        plan.commit();
        assert_eq!(
            view.category_overrides(),
            vec![((m(M1), c(C1)), CategoryOverride::Hide)]
        );
    }

    #[tokio::test]
    async fn test_collection_on_isolates_hidden_container() {
        let (view, mutator) = setup(EngineConfig::default());
        let node = HierarchyNode::collection(C1, [m(M1)]);
        mutator.plan(&node, true).await.unwrap().commit();

        assert!(view.is_container_shown(m(M1)));
        assert_eq!(view.category_override(m(M1), c(C1)), CategoryOverride::Show);
        assert_eq!(view.category_override(m(M1), c(C2)), CategoryOverride::Hide);
        // Item 2 roots container 300, which follows the collection.
        assert!(view.is_container_shown(m(300)));
        assert_eq!(view.category_override(m(300), c(C1)), CategoryOverride::Show);
    }

    #[tokio::test]
    async fn test_activation_without_isolation_only_shows_container() {
        let (view, mutator) = setup(EngineConfig::default().with_isolate_on_activation(false));
        let node = HierarchyNode::collection(C1, [m(M1)]);
        mutator.plan(&node, true).await.unwrap().commit();
        assert!(view.is_container_shown(m(M1)));
        assert_eq!(view.category_override(m(M1), c(C2)), CategoryOverride::None);
    }

    #[tokio::test]
    async fn test_collection_change_clears_stale_item_overrides() {
        let (view, mutator) = setup(EngineConfig::default());
        view.set_containers_shown(&[m(M1)], true);
        view.set_always_shown(HashSet::from([ItemId::new(1), ItemId::new(3)]));
        view.set_never_shown(HashSet::from([ItemId::new(2)]));

        let node = HierarchyNode::collection(C1, [m(M1)]);
        mutator.plan(&node, false).await.unwrap().commit();
        assert_eq!(view.always_shown(), HashSet::from([ItemId::new(3)]));
        assert!(view.never_shown().is_empty());
    }

    #[tokio::test]
    async fn test_collection_without_context_drives_selector() {
        let (view, mutator) = setup(EngineConfig::default());
        view.set_category_override(m(M1), c(C1), CategoryOverride::Hide);
        let node = HierarchyNode::collection(C1, []);
        mutator.plan(&node, true).await.unwrap().commit();
        assert!(view.is_category_selector_on(c(C1)));
        assert!(view.category_overrides().is_empty());
    }

    #[tokio::test]
    async fn test_container_off_cascades_into_sub_models() {
        let (view, mutator) = setup(EngineConfig::default());
        view.set_containers_shown(&[m(M1), m(300)], true);
        view.set_category_override(m(M1), c(C1), CategoryOverride::Show);

        mutator
            .plan(&HierarchyNode::container(M1), false)
            .await
            .unwrap()
            .commit();
        assert!(!view.is_container_shown(m(M1)));
        assert!(!view.is_container_shown(m(300)));
        assert!(view.category_overrides().is_empty());
    }

    #[tokio::test]
    async fn test_item_off_applies_to_descendants() {
        let (view, mutator) = setup(EngineConfig::default());
        view.set_containers_shown(&[m(M1)], true);
        view.set_category_selector(&[c(C2)], true);

        let node = HierarchyNode::item(3, M1, C2);
        mutator.plan(&node, false).await.unwrap().commit();
        assert_eq!(
            view.never_shown(),
            HashSet::from([ItemId::new(3), ItemId::new(4)])
        );
        assert!(view.always_shown().is_empty());
    }

    #[tokio::test]
    async fn test_item_on_under_hidden_default() {
        let (view, mutator) = setup(EngineConfig::default());
        view.set_containers_shown(&[m(M1)], true);
        view.set_never_shown(HashSet::from([ItemId::new(1)]));

        let node = HierarchyNode::item(1, M1, C1);
        mutator.plan(&node, true).await.unwrap().commit();
        assert!(view.never_shown().is_empty());
        assert_eq!(view.always_shown(), HashSet::from([ItemId::new(1)]));
    }

    #[tokio::test]
    async fn test_failed_planning_leaves_surface_untouched() {
        let dataset = Arc::new(MemoryDataset::new().with_item(1, M1, C1));
        dataset.fail_next("container-collections", QueryError::Failed("offline".into()));
        let view = Arc::new(ViewState::new());
        let config = EngineConfig::default();
        let cache = Arc::new(StructuralCache::new(dataset, &config));
        let mutator = Mutator::new(cache, view.clone(), &config);

        let result = mutator
            .plan(&HierarchyNode::collection(C1, [m(M1)]), true)
            .await;
        assert_eq!(result.unwrap_err(), QueryError::Failed("offline".into()));
        assert!(!view.is_container_shown(m(M1)));
        assert!(view.category_overrides().is_empty());
    }
}
