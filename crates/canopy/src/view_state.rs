//! An in-memory display surface.
//!
//! [`ViewState`] keeps the selector and override state of one view in plain
//! collections and emits [`SurfaceChange`] only when a write actually changes
//! something.
//!
//! # Example
//!
//! ```
//! use canopy::{CollectionId, ContainerId, DisplaySurface, SurfaceRead, ViewState};
//!
//! let view = ViewState::new().with_category_selector_on([CollectionId::new(7)]);
//! view.set_containers_shown(&[ContainerId::new(1)], true);
//! assert!(view.is_container_shown(ContainerId::new(1)));
//! assert!(view.is_category_selector_on(CollectionId::new(7)));
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use canopy_core::Signal;
use parking_lot::RwLock;

use crate::ids::{CollectionId, ContainerId, ItemId};
use crate::node::Dimension;
use crate::surface::{CategoryOverride, DisplaySurface, OverrideScope, SurfaceChange, SurfaceRead};

#[derive(Debug, Default)]
struct State {
    view_mode: Dimension,
    shown_containers: HashSet<ContainerId>,
    selector_on: HashSet<CollectionId>,
    overrides: HashMap<(ContainerId, CollectionId), CategoryOverride>,
    always_shown: HashSet<ItemId>,
    never_shown: HashSet<ItemId>,
    always_shown_exclusive: bool,
}

/// Selector and override state of one view.
#[derive(Default)]
pub struct ViewState {
    state: RwLock<State>,
    changed: Arc<Signal<SurfaceChange>>,
}

impl ViewState {
    /// An empty 3D view: no container shown, every selector off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the given view mode.
    pub fn with_view_mode(self, mode: Dimension) -> Self {
        self.state.write().view_mode = mode;
        self
    }

    /// Start with the given containers shown.
    pub fn with_containers_shown(self, ids: impl IntoIterator<Item = ContainerId>) -> Self {
        self.state.write().shown_containers.extend(ids);
        self
    }

    /// Start with the given category selectors on.
    pub fn with_category_selector_on(self, ids: impl IntoIterator<Item = CollectionId>) -> Self {
        self.state.write().selector_on.extend(ids);
        self
    }

    /// Start with the given never-shown set.
    pub fn with_never_shown(self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.state.write().never_shown.extend(ids);
        self
    }

    /// Start with the given always-shown set.
    pub fn with_always_shown(self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.state.write().always_shown.extend(ids);
        self
    }

    /// Change the view mode.
    pub fn set_view_mode(&self, mode: Dimension) {
        let changed = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.view_mode, mode) != mode
        };
        self.notify(changed, SurfaceChange::ViewMode);
    }

    /// Turn exclusive always-shown mode on or off.
    pub fn set_always_shown_exclusive(&self, exclusive: bool) {
        let changed = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.always_shown_exclusive, exclusive) != exclusive
        };
        self.notify(changed, SurfaceChange::AlwaysShown);
    }

    /// Every non-`None` override, sorted by pair.
    pub fn category_overrides(&self) -> Vec<((ContainerId, CollectionId), CategoryOverride)> {
        let mut overrides: Vec<_> = self
            .state
            .read()
            .overrides
            .iter()
            .map(|(pair, value)| (*pair, *value))
            .collect();
        overrides.sort_by_key(|(pair, _)| *pair);
        overrides
    }

    /// Shown containers, sorted.
    pub fn shown_containers(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.state.read().shown_containers.iter().copied().collect();
        ids.sort();
        ids
    }

    fn notify(&self, changed: bool, change: SurfaceChange) {
        // Emit outside the lock; slots may read the state back.
        if changed {
            self.changed.emit(change);
        }
    }
}

impl SurfaceRead for ViewState {
    fn view_mode(&self) -> Dimension {
        self.state.read().view_mode
    }

    fn is_container_shown(&self, id: ContainerId) -> bool {
        self.state.read().shown_containers.contains(&id)
    }

    fn is_category_selector_on(&self, id: CollectionId) -> bool {
        self.state.read().selector_on.contains(&id)
    }

    fn category_override(
        &self,
        container: ContainerId,
        collection: CollectionId,
    ) -> CategoryOverride {
        self.state
            .read()
            .overrides
            .get(&(container, collection))
            .copied()
            .unwrap_or_default()
    }

    fn always_shown(&self) -> HashSet<ItemId> {
        self.state.read().always_shown.clone()
    }

    fn never_shown(&self) -> HashSet<ItemId> {
        self.state.read().never_shown.clone()
    }

    fn is_always_shown_exclusive(&self) -> bool {
        self.state.read().always_shown_exclusive
    }
}

impl DisplaySurface for ViewState {
    fn set_containers_shown(&self, ids: &[ContainerId], shown: bool) {
        let changed = {
            let mut state = self.state.write();
            ids.iter().fold(false, |changed, id| {
                let flipped = if shown {
                    state.shown_containers.insert(*id)
                } else {
                    state.shown_containers.remove(id)
                };
                changed | flipped
            })
        };
        self.notify(changed, SurfaceChange::Containers);
    }

    fn set_category_selector(&self, ids: &[CollectionId], on: bool) {
        let changed = {
            let mut state = self.state.write();
            ids.iter().fold(false, |changed, id| {
                let flipped = if on {
                    state.selector_on.insert(*id)
                } else {
                    state.selector_on.remove(id)
                };
                changed | flipped
            })
        };
        self.notify(changed, SurfaceChange::CategorySelector);
    }

    fn set_category_override(
        &self,
        container: ContainerId,
        collection: CollectionId,
        value: CategoryOverride,
    ) {
        let changed = {
            let mut state = self.state.write();
            let previous = match value {
                CategoryOverride::None => state.overrides.remove(&(container, collection)),
                value => state.overrides.insert((container, collection), value),
            };
            previous.unwrap_or_default() != value
        };
        self.notify(changed, SurfaceChange::CategoryOverrides);
    }

    fn clear_category_overrides(&self, scope: OverrideScope) {
        let changed = {
            let mut state = self.state.write();
            let before = state.overrides.len();
            state
                .overrides
                .retain(|(container, collection), _| !scope.covers(*container, *collection));
            state.overrides.len() != before
        };
        self.notify(changed, SurfaceChange::CategoryOverrides);
    }

    fn set_always_shown(&self, ids: HashSet<ItemId>) {
        let changed = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.always_shown, ids) != state.always_shown
        };
        self.notify(changed, SurfaceChange::AlwaysShown);
    }

    fn set_never_shown(&self, ids: HashSet<ItemId>) {
        let changed = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.never_shown, ids) != state.never_shown
        };
        self.notify(changed, SurfaceChange::NeverShown);
    }

    fn changed(&self) -> &Arc<Signal<SurfaceChange>> {
        &self.changed
    }
}

impl std::fmt::Debug for ViewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewState")
            .field("state", &*self.state.read())
            .finish()
    }
}

static_assertions::assert_impl_all!(ViewState: Send, Sync);
