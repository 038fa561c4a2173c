//! The display surface interface.
//!
//! A display surface is the active view's selector and override state. The
//! engine reads it through [`SurfaceRead`] and writes it through
//! [`DisplaySurface`]; every write is announced on the surface's
//! [`changed`](DisplaySurface::changed) signal.

use std::collections::HashSet;
use std::sync::Arc;

use canopy_core::Signal;
use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, ContainerId, ItemId};
use crate::node::Dimension;
use crate::status::VisibilityStatus;

/// Per-(container, collection) override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryOverride {
    /// Force the pair's items shown.
    Show,
    /// Force the pair's items hidden.
    Hide,
    /// Defer to the collection's category selector.
    #[default]
    None,
}

/// Which overrides [`DisplaySurface::clear_category_overrides`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverrideScope {
    /// Every override under one container.
    Container(ContainerId),
    /// Every override of one collection, under any container.
    Collection(CollectionId),
}

impl OverrideScope {
    /// Whether the pair falls in this scope.
    pub fn covers(self, container: ContainerId, collection: CollectionId) -> bool {
        match self {
            Self::Container(id) => id == container,
            Self::Collection(id) => id == collection,
        }
    }
}

/// What part of the surface changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceChange {
    /// The active view mode.
    ViewMode,
    /// The set of shown containers.
    Containers,
    /// One or more category selector flags.
    CategorySelector,
    /// The per-pair override table.
    CategoryOverrides,
    /// The always-shown set or its exclusive flag.
    AlwaysShown,
    /// The never-shown set.
    NeverShown,
}

/// Read access to display state.
pub trait SurfaceRead: Send + Sync {
    /// Dimensionality of the active view.
    fn view_mode(&self) -> Dimension;
    /// Whether the container is displayed.
    fn is_container_shown(&self, id: ContainerId) -> bool;
    /// Whether the collection's global category selector is on.
    fn is_category_selector_on(&self, id: CollectionId) -> bool;
    /// The override for one pair.
    fn category_override(&self, container: ContainerId, collection: CollectionId)
    -> CategoryOverride;
    /// Items shown regardless of their collection state.
    fn always_shown(&self) -> HashSet<ItemId>;
    /// Items hidden regardless of anything else.
    fn never_shown(&self) -> HashSet<ItemId>;
    /// Whether only always-shown items are displayed.
    fn is_always_shown_exclusive(&self) -> bool;
}

/// Read/write access to display state plus change notification.
pub trait DisplaySurface: SurfaceRead {
    /// Show or hide containers.
    fn set_containers_shown(&self, ids: &[ContainerId], shown: bool);
    /// Turn category selector flags on or off.
    fn set_category_selector(&self, ids: &[CollectionId], on: bool);
    /// Set one pair's override. `CategoryOverride::None` removes it.
    fn set_category_override(
        &self,
        container: ContainerId,
        collection: CollectionId,
        value: CategoryOverride,
    );
    /// Remove every override in `scope`.
    fn clear_category_overrides(&self, scope: OverrideScope);
    /// Replace the always-shown set.
    fn set_always_shown(&self, ids: HashSet<ItemId>);
    /// Replace the never-shown set.
    fn set_never_shown(&self, ids: HashSet<ItemId>);
    /// Signal emitted after any of the above changed something.
    fn changed(&self) -> &Arc<Signal<SurfaceChange>>;
}

/// Status a pair's items have when no item override applies: the pair
/// override, falling back to the category selector. Ignores whether the
/// container is shown.
pub fn category_status<S: SurfaceRead + ?Sized>(
    surface: &S,
    container: ContainerId,
    collection: CollectionId,
) -> VisibilityStatus {
    match surface.category_override(container, collection) {
        CategoryOverride::Show => VisibilityStatus::Visible,
        CategoryOverride::Hide => VisibilityStatus::Hidden,
        CategoryOverride::None => {
            VisibilityStatus::from_bool(surface.is_category_selector_on(collection))
        }
    }
}
