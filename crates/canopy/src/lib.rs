//! Canopy - visibility aggregation and caching for hierarchical model trees.
//!
//! A tree view over a federated model shows containers (models), the
//! collections (categories) displayed in each container, and the items
//! (elements) in each pair. Canopy answers "is this node visible, hidden or
//! partially visible?" for any node of that tree, and turns nodes on or off
//! by writing the minimal set of changes to a display surface.
//!
//! The crate is built from a few parts:
//!
//! - **Structural cache**: [`StructuralCache`] fetches structural facts
//!   through a [`QueryExecutor`] and shares one in-flight fetch per fact
//! - **Display surface**: [`DisplaySurface`] is the mutable display state;
//!   [`ViewState`] is an in-memory implementation
//! - **Handler**: [`VisibilityHandler`] resolves statuses, applies
//!   mutations in order, and emits a change signal when statuses may have
//!   changed
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use canopy::{
//!     ContainerId, EngineConfig, HierarchyNode, MemoryDataset, ViewState, VisibilityHandler,
//!     VisibilityStatus,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> canopy::Result<()> {
//! let dataset = Arc::new(
//!     MemoryDataset::new()
//!         .with_item(1, 100, 10)
//!         .with_item(2, 100, 20),
//! );
//! let view = Arc::new(ViewState::new().with_containers_shown([ContainerId::new(100)]));
//! let handler = VisibilityHandler::new(dataset, view, EngineConfig::default())?;
//!
//! let walls = HierarchyNode::collection(10, [ContainerId::new(100)]);
//! handler.set_visibility(&walls, true).await?;
//!
//! let model = HierarchyNode::container(100);
//! assert_eq!(handler.resolve(&model).await?.status(), Some(VisibilityStatus::Partial));
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod coordinator;
mod dataset;
mod error;
mod ids;
mod mutator;
mod node;
mod query;
mod resolver;
mod status;
mod surface;
mod view_state;

pub use cache::{CollectionSummary, ItemLocation, StructuralCache, SubModel};
pub use config::EngineConfig;
pub use coordinator::{MutationOutcome, ResolveOutcome, VisibilityHandler};
pub use dataset::{MemoryDataset, QueryLogEntry};
pub use error::{QueryError, Result, VisibilityError};
pub use ids::{CollectionId, ContainerId, ItemId};
pub use node::{
    CollectionNode, ContainerNode, Dimension, HierarchyNode, ItemNode, NodeKey, NodeKind,
};
pub use query::{QueryExecutor, QueryRow, RestartToken, StructuralQuery};
pub use status::{StatusMerger, VisibilityStatus};
pub use surface::{
    CategoryOverride, DisplaySurface, OverrideScope, SurfaceChange, SurfaceRead, category_status,
};
pub use view_state::ViewState;

pub use canopy_core::{CancelReason, ConnectionGuard, ConnectionId, Signal};
