//! Hierarchy node references handed to the engine by the hierarchy provider.
//!
//! A node is a tagged union over the three entity kinds. Items that root a
//! nested container carry that container's id in [`ItemNode::sub_model`], so
//! the dual identity is data rather than a type relationship.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VisibilityError};
use crate::ids::{CollectionId, ContainerId, ItemId};

/// Dimensionality of a container, and the mode of the active view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Dimension {
    /// Planar (drawing/sheet) content.
    #[serde(rename = "2d")]
    TwoD,
    /// Spatial content.
    #[default]
    #[serde(rename = "3d")]
    ThreeD,
}

/// A container (model) node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNode {
    /// The container id.
    pub id: ContainerId,
    /// The container's dimensionality.
    pub dimension: Dimension,
    /// Depth of the node in the displayed hierarchy.
    #[serde(default)]
    pub depth: u32,
}

/// A collection (category) node.
///
/// `containers` lists every container the collection is displayed under. It
/// may be empty only for mutations, where it means "the collection
/// everywhere".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionNode {
    /// The collection id.
    pub id: CollectionId,
    /// Containers that give this node its context.
    pub containers: Vec<ContainerId>,
    /// Depth of the node in the displayed hierarchy.
    #[serde(default)]
    pub depth: u32,
}

/// An item (element) node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemNode {
    /// The item id.
    pub id: ItemId,
    /// The container the item belongs to.
    pub container: ContainerId,
    /// The collection the item belongs to.
    pub collection: CollectionId,
    /// The parent item, if the item is part of an item sub-tree.
    #[serde(default)]
    pub parent: Option<ItemId>,
    /// The nested container this item is the root of, when the provider
    /// already knows it. `None` means "look it up".
    #[serde(default)]
    pub sub_model: Option<ContainerId>,
    /// Depth of the node in the displayed hierarchy.
    #[serde(default)]
    pub depth: u32,
}

/// A node whose visibility can be resolved or changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HierarchyNode {
    /// A container node.
    Container(ContainerNode),
    /// A collection node.
    Collection(CollectionNode),
    /// An item node.
    Item(ItemNode),
}

impl HierarchyNode {
    /// A 3D container node at depth 0.
    pub fn container(id: impl Into<ContainerId>) -> Self {
        Self::Container(ContainerNode {
            id: id.into(),
            dimension: Dimension::ThreeD,
            depth: 0,
        })
    }

    /// A container node with an explicit dimensionality.
    pub fn container_with_dimension(id: impl Into<ContainerId>, dimension: Dimension) -> Self {
        Self::Container(ContainerNode {
            id: id.into(),
            dimension,
            depth: 0,
        })
    }

    /// A collection node under the given containers, at depth 1.
    pub fn collection(
        id: impl Into<CollectionId>,
        containers: impl IntoIterator<Item = ContainerId>,
    ) -> Self {
        Self::Collection(CollectionNode {
            id: id.into(),
            containers: containers.into_iter().collect(),
            depth: 1,
        })
    }

    /// An item node at depth 2.
    pub fn item(
        id: impl Into<ItemId>,
        container: impl Into<ContainerId>,
        collection: impl Into<CollectionId>,
    ) -> Self {
        Self::Item(ItemNode {
            id: id.into(),
            container: container.into(),
            collection: collection.into(),
            parent: None,
            sub_model: None,
            depth: 2,
        })
    }

    /// Set the node's depth.
    pub fn at_depth(mut self, depth: u32) -> Self {
        match &mut self {
            Self::Container(node) => node.depth = depth,
            Self::Collection(node) => node.depth = depth,
            Self::Item(node) => node.depth = depth,
        }
        self
    }

    /// Attach a known sub-model to an item node. No effect on other kinds.
    pub fn with_sub_model(mut self, sub_model: impl Into<ContainerId>) -> Self {
        if let Self::Item(node) = &mut self {
            node.sub_model = Some(sub_model.into());
        }
        self
    }

    /// Attach a parent item to an item node. No effect on other kinds.
    pub fn with_parent(mut self, parent: impl Into<ItemId>) -> Self {
        if let Self::Item(node) = &mut self {
            node.parent = Some(parent.into());
        }
        self
    }

    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Container(_) => NodeKind::Container,
            Self::Collection(_) => NodeKind::Collection,
            Self::Item(_) => NodeKind::Item,
        }
    }

    /// The node's depth in the displayed hierarchy.
    pub fn depth(&self) -> u32 {
        match self {
            Self::Container(node) => node.depth,
            Self::Collection(node) => node.depth,
            Self::Item(node) => node.depth,
        }
    }

    /// Identity of the node for supersession and in-flight tracking.
    pub fn key(&self) -> NodeKey {
        match self {
            Self::Container(node) => NodeKey {
                kind: NodeKind::Container,
                id: node.id.as_u64(),
                scope: Vec::new(),
                depth: node.depth,
            },
            Self::Collection(node) => {
                let mut scope: Vec<u64> = node.containers.iter().map(|c| c.as_u64()).collect();
                scope.sort_unstable();
                scope.dedup();
                NodeKey {
                    kind: NodeKind::Collection,
                    id: node.id.as_u64(),
                    scope,
                    depth: node.depth,
                }
            }
            Self::Item(node) => NodeKey {
                kind: NodeKind::Item,
                id: node.id.as_u64(),
                scope: vec![node.container.as_u64(), node.collection.as_u64()],
                depth: node.depth,
            },
        }
    }

    /// Check the node is well-formed for status resolution.
    pub(crate) fn validate_for_resolve(&self) -> Result<()> {
        match self {
            Self::Collection(node) if node.containers.is_empty() => {
                Err(VisibilityError::invalid_node(
                    self.key(),
                    "collection node has no container context",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// The three node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A container.
    Container,
    /// A collection.
    Collection,
    /// An item.
    Item,
}

/// Identity of a node: kind, id, structural scope and depth.
///
/// Two requests for the same key target the same displayed node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    kind: NodeKind,
    id: u64,
    scope: Vec<u64>,
    depth: u32,
}

impl NodeKey {
    /// The node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The node's depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            NodeKind::Container => "container",
            NodeKind::Collection => "collection",
            NodeKind::Item => "item",
        };
        write!(f, "{kind}:{:#x}", self.id)?;
        for scope in &self.scope {
            write!(f, "/{scope:#x}")?;
        }
        write!(f, "@{}", self.depth)
    }
}
