//! The query executor interface.
//!
//! The engine never builds query text. It asks for one of a handful of
//! structural relationships and expects rows of a matching shape back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::ids::{CollectionId, ContainerId, ItemId};
use crate::node::Dimension;

/// A structural relationship to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum StructuralQuery {
    /// Every (container, collection) pair, with whether the pair has items.
    /// Answered with [`QueryRow::ContainerCollection`].
    ContainerCollections,
    /// Number of items in each listed pair.
    /// Answered with [`QueryRow::ItemCount`].
    ItemCounts {
        /// The (container, collection) pairs to count.
        pairs: Vec<(ContainerId, CollectionId)>,
    },
    /// Every item that roots a nested container.
    /// Answered with [`QueryRow::SubModel`].
    SubModels,
    /// Direct children of the listed items.
    /// Answered with [`QueryRow::ChildItem`].
    ChildItems {
        /// Parent items.
        parents: Vec<ItemId>,
    },
    /// Container and collection of the listed items.
    /// Answered with [`QueryRow::ItemLocation`].
    ItemLocations {
        /// Items to locate.
        items: Vec<ItemId>,
    },
}

impl StructuralQuery {
    /// Short name of the relationship, used in restart tokens and logs.
    pub fn relationship(&self) -> &'static str {
        match self {
            Self::ContainerCollections => "container-collections",
            Self::ItemCounts { .. } => "item-counts",
            Self::SubModels => "sub-models",
            Self::ChildItems { .. } => "child-items",
            Self::ItemLocations { .. } => "item-locations",
        }
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "row", rename_all = "snake_case")]
pub enum QueryRow {
    /// A collection displayed under a container.
    ContainerCollection {
        /// The container.
        container: ContainerId,
        /// The collection.
        collection: CollectionId,
        /// Whether the pair has at least one item.
        has_items: bool,
    },
    /// Item count of one pair.
    ItemCount {
        /// The container.
        container: ContainerId,
        /// The collection.
        collection: CollectionId,
        /// Number of items in the pair.
        count: u64,
    },
    /// An item that roots a nested container.
    SubModel {
        /// The root item.
        item: ItemId,
        /// Container of the root item.
        container: ContainerId,
        /// Collection of the root item.
        collection: CollectionId,
        /// The nested container.
        sub_model: ContainerId,
        /// Dimensionality of the nested container.
        dimension: Dimension,
    },
    /// A parent/child item relation.
    ChildItem {
        /// The parent item.
        parent: ItemId,
        /// The child item.
        child: ItemId,
    },
    /// Where an item lives.
    ItemLocation {
        /// The item.
        item: ItemId,
        /// Its container.
        container: ContainerId,
        /// Its collection.
        collection: CollectionId,
    },
}

impl QueryRow {
    /// Short name of the row shape.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContainerCollection { .. } => "container_collection",
            Self::ItemCount { .. } => "item_count",
            Self::SubModel { .. } => "sub_model",
            Self::ChildItem { .. } => "child_item",
            Self::ItemLocation { .. } => "item_location",
        }
    }
}

/// A stable identifier for one logical query.
///
/// Issuing the same logical query twice yields the same token, which lets an
/// executor deduplicate or restart it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestartToken(String);

impl RestartToken {
    /// The token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RestartToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runs structural queries.
///
/// Implementations may batch, limit or restart queries internally. A restart
/// that the executor does not recover from is reported as
/// [`QueryError::Aborted`].
pub trait QueryExecutor: Send + Sync + 'static {
    /// Run `query`, streaming its rows.
    fn run_query(
        &self,
        query: StructuralQuery,
        restart: RestartToken,
    ) -> BoxStream<'static, Result<QueryRow, QueryError>>;
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Builds restart tokens of the form `<prefix>/<instance>/<relationship>[/<key>]`.
#[derive(Debug, Clone)]
pub(crate) struct RestartTokens {
    prefix: String,
    instance: u64,
}

impl RestartTokens {
    /// A token factory for a new engine instance.
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn token(&self, relationship: &str) -> RestartToken {
        RestartToken(format!("{}/{}/{}", self.prefix, self.instance, relationship))
    }

    pub(crate) fn keyed_token(&self, relationship: &str, key: impl fmt::Display) -> RestartToken {
        RestartToken(format!(
            "{}/{}/{}/{}",
            self.prefix, self.instance, relationship, key
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        let tokens = RestartTokens::new("tree");
        let plain = tokens.token("sub-models");
        let keyed = tokens.keyed_token("item-counts", 3);
        let prefix = format!("tree/{}/", tokens.instance);
        assert_eq!(plain.as_str(), format!("{prefix}sub-models"));
        assert_eq!(keyed.to_string(), format!("{prefix}item-counts/3"));
    }

    #[test]
    fn test_instances_are_distinct() {
        let a = RestartTokens::new("tree");
        let b = RestartTokens::new("tree");
        assert_ne!(a.token("sub-models"), b.token("sub-models"));
        assert_eq!(a.token("sub-models"), a.token("sub-models"));
    }

    #[test]
    fn test_query_json_shape() {
        let json = serde_json::to_value(StructuralQuery::ChildItems {
            parents: vec![ItemId::new(4)],
        })
        .unwrap();
        assert_eq!(json["query"], "child_items");
        assert_eq!(json["parents"][0], 4);
    }
}
