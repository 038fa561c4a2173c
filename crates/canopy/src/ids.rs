//! Opaque identifiers for containers, collections and items.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw id.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw u64 value of this id.
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

entity_id! {
    /// Identifies a container (a model).
    ContainerId
}

entity_id! {
    /// Identifies a collection (a category). The same collection may appear
    /// under several containers.
    CollectionId
}

entity_id! {
    /// Identifies an item (an element).
    ItemId
}
