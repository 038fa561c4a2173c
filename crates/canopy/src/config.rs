//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for one [`VisibilityHandler`](crate::VisibilityHandler).
///
/// Can be deserialized from any serde format; missing fields take their
/// default values.
///
/// ```
/// use canopy::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_isolate_on_activation(false)
///     .with_item_count_batch_limit(64);
/// assert!(!config.isolate_on_activation);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// When a collection or item is turned on under a hidden container, show
    /// the container with every collection set to `Hide` before applying the
    /// request, so that only the requested node becomes visible.
    pub isolate_on_activation: bool,
    /// Prefix of the restart tokens handed to the query executor.
    pub restart_token_prefix: String,
    /// Withdraw a waiting mutation when a newer one for the same node arrives.
    pub supersede_queued_mutations: bool,
    /// Maximum number of (container, collection) pairs per item-count fetch.
    pub item_count_batch_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            isolate_on_activation: true,
            restart_token_prefix: "canopy".to_string(),
            supersede_queued_mutations: true,
            item_count_batch_limit: 500,
        }
    }
}

impl EngineConfig {
    /// Set [`isolate_on_activation`](Self::isolate_on_activation).
    pub fn with_isolate_on_activation(mut self, isolate: bool) -> Self {
        self.isolate_on_activation = isolate;
        self
    }

    /// Set [`restart_token_prefix`](Self::restart_token_prefix).
    pub fn with_restart_token_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.restart_token_prefix = prefix.into();
        self
    }

    /// Set [`supersede_queued_mutations`](Self::supersede_queued_mutations).
    pub fn with_supersede_queued_mutations(mut self, supersede: bool) -> Self {
        self.supersede_queued_mutations = supersede;
        self
    }

    /// Set [`item_count_batch_limit`](Self::item_count_batch_limit). Zero is
    /// treated as one.
    pub fn with_item_count_batch_limit(mut self, limit: usize) -> Self {
        self.item_count_batch_limit = limit;
        self
    }

    pub(crate) fn batch_limit(&self) -> usize {
        self.item_count_batch_limit.max(1)
    }
}
