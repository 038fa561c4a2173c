//! Visibility status values and the rules for merging them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Aggregated display status of a hierarchy node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityStatus {
    /// Everything under the node is displayed.
    Visible,
    /// Nothing under the node is displayed.
    Hidden,
    /// Some things under the node are displayed and some are not.
    Partial,
    /// The node cannot be displayed in the current view mode.
    Disabled,
}

impl VisibilityStatus {
    /// `Visible` for `true`, `Hidden` for `false`.
    pub fn from_bool(on: bool) -> Self {
        if on { Self::Visible } else { Self::Hidden }
    }

    /// Merge two statuses: equal values are kept, anything else is `Partial`.
    ///
    /// `Disabled` is neutral and yields the other value.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Disabled, x) | (x, Self::Disabled) => x,
            (a, b) if a == b => a,
            _ => Self::Partial,
        }
    }

    /// Map the status of a nested container seen through a hidden parent:
    /// hidden stays hidden, anything else becomes `Partial`.
    pub fn through_hidden_parent(self) -> Self {
        match self {
            Self::Hidden | Self::Disabled => Self::Hidden,
            _ => Self::Partial,
        }
    }
}

impl fmt::Display for VisibilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Visible => "visible",
            Self::Hidden => "hidden",
            Self::Partial => "partial",
            Self::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// Accumulates child statuses.
///
/// Disabled children are skipped. Once the result is `Partial` further
/// pushes cannot change it; see [`is_settled`](Self::is_settled).
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusMerger {
    current: Option<VisibilityStatus>,
}

impl StatusMerger {
    /// An empty merger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one status.
    pub fn push(&mut self, status: VisibilityStatus) {
        if status == VisibilityStatus::Disabled {
            return;
        }
        self.current = Some(match self.current {
            None => status,
            Some(current) => current.merge(status),
        });
    }

    /// Whether further pushes can no longer change the result.
    pub fn is_settled(&self) -> bool {
        self.current == Some(VisibilityStatus::Partial)
    }

    /// The merged status, or `None` if nothing (non-disabled) was pushed.
    pub fn get(&self) -> Option<VisibilityStatus> {
        self.current
    }

    /// The merged status, or `empty` if nothing (non-disabled) was pushed.
    pub fn finish_or(self, empty: VisibilityStatus) -> VisibilityStatus {
        self.current.unwrap_or(empty)
    }
}

impl Extend<VisibilityStatus> for StatusMerger {
    fn extend<I: IntoIterator<Item = VisibilityStatus>>(&mut self, iter: I) {
        for status in iter {
            self.push(status);
        }
    }
}

impl FromIterator<VisibilityStatus> for StatusMerger {
    fn from_iter<I: IntoIterator<Item = VisibilityStatus>>(iter: I) -> Self {
        let mut merger = Self::new();
        merger.extend(iter);
        merger
    }
}

/// Status of a set of items judged by override-set membership counts.
///
/// `total` is the number of items in the set, `always` and `never` the number
/// of those that are in the always-shown and never-shown sets. `default` is
/// the status of items not listed in either set.
pub(crate) fn status_from_counts(
    total: u64,
    always: u64,
    never: u64,
    default: VisibilityStatus,
) -> VisibilityStatus {
    if total == 0 {
        return default;
    }
    if never >= total {
        return VisibilityStatus::Hidden;
    }
    if always >= total {
        return VisibilityStatus::Visible;
    }
    match default {
        VisibilityStatus::Visible if never > 0 => VisibilityStatus::Partial,
        VisibilityStatus::Hidden if always > 0 => VisibilityStatus::Partial,
        other => other,
    }
}
