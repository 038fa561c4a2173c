//! Logging facilities for Canopy.
//!
//! Canopy uses the `tracing` crate for instrumentation. To see logs, install a
//! tracing subscriber in your application:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("canopy=debug,canopy_core=info")
//!     .init();
//! ```
//!
//! Every event is emitted with one of the [`targets`] so subsystems can be
//! filtered independently.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core plumbing target.
    pub const CORE: &str = "canopy_core";
    /// Signal/slot system target.
    pub const SIGNAL: &str = "canopy_core::signal";
    /// Serial queue target.
    pub const QUEUE: &str = "canopy_core::queue";
    /// Runtime management target.
    pub const RUNTIME: &str = "canopy_core::runtime";
    /// Structural cache target.
    pub const CACHE: &str = "canopy::cache";
    /// Status resolver target.
    pub const RESOLVER: &str = "canopy::resolver";
    /// Visibility mutator target.
    pub const MUTATOR: &str = "canopy::mutator";
    /// Change-event coordinator target.
    pub const COORDINATOR: &str = "canopy::coordinator";
}

/// Span names used for performance tracing.
pub mod span_names {
    /// Status resolution of one node.
    pub const RESOLVE: &str = "canopy::resolve";
    /// Planning of one mutation unit.
    pub const PLAN: &str = "canopy::plan";
    /// Commit of one mutation unit.
    pub const COMMIT: &str = "canopy::commit";
    /// One structural fetch.
    pub const FETCH: &str = "canopy::fetch";
}

/// A guard that keeps a tracing span entered until dropped.
///
/// Useful for tracking the duration of synchronous operations.
#[derive(Debug)]
pub struct PerfSpan {
    _span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Create and enter a new performance span.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::debug_span!(target: "canopy::perf", "perf", operation = name);
        Self {
            _span: span.entered(),
        }
    }
}

/// A span for an async operation, to be attached with
/// [`tracing::Instrument::instrument`].
pub fn async_span(name: &'static str) -> tracing::Span {
    tracing::debug_span!(target: "canopy::perf", "perf", operation = name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_span() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let _span = PerfSpan::new(span_names::COMMIT);
        let _async_span = async_span(span_names::FETCH);
    }

    #[test]
    fn test_targets_are_namespaced() {
        for target in [targets::SIGNAL, targets::QUEUE, targets::RUNTIME] {
            assert!(target.starts_with(targets::CORE));
        }
    }
}
