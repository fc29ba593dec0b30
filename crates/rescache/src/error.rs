//! Cache error types.

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced at the cache's public API.
///
/// Per the propagation rule, a caller of a wrapped function only ever sees
/// [`Error::Producer`] — every other variant is absorbed by the wrapper and
/// reported through [`crate::observer::CacheObserver`] and `tracing` instead,
/// so the cache stays live even when a backend or a user callback misbehaves.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid options at construction or `register` time: missing storage,
    /// a non-positive-integer `ttl`/`stale`, a forbidden wrapper name, or an
    /// unknown storage name passed to `invalidate_all`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation targeted a wrapper name that was never registered.
    #[error("{0} is not defined in the cache")]
    Lookup(String),

    /// The user-supplied producer rejected. The only variant a caller of a
    /// wrapped function observes.
    #[error("producer failed: {0}")]
    Producer(#[source] Arc<anyhow::Error>),

    /// The optional reference-builder rejected. The producer's result is
    /// still returned to the caller uncached.
    #[error("reference builder failed: {0}")]
    ReferenceBuilder(#[source] Arc<anyhow::Error>),

    /// A storage backend failed. Memory storage never produces this
    /// variant; Redis storage uses it only for the error slot of a GC
    /// report, since every other Redis failure is swallowed and logged.
    #[error("storage error: {0}")]
    Storage(String),

    /// A `ttl` function returned something other than a non-negative
    /// integer number of seconds.
    #[error("ttl must be an integer")]
    TtlKind,
}

impl Error {
    /// Wrap a producer failure. The reason is `Arc`-wrapped so `Error` stays
    /// `Clone` — every dedupe joiner needs its own copy of the outcome.
    pub fn producer(err: anyhow::Error) -> Self {
        Self::Producer(Arc::new(err))
    }

    /// Wrap a reference-builder failure.
    pub fn reference_builder(err: anyhow::Error) -> Self {
        Self::ReferenceBuilder(Arc::new(err))
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
