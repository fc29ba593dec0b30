//! Observer hooks: the logger contract's typed Rust counterpart.
//!
//! Spec §6 specifies a consumed `debug/warn/error` logger; every unconditional
//! line still goes through `tracing`. Observer hooks are the additional,
//! optional, per-call notifications a caller can install
//! (`onDedupe`/`onHit`/`onMiss`/`onError`) — invoked synchronously on the
//! caller's task, so implementations must not block.

use crate::error::Error;

/// Per-call notifications from a named wrapper. All methods default to a
/// no-op; override only the ones you need.
pub trait CacheObserver: Send + Sync {
    /// A caller joined an already in-flight computation for `key`.
    fn on_dedupe(&self, _key: &str) {}

    /// A cached value was found and returned for `key`.
    fn on_hit(&self, _key: &str) {}

    /// No cached value was found for `key`; the producer is about to run.
    fn on_miss(&self, _key: &str) {}

    /// A non-producer error occurred and was absorbed (see the propagation
    /// rule in spec §7) rather than surfaced to the caller.
    fn on_error(&self, _key: &str, _error: &Error) {}
}

/// The default observer: every hook is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {}
