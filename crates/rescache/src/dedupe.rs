//! Dedupe tables: the `InFlight` and `StaleDedupe` coordination structures
//! used by [`crate::wrapper::NamedWrapper`].
//!
//! Per spec §5, a parallel runtime protects these with a single coarse mutex
//! per wrapper; the fast path (checking/installing a handle) never performs
//! I/O under the lock — only the awaited cell itself does that, outside any
//! lock.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::error::Error;

/// Per `(wrapperName, key)`, a pending result handle shared by every caller
/// that joins before the producer settles.
pub struct InFlight<R> {
    table: Mutex<HashMap<String, Arc<OnceCell<Result<R, Error>>>>>,
}

impl<R> Default for InFlight<R> {
    fn default() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }
}

impl<R> InFlight<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join an in-flight computation for `key`, or install a fresh one.
    ///
    /// Returns the shared cell and whether the caller is the one who must
    /// drive it (`is_originator == true`) versus merely await it.
    pub async fn acquire(&self, key: &str) -> (Arc<OnceCell<Result<R, Error>>>, bool) {
        let mut table = self.table.lock().await;
        if let Some(cell) = table.get(key) {
            (cell.clone(), false)
        } else {
            let cell = Arc::new(OnceCell::new());
            table.insert(key.to_string(), cell.clone());
            (cell, true)
        }
    }

    /// Remove the handle for `key` once its producer has settled.
    pub async fn release(&self, key: &str) {
        self.table.lock().await.remove(key);
    }

    /// Drop every in-flight handle for this wrapper (administrative `clear`).
    pub async fn clear_all(&self) {
        self.table.lock().await.clear();
    }
}

/// Per `(wrapperName, key)`, a marker that a background revalidation is
/// already running, suppressing duplicate refreshes while a stale value is
/// still being served.
#[derive(Default)]
pub struct StaleDedupe {
    running: Mutex<HashSet<String>>,
}

impl StaleDedupe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to claim `key` for a revalidation. Returns `true` if this
    /// caller won the claim (and must run the revalidation and later call
    /// [`Self::clear`]); `false` if one is already running.
    pub async fn try_begin(&self, key: &str) -> bool {
        self.running.lock().await.insert(key.to_string())
    }

    /// Release the claim once the revalidation settles.
    pub async fn clear(&self, key: &str) {
        self.running.lock().await.remove(key);
    }

    /// Whether a revalidation is currently running for `key`.
    pub async fn is_running(&self, key: &str) -> bool {
        self.running.lock().await.contains(key)
    }

    /// Drop every claim for this wrapper (administrative `clear`).
    pub async fn clear_all(&self) {
        self.running.lock().await.clear();
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inflight_second_caller_joins_first() {
        let table: InFlight<i32> = InFlight::new();
        let (cell_a, first) = table.acquire("k").await;
        assert!(first);
        let (cell_b, second) = table.acquire("k").await;
        assert!(!second);
        assert!(Arc::ptr_eq(&cell_a, &cell_b));

        let result = cell_a.get_or_init(|| async { Ok(42) }).await.clone();
        assert_eq!(result.unwrap(), 42);
        table.release("k").await;

        let (_, fresh) = table.acquire("k").await;
        assert!(fresh);
    }

    #[tokio::test]
    async fn stale_dedupe_suppresses_concurrent_claims() {
        let dedupe = StaleDedupe::new();
        assert!(dedupe.try_begin("k").await);
        assert!(!dedupe.try_begin("k").await);
        assert!(dedupe.is_running("k").await);
        dedupe.clear("k").await;
        assert!(!dedupe.is_running("k").await);
        assert!(dedupe.try_begin("k").await);
    }
}
