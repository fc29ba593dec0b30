//! Time source abstraction.
//!
//! Replaces a process-wide memoized "current second" global with an
//! explicit clock the cache holds by reference, so tests can drive TTL and
//! stale-window behavior deterministically without sleeping in real time.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic wall-clock seconds.
pub trait Clock: Send + Sync {
    /// Current time, in whole seconds since the Unix epoch.
    fn now_secs(&self) -> u64;
}

/// Production clock: a monotonic seconds counter cached per wall-clock
/// second, so hot paths (every `get`/`set`) don't pay for a `SystemTime`
/// syscall on every call.
#[derive(Debug)]
pub struct SystemClock {
    state: Mutex<CachedSecond>,
}

#[derive(Debug)]
struct CachedSecond {
    checked_at: Instant,
    seconds: u64,
}

impl SystemClock {
    /// Create a new system clock, seeded with the current wall-clock second.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CachedSecond {
                checked_at: Instant::now(),
                seconds: wall_clock_seconds(),
            }),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        let Ok(mut state) = self.state.lock() else {
            return wall_clock_seconds();
        };
        if state.checked_at.elapsed() >= Duration::from_secs(1) {
            state.seconds = wall_clock_seconds();
            state.checked_at = Instant::now();
        }
        state.seconds
    }
}

fn wall_clock_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A manually advanceable clock for deterministic tests.
#[derive(Debug, Default)]
pub struct TestClock {
    seconds: std::sync::atomic::AtomicU64,
}

impl TestClock {
    /// Create a test clock starting at second zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `secs` seconds.
    pub fn advance(&self, secs: u64) {
        self.seconds
            .fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_secs(&self) -> u64 {
        self.seconds.load(std::sync::atomic::Ordering::SeqCst)
    }
}
