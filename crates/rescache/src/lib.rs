//! Async function-result cache with request coalescing, tag-based
//! invalidation, and stale-while-revalidate semantics.
//!
//! A caller registers a named async function with [`facade::Cache`];
//! subsequent calls with equivalent arguments either return a previously
//! computed result or join an already-running computation, avoiding
//! duplicate work and backend load.

pub mod dedupe;
pub mod error;
pub mod facade;
pub mod key;
pub mod observer;
pub mod storage;
pub mod time;
pub mod wrapper;

pub use error::{Error, Result};
pub use facade::{Cache, CacheBuilder, DefineOptions, Handle};
pub use key::{canonical_stringify, hash_key, KeySerializer};
pub use observer::{CacheObserver, NoopObserver};
pub use storage::memory::{MemoryOptions, MemoryStorage};
pub use storage::redis::{connect as connect_redis, GcMode, GcOptions, GcReport, RedisOptions, RedisStorage};
pub use storage::{wildcard_match, Backend};
pub use time::{Clock, SystemClock, TestClock};
pub use wrapper::{ProducerFn, ReferenceBuilderFn, TimeSpec, Transformer, WrapperOptions};
