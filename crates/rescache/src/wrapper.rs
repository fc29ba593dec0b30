//! Named wrapper: the dedupe + revalidation coordinator for one registered
//! function (spec §4.5).

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::dedupe::{InFlight, StaleDedupe};
use crate::error::{Error, Result};
use crate::key::{hash_key, KeySerializer};
use crate::observer::CacheObserver;
use crate::storage::Backend;

/// The user-supplied async function whose results are cached.
pub type ProducerFn<P, R> =
    Arc<dyn Fn(P, String) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

/// Optional computation of the reference set to attach to a result.
pub type ReferenceBuilderFn<P, R> = Arc<
    dyn Fn(P, String, R) -> BoxFuture<'static, anyhow::Result<Option<Vec<String>>>> + Send + Sync,
>;

/// Optional value transformer, applied in place of the default
/// `serde_json` encoding when writing to and reading from storage.
///
/// Lets a caller store a wire format other than the derived `Serialize`
/// encoding (compression, a versioned envelope, a non-JSON codec) without
/// touching the dedupe/revalidation machinery.
pub struct Transformer<R> {
    pub serialize: Arc<dyn Fn(&R) -> Value + Send + Sync>,
    pub deserialize: Arc<dyn Fn(Value) -> anyhow::Result<R> + Send + Sync>,
}

/// A `ttl`/`stale` value: either fixed, or computed from the producer's
/// result once it's known.
#[derive(Clone)]
pub enum TimeSpec<R> {
    Fixed(i64),
    Dynamic(Arc<dyn Fn(&R) -> i64 + Send + Sync>),
}

impl<R> TimeSpec<R> {
    fn evaluate(&self, result: &R) -> i64 {
        match self {
            Self::Fixed(n) => *n,
            Self::Dynamic(f) => f(result),
        }
    }

    /// Whether storage should even be consulted on a call — a fixed `0`
    /// disables reads as well as writes.
    fn enables_read(&self) -> bool {
        !matches!(self, Self::Fixed(n) if *n <= 0)
    }
}

/// Construction options for a [`NamedWrapper`].
pub struct WrapperOptions<P, R> {
    pub ttl: TimeSpec<R>,
    pub stale: Option<TimeSpec<R>>,
    pub key_serializer: Option<KeySerializer<P>>,
    pub reference_builder: Option<ReferenceBuilderFn<P, R>>,
    /// `None` inherits the cache-wide default observer installed via
    /// [`crate::facade::CacheBuilder::observer`].
    pub observer: Option<Arc<dyn CacheObserver>>,
    /// `None` uses the default `serde_json` encoding.
    pub transformer: Option<Transformer<R>>,
}

impl<P, R> Default for WrapperOptions<P, R> {
    fn default() -> Self {
        Self {
            ttl: TimeSpec::Fixed(0),
            stale: None,
            key_serializer: None,
            reference_builder: None,
            observer: None,
            transformer: None,
        }
    }
}

/// Per registered function: coordinates dedupe, storage interaction, stale
/// revalidation, reference computation, and error handling.
pub struct NamedWrapper<P, R> {
    name: String,
    storage: Arc<dyn Backend>,
    producer: ProducerFn<P, R>,
    observer: Arc<dyn CacheObserver>,
    options: WrapperOptions<P, R>,
    inflight: InFlight<R>,
    stale_dedupe: StaleDedupe,
}

impl<P, R> NamedWrapper<P, R>
where
    P: Clone + Serialize + Send + Sync + 'static,
    R: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// `fallback_observer` is the cache-wide default, used when `options`
    /// doesn't install its own.
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn Backend>,
        producer: ProducerFn<P, R>,
        options: WrapperOptions<P, R>,
        fallback_observer: Arc<dyn CacheObserver>,
    ) -> Arc<Self> {
        let observer = options.observer.clone().unwrap_or(fallback_observer);
        Arc::new(Self {
            name: name.into(),
            storage,
            producer,
            observer,
            options,
            inflight: InFlight::new(),
            stale_dedupe: StaleDedupe::new(),
        })
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}~{key}", self.name)
    }

    /// Encode a result for storage, applying the configured transformer in
    /// place of the default `serde_json` encoding when present.
    fn serialize_result(&self, result: &R) -> Value {
        match &self.options.transformer {
            Some(transformer) => (transformer.serialize)(result),
            None => serde_json::to_value(result).unwrap_or(Value::Null),
        }
    }

    /// Decode a value read from storage, applying the configured
    /// transformer in place of the default `serde_json` decoding when
    /// present.
    fn deserialize_cached(&self, value: Value) -> anyhow::Result<R> {
        match &self.options.transformer {
            Some(transformer) => (transformer.deserialize)(value),
            None => serde_json::from_value(value).map_err(anyhow::Error::from),
        }
    }

    /// Prefix used to scope `clear` to this wrapper's keys.
    fn prefix(&self) -> String {
        format!("{}~", self.name)
    }

    /// Public entry point: `call(args)` (spec §4.5).
    pub async fn call(self: &Arc<Self>, args: P) -> Result<R> {
        let key = hash_key(&args, self.options.key_serializer.as_ref());
        let storage_key = self.storage_key(&key);

        let (cell, is_originator) = self.inflight.acquire(&key).await;
        if !is_originator {
            self.observer.on_dedupe(&key);
        }

        let wrapper = Arc::clone(self);
        let key_for_fetch = key.clone();
        let result = cell
            .get_or_init(|| async move {
                wrapper
                    .fetch_pipeline(args, key_for_fetch, storage_key)
                    .await
            })
            .await
            .clone();

        if is_originator {
            self.inflight.release(&key).await;
            // Only a producer rejection reaches here as `Err` — every other
            // error kind is absorbed inside the fetch pipeline already.
            if let Err(err @ Error::Producer(_)) = &result {
                let _ = self.storage.remove(&self.storage_key(&key)).await;
                self.observer.on_error(&key, err);
            }
        }

        result
    }

    async fn fetch_pipeline(self: Arc<Self>, args: P, key: String, storage_key: String) -> Result<R> {
        if self.options.ttl.enables_read() {
            if let Some(value) = self.storage.get(&storage_key).await {
                self.observer.on_hit(&key);
                match self.deserialize_cached(value) {
                    Ok(result) => {
                        self.maybe_revalidate(&args, &key, &storage_key, &result)
                            .await;
                        return Ok(result);
                    }
                    Err(err) => {
                        warn!(key, error = %err, "rescache: failed to deserialize cached value");
                    }
                }
            } else {
                self.observer.on_miss(&key);
            }
        }

        self.run_producer_and_store(args, key, storage_key).await
    }

    /// Run the producer, compute TTL/stale/references, and write through to
    /// storage. Shared by the miss path and background revalidation.
    async fn run_producer_and_store(
        &self,
        args: P,
        key: String,
        storage_key: String,
    ) -> Result<R> {
        let result = (self.producer)(args.clone(), key.clone())
            .await
            .map_err(Error::producer)?;

        let ttl = self.options.ttl.evaluate(&result);
        if ttl < 0 {
            self.observer.on_error(&key, &Error::TtlKind);
            return Ok(result);
        }

        let stale = self
            .options
            .stale
            .as_ref()
            .map(|s| s.evaluate(&result).max(0))
            .unwrap_or(0);

        let effective_ttl = ttl + stale;
        if effective_ttl < 1 {
            return Ok(result);
        }

        let references = match &self.options.reference_builder {
            None => None,
            Some(builder) => {
                match builder(args.clone(), key.clone(), result.clone()).await {
                    Ok(refs) => refs,
                    Err(err) => {
                        self.observer
                            .on_error(&key, &Error::reference_builder(err));
                        return Ok(result);
                    }
                }
            }
        };

        let serialized = self.serialize_result(&result);
        self.storage
            .set(&storage_key, serialized, effective_ttl, references)
            .await;

        Ok(result)
    }

    /// Launch a background revalidation if the cached value is within its
    /// stale window and none is already running for `key`.
    async fn maybe_revalidate(self: &Arc<Self>, args: &P, key: &str, storage_key: &str, result: &R) {
        let Some(stale_spec) = &self.options.stale else {
            return;
        };
        let stale = stale_spec.evaluate(result).max(0);
        if stale <= 0 {
            return;
        }

        let ttl_remaining = self.storage.get_ttl(storage_key).await;
        if ttl_remaining > stale as u64 {
            return;
        }

        if !self.stale_dedupe.try_begin(key).await {
            return;
        }

        let wrapper = Arc::clone(self);
        let args = args.clone();
        let key = key.to_string();
        let storage_key = storage_key.to_string();
        tokio::spawn(async move {
            if let Err(err) = wrapper
                .run_producer_and_store(args, key.clone(), storage_key)
                .await
            {
                wrapper.observer.on_error(&key, &err);
            }
            wrapper.stale_dedupe.clear(&key).await;
        });
    }

    /// Administrative `clear`: scoped to one argument set when `value` is
    /// given, otherwise the whole wrapper.
    pub async fn clear(&self, value: Option<&P>) {
        match value {
            Some(args) => {
                let key = hash_key(args, self.options.key_serializer.as_ref());
                let storage_key = self.storage_key(&key);
                let _ = self.storage.remove(&storage_key).await;
                self.inflight.release(&key).await;
                self.stale_dedupe.clear(&key).await;
            }
            None => {
                self.storage.clear(Some(&self.prefix())).await;
                self.inflight.clear_all().await;
                self.stale_dedupe.clear_all().await;
            }
        }
    }

    /// Administrative `get`: passthrough to storage for the given args,
    /// with the transformer applied on the way out.
    pub async fn get(&self, args: &P) -> Option<R> {
        let key = hash_key(args, self.options.key_serializer.as_ref());
        let storage_key = self.storage_key(&key);
        let value = self.storage.get(&storage_key).await?;
        self.deserialize_cached(value).ok()
    }

    /// Administrative `set`: passthrough to storage for the given args,
    /// with the transformer applied on the way in.
    pub async fn set(&self, args: &P, value: R, ttl_secs: i64, references: Option<Vec<String>>) {
        let key = hash_key(args, self.options.key_serializer.as_ref());
        let storage_key = self.storage_key(&key);
        let serialized = self.serialize_result(&value);
        self.storage
            .set(&storage_key, serialized, ttl_secs, references)
            .await;
    }

    /// Administrative `invalidate`: passthrough to storage.
    pub async fn invalidate(&self, references: &[String]) -> Vec<String> {
        self.storage.invalidate(references).await
    }
}
