//! Cache facade: holds the named wrappers and the default storage, and
//! exposes the single entry point per registered function plus
//! administrative `clear`/`invalidate_all` (spec §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::observer::{CacheObserver, NoopObserver};
use crate::storage::Backend;
use crate::wrapper::{NamedWrapper, ProducerFn, WrapperOptions};

/// Construction options passed to [`Cache::register`]. A plain rename of
/// [`WrapperOptions`] at the public API boundary.
pub type DefineOptions<P, R> = WrapperOptions<P, R>;

const RESERVED_NAMES: &[&str] = &[
    "define",
    "register",
    "clear",
    "get",
    "set",
    "invalidate",
    "invalidate_all",
];

const DEFAULT_STORAGE_NAME: &str = "_default";

/// Type-erased view of a [`NamedWrapper`], so the facade can route
/// administrative `clear(name, value)` calls to a wrapper without knowing
/// its argument/result types.
#[async_trait]
trait ErasedWrapper: Send + Sync {
    async fn clear_erased(&self, value: Option<&Value>);
}

#[async_trait]
impl<P, R> ErasedWrapper for NamedWrapper<P, R>
where
    P: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn clear_erased(&self, value: Option<&Value>) {
        match value {
            Some(raw) => match serde_json::from_value::<P>(raw.clone()) {
                Ok(args) => NamedWrapper::clear(self, Some(&args)).await,
                Err(_) => NamedWrapper::clear(self, None).await,
            },
            None => NamedWrapper::clear(self, None).await,
        }
    }
}

/// A typed handle to one registered function, returned by
/// [`Cache::register`]. The Rust-idiomatic replacement for spec.md's dynamic
/// `cache.<name>(args)` shortcut (design note §9).
pub struct Handle<P, R> {
    wrapper: Arc<NamedWrapper<P, R>>,
}

impl<P, R> Clone for Handle<P, R> {
    fn clone(&self) -> Self {
        Self {
            wrapper: Arc::clone(&self.wrapper),
        }
    }
}

impl<P, R> Handle<P, R>
where
    P: Clone + Serialize + Send + Sync + 'static,
    R: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Call the registered function, joining an in-flight computation or
    /// running the producer, per the fetch pipeline in spec §4.5.
    pub async fn call(&self, args: P) -> Result<R> {
        self.wrapper.call(args).await
    }

    /// Scoped clear: drop the cached entry (and dedupe markers) for `args`.
    pub async fn clear(&self, args: &P) {
        self.wrapper.clear(Some(args)).await;
    }

    /// Clear every entry belonging to this wrapper.
    pub async fn clear_all(&self) {
        self.wrapper.clear(None).await;
    }

    /// Administrative passthrough read.
    pub async fn get(&self, args: &P) -> Option<R> {
        self.wrapper.get(args).await
    }

    /// Administrative passthrough write.
    pub async fn set(&self, args: &P, value: R, ttl_secs: i64, references: Option<Vec<String>>) {
        self.wrapper.set(args, value, ttl_secs, references).await;
    }

    /// Administrative passthrough invalidation.
    pub async fn invalidate(&self, references: &[String]) -> Vec<String> {
        self.wrapper.invalidate(references).await
    }
}

struct CacheInner {
    default_storage: Arc<dyn Backend>,
    storages: HashMap<String, Arc<dyn Backend>>,
    default_ttl: Option<i64>,
    default_stale: Option<i64>,
    observer: Arc<dyn CacheObserver>,
    wrappers: AsyncMutex<HashMap<String, Arc<dyn ErasedWrapper>>>,
}

/// Holds the named wrappers and the default storage; the single boundary
/// consumers go through (spec §4.6 / §6).
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    #[must_use]
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Register a named function. Rejects a name colliding with an existing
    /// wrapper or with a facade-reserved operation name.
    pub async fn register<P, R, F, Fut>(
        &self,
        name: impl Into<String>,
        mut options: DefineOptions<P, R>,
        producer: F,
    ) -> Result<Handle<P, R>>
    where
        P: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(P, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let name = name.into();
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(Error::Configuration(format!(
                "'{name}' is a reserved cache operation name"
            )));
        }

        let mut wrappers = self.inner.wrappers.lock().await;
        if wrappers.contains_key(&name) {
            return Err(Error::Configuration(format!(
                "a function named '{name}' is already registered"
            )));
        }

        if matches!(&options.ttl, crate::wrapper::TimeSpec::Fixed(n) if *n < 0) {
            return Err(Error::Configuration("ttl must be a non-negative integer".into()));
        }
        if options_stale_is_negative(&options) {
            return Err(Error::Configuration(
                "stale must be a non-negative integer".into(),
            ));
        }

        apply_cache_defaults(&mut options, self.inner.default_ttl, self.inner.default_stale);

        let storage = self.inner.default_storage.clone();
        let producer: ProducerFn<P, R> =
            Arc::new(move |args, key| Box::pin(producer(args, key)) as futures::future::BoxFuture<'static, anyhow::Result<R>>);
        let wrapper = NamedWrapper::new(
            name.clone(),
            storage,
            producer,
            options,
            self.inner.observer.clone(),
        );
        wrappers.insert(name, wrapper.clone() as Arc<dyn ErasedWrapper>);

        Ok(Handle { wrapper })
    }

    /// `clear([name[, value]])`: wrapper-scoped when `name` is given, full
    /// cache otherwise.
    pub async fn clear(&self, name: Option<&str>, value: Option<&Value>) -> Result<()> {
        match name {
            Some(name) => {
                let wrappers = self.inner.wrappers.lock().await;
                let wrapper = wrappers
                    .get(name)
                    .ok_or_else(|| Error::Lookup(format!("{name} is not defined in the cache")))?;
                wrapper.clear_erased(value).await;
                Ok(())
            }
            None => {
                self.inner.default_storage.clear(None).await;
                for storage in self.inner.storages.values() {
                    storage.clear(None).await;
                }
                Ok(())
            }
        }
    }

    /// `invalidateAll(refs, storageName = '_default')`.
    pub async fn invalidate_all(&self, references: &[String], storage_name: Option<&str>) -> Result<Vec<String>> {
        let name = storage_name.unwrap_or(DEFAULT_STORAGE_NAME);
        let storage = self.storage(name).ok_or_else(|| {
            Error::Lookup(format!("{name} is not a known storage"))
        })?;
        Ok(storage.invalidate(references).await)
    }

    /// Look up a named storage (including `"_default"`) for direct
    /// administrative use.
    #[must_use]
    pub fn storage(&self, name: &str) -> Option<Arc<dyn Backend>> {
        if name == DEFAULT_STORAGE_NAME {
            return Some(self.inner.default_storage.clone());
        }
        self.inner.storages.get(name).cloned()
    }
}

fn options_stale_is_negative<P, R>(options: &DefineOptions<P, R>) -> bool {
    matches!(&options.stale, Some(crate::wrapper::TimeSpec::Fixed(n)) if *n < 0)
}

fn apply_cache_defaults<P, R>(
    options: &mut DefineOptions<P, R>,
    default_ttl: Option<i64>,
    default_stale: Option<i64>,
) {
    if matches!(&options.ttl, crate::wrapper::TimeSpec::Fixed(0)) {
        if let Some(ttl) = default_ttl {
            options.ttl = crate::wrapper::TimeSpec::Fixed(ttl);
        }
    }
    if options.stale.is_none() {
        if let Some(stale) = default_stale {
            options.stale = Some(crate::wrapper::TimeSpec::Fixed(stale));
        }
    }
}

/// Builder for [`Cache`] (spec §4.6's constructor validation).
pub struct CacheBuilder {
    default_storage: Option<Arc<dyn Backend>>,
    storages: HashMap<String, Arc<dyn Backend>>,
    default_ttl: Option<i64>,
    default_stale: Option<i64>,
    observer: Arc<dyn CacheObserver>,
}

impl CacheBuilder {
    fn new() -> Self {
        Self {
            default_storage: None,
            storages: HashMap::new(),
            default_ttl: None,
            default_stale: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Set the default storage backend every registered function uses
    /// unless it supplies its own.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Backend>) -> Self {
        self.default_storage = Some(storage);
        self
    }

    /// Register an additional named storage reachable via
    /// [`Cache::invalidate_all`] / [`Cache::storage`].
    #[must_use]
    pub fn named_storage(mut self, name: impl Into<String>, storage: Arc<dyn Backend>) -> Self {
        self.storages.insert(name.into(), storage);
        self
    }

    /// Cache-wide default ttl (seconds), used when a registered function
    /// doesn't set its own.
    #[must_use]
    pub fn ttl(mut self, seconds: i64) -> Self {
        self.default_ttl = Some(seconds);
        self
    }

    /// Cache-wide default stale window (seconds).
    #[must_use]
    pub fn stale(mut self, seconds: i64) -> Self {
        self.default_stale = Some(seconds);
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Validate and build the cache.
    pub fn build(self) -> Result<Cache> {
        let default_storage = self
            .default_storage
            .ok_or_else(|| Error::Configuration("storage is required".into()))?;

        if let Some(ttl) = self.default_ttl {
            if ttl < 0 {
                return Err(Error::Configuration("ttl must be a non-negative integer".into()));
            }
        }
        if let Some(stale) = self.default_stale {
            if stale < 0 {
                return Err(Error::Configuration(
                    "stale must be a non-negative integer".into(),
                ));
            }
        }

        Ok(Cache {
            inner: Arc::new(CacheInner {
                default_storage,
                storages: self.storages,
                default_ttl: self.default_ttl,
                default_stale: self.default_stale,
                observer: self.observer,
                wrappers: AsyncMutex::new(HashMap::new()),
            }),
        })
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryOptions, MemoryStorage};
    use crate::time::SystemClock;
    use crate::wrapper::TimeSpec;

    fn memory_storage() -> Arc<dyn Backend> {
        Arc::new(MemoryStorage::new(
            MemoryOptions::default(),
            Arc::new(SystemClock::new()),
        ))
    }

    #[tokio::test]
    async fn register_rejects_reserved_name() {
        let cache = Cache::builder().storage(memory_storage()).build().unwrap();
        let result = cache
            .register(
                "clear",
                DefineOptions::<i32, i32> {
                    ttl: TimeSpec::Fixed(5),
                    ..Default::default()
                },
                |n, _key| Box::pin(async move { Ok::<i32, anyhow::Error>(n) }),
            )
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_name() {
        let cache = Cache::builder().storage(memory_storage()).build().unwrap();
        let opts = || DefineOptions::<i32, i32> {
            ttl: TimeSpec::Fixed(5),
            ..Default::default()
        };
        cache
            .register("double", opts(), |n, _| Box::pin(async move { Ok::<i32, anyhow::Error>(n) }))
            .await
            .unwrap();
        let result = cache
            .register("double", opts(), |n, _| Box::pin(async move { Ok::<i32, anyhow::Error>(n) }))
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn call_roundtrips_through_handle() {
        let cache = Cache::builder().storage(memory_storage()).build().unwrap();
        let handle = cache
            .register(
                "double",
                DefineOptions::<i32, i32> {
                    ttl: TimeSpec::Fixed(5),
                    ..Default::default()
                },
                |n, _key| Box::pin(async move { Ok::<i32, anyhow::Error>(n * 2) }),
            )
            .await
            .unwrap();

        assert_eq!(handle.call(21).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn builder_requires_storage() {
        let result = Cache::builder().build();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn transformer_is_used_instead_of_default_json_encoding() {
        use crate::key::hash_key;
        use crate::wrapper::Transformer;

        let storage = memory_storage();
        let cache = Cache::builder()
            .storage(storage.clone())
            .build()
            .unwrap();
        let handle = cache
            .register(
                "uppercased",
                DefineOptions::<String, String> {
                    ttl: TimeSpec::Fixed(30),
                    transformer: Some(Transformer {
                        serialize: Arc::new(|r: &String| {
                            serde_json::Value::String(r.to_uppercase())
                        }),
                        deserialize: Arc::new(|v| {
                            Ok(v.as_str().unwrap_or_default().to_lowercase())
                        }),
                    }),
                    ..Default::default()
                },
                |args, _key| async move { Ok::<String, anyhow::Error>(args) },
            )
            .await
            .unwrap();

        assert_eq!(handle.call("hello".to_string()).await.unwrap(), "hello");

        // Raw storage holds the transformer's wire form, not the plain value.
        let key = hash_key(&"hello".to_string(), None);
        let raw = storage.get(&format!("uppercased~{key}")).await.unwrap();
        assert_eq!(raw, serde_json::Value::String("HELLO".to_string()));

        // The admin get passthrough decodes through the same transformer.
        assert_eq!(
            handle.get(&"hello".to_string()).await,
            Some("hello".to_string())
        );
    }
}
