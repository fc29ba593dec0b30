//! Redis-backed storage: the same contract as [`super::memory`], over Redis
//! strings and sets, plus a garbage collector that reconciles reference sets
//! against data keys that have since expired or been evicted.

use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{dedup_sorted, diff_references, wildcard_match, Backend};
use crate::error::Error;

/// Tuning knobs for [`RedisStorage`].
#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// Whether reference bookkeeping (`k:<key>` / `r:<reference>` sets) runs
    /// at all. When `false`, `set` ignores `references` and `invalidate`
    /// always returns an empty vector.
    pub invalidation: bool,
    /// TTL, in seconds, applied to `r:<reference>` sets and refreshed on
    /// every write that touches them. Default 60.
    pub references_ttl: u64,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            invalidation: true,
            references_ttl: 60,
        }
    }
}

/// Mode for [`RedisStorage::gc`].
#[derive(Debug, Clone)]
pub enum GcMode {
    /// Walk every `r:*` set to completion in one call.
    Strict,
    /// Scan a single batch starting at a caller-supplied cursor, sampling a
    /// random subset so repeated calls cover the keyspace probabilistically.
    Lazy {
        chunk: i64,
        cursor: u64,
        sample_rate: f64,
    },
}

/// Options shared by both GC modes.
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// `SCAN ... COUNT chunk` batch size for strict mode.
    pub chunk: i64,
    /// Strict mode stops early if this many consecutive `SCAN` batches in a
    /// row come back empty, guarding against pathological cursor cycling on
    /// a misbehaving server even before the cursor returns to zero.
    pub empty_batch_limit: u32,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            chunk: 100,
            empty_batch_limit: 3,
        }
    }
}

/// Outcome of a GC run. Errors are captured here, never propagated as a
/// `Result::Err` — the GC never interrupts the cache's liveness.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub scanned_references: u64,
    pub removed_references: u64,
    pub scanned_keys: u64,
    pub removed_keys: u64,
    pub loops: u64,
    pub cursor: u64,
    pub error: Option<String>,
}

/// Redis-backed storage. Holds no local reference index: Redis's own command
/// ordering on a connection is the critical section; multi-step sequences
/// use a [`redis::pipe`] to keep them atomic from the caller's perspective.
pub struct RedisStorage {
    client: redis::Client,
    options: RedisOptions,
}

fn data_key_set(key: &str) -> String {
    format!("k:{key}")
}

fn reference_set(reference: &str) -> String {
    format!("r:{reference}")
}

/// `PTTL` milliseconds rounded up to whole seconds, per spec's `getTTL`.
#[allow(clippy::cast_sign_loss)]
fn millis_to_secs_ceil(millis: i64) -> u64 {
    ((millis + 999) / 1000) as u64
}

impl RedisStorage {
    /// Build storage over an already-configured Redis client.
    pub fn new(client: redis::Client, options: RedisOptions) -> Self {
        Self { client, options }
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(err) => {
                warn!(error = %err, "rescache: redis connection failed");
                None
            }
        }
    }

    /// Detach `key` from every reference it currently holds, then drop its
    /// `k:<key>` set. Used on eviction (TTL expiry observed at read, explicit
    /// remove) to keep `r:<reference>` sets from accumulating dangling
    /// members between GC runs.
    async fn clear_references(&self, conn: &mut redis::aio::MultiplexedConnection, key: &str) {
        if !self.options.invalidation {
            return;
        }
        let refs: Vec<String> = match conn.smembers(data_key_set(key)).await {
            Ok(refs) => refs,
            Err(err) => {
                warn!(error = %err, key, "rescache: failed reading reference set");
                return;
            }
        };
        if refs.is_empty() {
            let _: Result<(), _> = conn.del(data_key_set(key)).await;
            return;
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for r in &refs {
            pipe.srem(reference_set(r), key).ignore();
        }
        pipe.del(data_key_set(key)).ignore();
        if let Err(err) = pipe
            .query_async::<()>(conn)
            .await
        {
            warn!(error = %err, key, "rescache: failed clearing references");
        }
    }

    async fn matching_reference_sets(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        references: &[String],
    ) -> Vec<String> {
        let mut out = Vec::new();
        for reference in references {
            if reference.contains('*') {
                if reference == "**" {
                    continue;
                }
                let pattern = reference_set(reference);
                let keys: Vec<String> = match conn.keys(&pattern).await {
                    Ok(keys) => keys,
                    Err(err) => {
                        warn!(error = %err, pattern, "rescache: KEYS scan failed");
                        continue;
                    }
                };
                for k in keys {
                    let candidate = k.strip_prefix("r:").unwrap_or(&k);
                    if wildcard_match(reference, candidate) {
                        out.push(k);
                    }
                }
            } else {
                out.push(reference_set(reference));
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[async_trait::async_trait]
impl Backend for RedisStorage {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = match conn.get(key).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, key, "rescache: redis GET failed");
                return None;
            }
        };

        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(_) => Some(serde_json::Value::String(raw)),
            },
            None => {
                if self.options.invalidation {
                    let key = key.to_string();
                    let client = self.client.clone();
                    let invalidation = self.options.invalidation;
                    let references_ttl = self.options.references_ttl;
                    tokio::spawn(async move {
                        let storage = RedisStorage::new(
                            client,
                            RedisOptions {
                                invalidation,
                                references_ttl,
                            },
                        );
                        if let Some(mut conn) = storage.connection().await {
                            storage.clear_references(&mut conn, &key).await;
                        }
                    });
                }
                None
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_secs: i64,
        references: Option<Vec<String>>,
    ) {
        if ttl_secs < 1 {
            return;
        }
        let Some(mut conn) = self.connection().await else {
            return;
        };

        let serialized = match &value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let refs = references.unwrap_or_default();
        if !refs.is_empty() && !self.options.invalidation {
            warn!(key, "rescache: references given but invalidation is disabled");
        }

        #[allow(clippy::cast_sign_loss)]
        let ttl = ttl_secs as u64;

        if refs.is_empty() || !self.options.invalidation {
            if let Err(err) = conn
                .set_ex::<_, _, ()>(key, &serialized, ttl)
                .await
            {
                warn!(error = %err, key, "rescache: redis SET failed");
            }
            return;
        }

        let previous: Vec<String> = conn.smembers(data_key_set(key)).await.unwrap_or_default();
        let next = dedup_sorted(&refs);
        let (to_remove, to_add) = diff_references(&previous, &next);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set_ex(key, &serialized, ttl).ignore();
        for r in &to_remove {
            pipe.srem(reference_set(r), key).ignore();
        }
        for r in &to_add {
            pipe.sadd(reference_set(r), key).ignore();
            pipe.expire(reference_set(r), self.options.references_ttl as i64)
                .ignore();
        }
        pipe.del(data_key_set(key)).ignore();
        if !next.is_empty() {
            pipe.sadd(data_key_set(key), &next).ignore();
            pipe.expire(data_key_set(key), ttl_secs).ignore();
        }

        if let Err(err) = pipe.query_async::<()>(&mut conn).await {
            warn!(error = %err, key, "rescache: redis reference write failed");
        }
    }

    async fn remove(&self, key: &str) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        self.clear_references(&mut conn, key).await;
        match conn.del::<_, i64>(key).await {
            Ok(removed) => removed > 0,
            Err(err) => {
                warn!(error = %err, key, "rescache: redis DEL failed");
                false
            }
        }
    }

    async fn invalidate(&self, references: &[String]) -> Vec<String> {
        if references.is_empty() || !self.options.invalidation {
            return Vec::new();
        }
        let Some(mut conn) = self.connection().await else {
            return Vec::new();
        };

        let sets = self.matching_reference_sets(&mut conn, references).await;
        if sets.is_empty() {
            return Vec::new();
        }

        let mut keys: Vec<String> = Vec::new();
        for set in &sets {
            let members: Vec<String> = conn.smembers(set).await.unwrap_or_default();
            keys.extend(members);
        }
        keys.sort_unstable();
        keys.dedup();
        if keys.is_empty() {
            return Vec::new();
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for k in &keys {
            pipe.del(k).ignore();
        }
        for set in &sets {
            pipe.del(set).ignore();
        }
        if let Err(err) = pipe.query_async::<()>(&mut conn).await {
            warn!(error = %err, "rescache: redis invalidate failed");
            return Vec::new();
        }

        for k in &keys {
            self.clear_references(&mut conn, k).await;
        }

        debug!(count = keys.len(), "rescache: invalidated references");
        keys
    }

    async fn clear(&self, prefix: Option<&str>) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let Some(prefix) = prefix else {
            if let Err(err) = redis::cmd("FLUSHALL").query_async::<()>(&mut conn).await {
                warn!(error = %err, "rescache: redis FLUSHALL failed");
            }
            return;
        };

        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn.keys(&pattern).await.unwrap_or_default();
        if keys.is_empty() {
            return;
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for k in &keys {
            pipe.del(k).ignore();
        }
        if let Err(err) = pipe.query_async::<()>(&mut conn).await {
            warn!(error = %err, "rescache: redis prefix clear failed");
            return;
        }
        for k in &keys {
            self.clear_references(&mut conn, k).await;
        }
    }

    async fn get_ttl(&self, key: &str) -> u64 {
        let Some(mut conn) = self.connection().await else {
            return 0;
        };
        match conn.pttl::<_, i64>(key).await {
            Ok(millis) if millis > 0 => millis_to_secs_ceil(millis),
            _ => 0,
        }
    }

    async fn refresh(&self) {
        self.clear(None).await;
    }
}

impl RedisStorage {
    /// Reconcile `r:<reference>` sets against data keys that have expired or
    /// been evicted. Never returns an error: failures are captured in the
    /// report.
    pub async fn gc(&self, mode: GcMode, options: &GcOptions) -> GcReport {
        if options.chunk < 1 {
            return GcReport {
                error: Some("chunk must be a positive integer".to_string()),
                ..Default::default()
            };
        }

        let Some(mut conn) = self.connection().await else {
            return GcReport {
                error: Some("could not obtain a redis connection".to_string()),
                ..Default::default()
            };
        };

        match mode {
            GcMode::Strict => {
                self.gc_strict(&mut conn, options.chunk, options.empty_batch_limit)
                    .await
            }
            GcMode::Lazy {
                chunk,
                cursor,
                sample_rate,
            } => {
                if chunk < 1 {
                    return GcReport {
                        error: Some("lazy.chunk must be a positive integer".to_string()),
                        ..Default::default()
                    };
                }
                self.gc_lazy(&mut conn, chunk, cursor, sample_rate).await
            }
        }
    }

    async fn gc_strict(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        chunk: i64,
        empty_batch_limit: u32,
    ) -> GcReport {
        let mut report = GcReport::default();
        let mut cursor: u64 = 0;
        let mut consecutive_empty: u32 = 0;

        loop {
            let (next_cursor, sets): (u64, Vec<String>) = match redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg("r:*")
                .arg("COUNT")
                .arg(chunk)
                .query_async(conn)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    report.error = Some(err.to_string());
                    return report;
                }
            };

            report.loops += 1;
            if sets.is_empty() {
                consecutive_empty += 1;
            } else {
                consecutive_empty = 0;
            }
            self.reconcile_sets(conn, &sets, &mut report).await;

            cursor = next_cursor;
            report.cursor = cursor;
            if cursor == 0 || consecutive_empty >= empty_batch_limit.max(1) {
                break;
            }
        }

        report
    }

    async fn gc_lazy(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        chunk: i64,
        cursor: u64,
        sample_rate: f64,
    ) -> GcReport {
        let mut report = GcReport::default();

        let (next_cursor, sets): (u64, Vec<String>) = match redis::cmd("SCAN")
            .cursor_arg(cursor)
            .arg("MATCH")
            .arg("r:*")
            .arg("COUNT")
            .arg(chunk)
            .query_async(conn)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                report.error = Some(err.to_string());
                report.cursor = cursor;
                return report;
            }
        };

        report.loops = 1;
        report.cursor = next_cursor;

        let sample_rate = sample_rate.clamp(0.0, 1.0);
        let sampled: Vec<String> = sets
            .into_iter()
            .filter(|_| rand::random::<f64>() < sample_rate)
            .collect();

        self.reconcile_sets(conn, &sampled, &mut report).await;
        report
    }

    async fn reconcile_sets(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        sets: &[String],
        report: &mut GcReport,
    ) {
        for set in sets {
            report.scanned_references += 1;
            let members: Vec<String> = match conn.smembers(set).await {
                Ok(members) => members,
                Err(err) => {
                    report.error = Some(err.to_string());
                    continue;
                }
            };
            if members.is_empty() {
                let _: Result<(), _> = conn.del(set).await;
                continue;
            }

            report.scanned_keys += members.len() as u64;
            let mut dangling = Vec::new();
            for member in &members {
                let exists: bool = conn.exists(member).await.unwrap_or(true);
                if !exists {
                    dangling.push(member.clone());
                }
            }

            if !dangling.is_empty() {
                let mut pipe = redis::pipe();
                pipe.atomic();
                for key in &dangling {
                    pipe.srem(set, key).ignore();
                }
                if let Err(err) = pipe.query_async::<()>(conn).await {
                    report.error = Some(err.to_string());
                    continue;
                }
                report.removed_keys += dangling.len() as u64;
            }

            let remaining = members.len() - dangling.len();
            if remaining == 0 {
                let _: Result<(), _> = conn.del(set).await;
                report.removed_references += 1;
            }
        }
    }
}

/// Build a [`RedisStorage`] from a connection URL, matching the facade's
/// `Storage::redis` entry point. Connection errors surface as
/// [`Error::Configuration`]: an unreachable Redis at construction time is a
/// setup mistake, unlike a transient failure mid-operation which this
/// backend always swallows and logs.
pub fn connect(url: &str, options: RedisOptions) -> crate::error::Result<RedisStorage> {
    let client = redis::Client::open(url).map_err(|err| Error::Configuration(err.to_string()))?;
    Ok(RedisStorage::new(client, options))
}
