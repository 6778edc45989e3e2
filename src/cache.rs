use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use redis::AsyncCommands;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::coalesce::{CoalesceError, Coalescer, Role};
use crate::error::StoreError;
use crate::metrics::Metrics;
use crate::model::{AnalysisRequest, CacheEntry, CoordinatedResult};

const KEY_PREFIX: &str = "strategist:briefing:";

/// Trait for cache backing stores
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;
    async fn set(&self, entry: CacheEntry) -> Result<(), StoreError>;
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, StoreError>;
    async fn memory_usage(&self) -> Result<u64, StoreError>;
}

/// Redis-based cache store
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::new(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self { client })
    }

    /// Test the Redis connection
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| StoreError::new(format!("Redis PING failed: {}", e)))?;

        Ok(())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::new(format!("Redis connection failed: {}", e)))
    }

    fn build_redis_key(&self, key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut conn = self.connection().await?;

        let data: Option<String> = conn
            .get(self.build_redis_key(key))
            .await
            .map_err(|e| StoreError::new(format!("Redis GET failed: {}", e)))?;

        match data {
            Some(json) => {
                let entry: CacheEntry = serde_json::from_str(&json)
                    .map_err(|e| StoreError::new(format!("Failed to deserialize entry: {}", e)))?;

                // Redis expiry is authoritative, this only guards clock skew.
                if entry.is_expired(Utc::now()) {
                    return Ok(None);
                }

                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let ttl = entry.ttl_remaining_seconds(Utc::now());
        if ttl == 0 {
            return Ok(());
        }

        let mut conn = self.connection().await?;
        let json = serde_json::to_string(&entry)
            .map_err(|e| StoreError::new(format!("Failed to serialize entry: {}", e)))?;

        conn.set_ex::<_, _, ()>(self.build_redis_key(&entry.key), json, ttl)
            .await
            .map_err(|e| StoreError::new(format!("Redis SETEX failed: {}", e)))?;

        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection().await?;

        let search_pattern = self.build_redis_key(pattern);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (new_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&search_pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::new(format!("Redis SCAN failed: {}", e)))?;

            keys.extend(batch);

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }

        if keys.is_empty() {
            return Ok(0);
        }

        let deleted: usize = conn
            .del(&keys)
            .await
            .map_err(|e| StoreError::new(format!("Redis DEL failed: {}", e)))?;

        Ok(deleted)
    }

    async fn memory_usage(&self) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;

        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::new(format!("Redis INFO failed: {}", e)))?;

        Ok(info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0))
    }
}

/// How a briefing was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Fallback,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Fallback => "FALLBACK",
        }
    }
}

/// A resolved briefing together with its serialized form.
#[derive(Debug, Clone)]
pub struct Briefing {
    pub result: Arc<CoordinatedResult>,
    pub payload: Arc<str>,
    pub etag: String,
    pub status: CacheStatus,
}

/// What a computation hands back to the cache. `ttl: None` means do not store.
pub struct Computed {
    pub result: CoordinatedResult,
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional {
    NotModified,
    Fresh { payload: String, etag: String },
    Miss,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memory_bytes: u64,
    pub degraded: u64,
}

/// Briefing cache: TTL + ETag storage with per-key request coalescing.
///
/// Store failures never propagate. Every failed store call logs one
/// `cache_degraded` event and behaves as a miss (reads) or as a silent
/// success (writes).
///
/// Each invalidation bumps a generation. A computation started under an
/// older generation still answers its waiters but is not stored, and new
/// callers no longer join it.
#[derive(Clone)]
pub struct BriefingCache {
    store: Arc<dyn CacheStore>,
    flights: Arc<Coalescer<Briefing>>,
    generation: Arc<AtomicU64>,
    metrics: Metrics,
}

impl BriefingCache {
    pub fn new(store: Arc<dyn CacheStore>, metrics: Metrics) -> Self {
        Self {
            store,
            flights: Arc::new(Coalescer::new()),
            generation: Arc::new(AtomicU64::new(0)),
            metrics,
        }
    }

    /// Deterministic key from ward, depth, context and a digest of the filters.
    pub fn key_for(request: &AnalysisRequest) -> String {
        format!(
            "ward:{}:{}:{}:{}",
            request.ward(),
            request.depth(),
            request.context(),
            filter_digest(request.filters())
        )
    }

    /// Glob matching every briefing cached for `ward`.
    pub fn ward_pattern(ward: &str) -> String {
        format!("ward:{}:*", escape_glob(ward))
    }

    pub async fn get(&self, key: &str) -> Option<(String, String)> {
        match self.lookup(key).await {
            Some(entry) => {
                self.metrics.record_cache_hit();
                Some((entry.payload, entry.etag))
            }
            None => {
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    pub async fn get_if_none_match(&self, key: &str, etag: &str) -> Conditional {
        match self.get(key).await {
            Some((_, current)) if current == etag => Conditional::NotModified,
            Some((payload, etag)) => Conditional::Fresh { payload, etag },
            None => Conditional::Miss,
        }
    }

    /// Store `payload` under `key` and return its ETag.
    pub async fn set(&self, key: &str, payload: String, ttl: Duration) -> String {
        let etag = content_hash(&payload);
        if ttl.is_zero() {
            return etag;
        }

        let now = Utc::now();
        let expires_at = now
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(365));
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            etag: etag.clone(),
            stored_at: now,
            expires_at,
        };

        match self.store.set(entry).await {
            Ok(()) => {
                self.metrics.record_cache_store();
                tracing::debug!(key, ttl_secs = ttl.as_secs(), "stored briefing");
            }
            Err(error) => self.degraded("set", key, &error),
        }

        etag
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        match self.store.delete_pattern(pattern).await {
            Ok(purged) => {
                self.metrics.record_invalidation(purged);
                tracing::info!(pattern, purged, "invalidated cached briefings");
                purged
            }
            Err(error) => {
                self.degraded("invalidate", pattern, &error);
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let memory_bytes = match self.store.memory_usage().await {
            Ok(bytes) => bytes,
            Err(error) => {
                self.degraded("memory_usage", "*", &error);
                0
            }
        };
        self.metrics.update_cache_memory(memory_bytes);

        CacheStats {
            hits: self.metrics.cache_hits.get(),
            misses: self.metrics.cache_misses.get(),
            memory_bytes,
            degraded: self.metrics.cache_degraded.get(),
        }
    }

    /// Serve `key` from the cache or run `compute` exactly once across all
    /// concurrent callers for that key.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<Briefing, CoalesceError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Computed> + Send + 'static,
    {
        if let Some(entry) = self.lookup(key).await {
            if let Some(briefing) = decode_entry(entry) {
                self.metrics.record_cache_hit();
                return Ok(briefing);
            }
        }
        self.metrics.record_cache_miss();

        let generation = self.generation.load(Ordering::SeqCst);
        let flight_key = format!("{generation}:{key}");
        let cache = self.clone();
        let owned_key = key.to_string();
        let (role, result) = self
            .flights
            .run(&flight_key, move || async move {
                // A previous flight may have stored the key after our miss.
                if let Some(briefing) = cache.lookup(&owned_key).await.and_then(decode_entry) {
                    return briefing;
                }
                let computed = compute().await;
                cache.store_computed(&owned_key, computed, generation).await
            })
            .await;

        if role == Role::Follower {
            self.metrics.record_coalesced();
            tracing::debug!(key, "joined in-flight computation");
        }

        result
    }

    async fn store_computed(&self, key: &str, computed: Computed, generation: u64) -> Briefing {
        let Computed { result, ttl } = computed;
        let payload = serde_json::to_string(&result).unwrap_or_else(|error| {
            tracing::error!(key, %error, "failed to serialize briefing");
            String::from("{}")
        });

        let (etag, status) = match ttl {
            Some(_) if self.generation.load(Ordering::SeqCst) != generation => {
                tracing::debug!(key, "invalidated while computing; not storing");
                (content_hash(&payload), CacheStatus::Miss)
            }
            Some(ttl) => (self.set(key, payload.clone(), ttl).await, CacheStatus::Miss),
            None => (content_hash(&payload), CacheStatus::Fallback),
        };

        Briefing {
            result: Arc::new(result),
            payload: Arc::from(payload),
            etag,
            status,
        }
    }

    async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(key).await {
            Ok(entry) => entry,
            Err(error) => {
                self.degraded("get", key, &error);
                None
            }
        }
    }

    fn degraded(&self, op: &str, key: &str, error: &StoreError) {
        self.metrics.record_cache_degraded();
        tracing::warn!(event = "cache_degraded", op, key, %error, "cache store unavailable; passing through");
    }
}

fn decode_entry(entry: CacheEntry) -> Option<Briefing> {
    match serde_json::from_str::<CoordinatedResult>(&entry.payload) {
        Ok(result) => Some(Briefing {
            result: Arc::new(result),
            payload: Arc::from(entry.payload),
            etag: entry.etag,
            status: CacheStatus::Hit,
        }),
        Err(error) => {
            tracing::warn!(key = %entry.key, %error, "discarding undecodable cache entry");
            None
        }
    }
}

/// Hex SHA-256 of the payload, used as ETag.
pub fn content_hash(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

fn filter_digest(filters: &[String]) -> String {
    if filters.is_empty() {
        return "nofilter".to_string();
    }

    let mut normalized: Vec<String> = filters
        .iter()
        .map(|f| f.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .collect();
    normalized.sort();
    normalized.dedup();

    let digest = Sha256::digest(normalized.join("\n").as_bytes());
    hex::encode(&digest[..8])
}

fn escape_glob(raw: &str) -> String {
    glob::Pattern::escape(raw)
}
