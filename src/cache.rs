//! Two-tier response cache
//!
//! This module provides the tiered cache that sits between resolvers and the
//! upstream REST services:
//! - Fast local tier (in-process, bounded, insertion-order eviction)
//! - Shared tier behind the [`SharedStore`] trait (Redis in production)
//! - Per-namespace TTL and write strategy
//! - Tag-based bulk invalidation
//! - Transparent LZ4 compression for large payloads
//!
//! ## How It Works
//!
//! 1. **Cache key**: `namespace:key`, plus a SHA-256 hash fragment when
//!    parameters are supplied (canonicalized so property order is irrelevant)
//! 2. **Read path**: local tier first; on local miss the shared tier is
//!    consulted and a hit is back-filled locally with a capped TTL
//! 3. **Write path**: local write always happens immediately; the shared
//!    write follows the namespace's [`WriteStrategy`]
//! 4. **Degradation**: shared-tier failures turn reads into misses and writes
//!    into logged best-effort attempts, never into request errors

use crate::compression::{decode_payload, encode_payload};
use crate::metrics::Metrics;
use crate::shared_store::SharedStore;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// How a `set` propagates to the shared tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Synchronous shared write before `set` returns (default).
    CacheAside,
    /// Currently identical to `CacheAside`. Kept as a distinct name so
    /// callers can state the always-consistent intent; a future revision may
    /// add read-repair on top of it.
    WriteThrough,
    /// `set` returns after the local write; the shared write runs on a
    /// background task and failures are only logged.
    WriteBehind,
}

impl Default for WriteStrategy {
    fn default() -> Self {
        Self::CacheAside
    }
}

/// Freshness policy for one namespace.
#[derive(Clone, Debug)]
pub struct NamespacePolicy {
    pub ttl: Duration,
    pub strategy: WriteStrategy,
}

impl NamespacePolicy {
    /// Live data such as today's appointment schedules.
    pub fn realtime() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            strategy: WriteStrategy::CacheAside,
        }
    }

    /// Entities that change occasionally, such as doctor or patient profiles.
    pub fn semi_static() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            strategy: WriteStrategy::CacheAside,
        }
    }

    /// Near-immutable reference data such as the department list.
    pub fn reference() -> Self {
        Self {
            ttl: Duration::from_secs(12 * 60 * 60),
            strategy: WriteStrategy::CacheAside,
        }
    }
}

/// Configuration for the tiered cache
///
/// # Example
///
/// ```rust
/// use hms_gateway_core::{CacheConfig, NamespacePolicy};
///
/// let config = CacheConfig::default()
///     .with_namespace("schedules", NamespacePolicy::realtime())
///     .with_namespace("doctors", NamespacePolicy::semi_static())
///     .with_namespace("departments", NamespacePolicy::reference());
/// ```
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Maximum number of entries in the local tier
    pub local_max_entries: usize,
    /// Upper bound on any local-tier TTL, regardless of namespace TTL
    pub local_ttl_cap: Duration,
    /// Expiry applied to tag membership sets in the shared tier
    pub tag_set_ttl: Duration,
    /// Payloads at or above this many serialized bytes are LZ4-compressed
    pub compression_threshold: usize,
    /// Per-namespace policies; namespaces not listed use `default_policy`
    pub namespaces: HashMap<String, NamespacePolicy>,
    pub default_policy: NamespacePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_max_entries: 10_000,
            local_ttl_cap: Duration::from_secs(600),
            tag_set_ttl: Duration::from_secs(24 * 60 * 60),
            compression_threshold: 1024,
            namespaces: HashMap::new(),
            default_policy: NamespacePolicy::semi_static(),
        }
    }
}

impl CacheConfig {
    pub fn with_namespace(mut self, namespace: &str, policy: NamespacePolicy) -> Self {
        self.namespaces.insert(namespace.to_string(), policy);
        self
    }

    pub fn with_local_max_entries(mut self, max: usize) -> Self {
        self.local_max_entries = max;
        self
    }

    pub fn with_local_ttl_cap(mut self, cap: Duration) -> Self {
        self.local_ttl_cap = cap;
        self
    }

    fn policy_for(&self, namespace: &str) -> &NamespacePolicy {
        self.namespaces.get(namespace).unwrap_or(&self.default_policy)
    }
}

/// Per-call overrides for [`TieredCache::set`].
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub strategy: Option<WriteStrategy>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone, Debug)]
struct LocalEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LocalTier {
    entries: HashMap<String, LocalEntry>,
    /// Insertion order for eviction when at capacity
    insertion_order: Vec<String>,
}

impl LocalTier {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(key)?;
        if entry.expires_at > Instant::now() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn insert(&mut self, key: String, value: serde_json::Value, ttl: Duration, max: usize) {
        if !self.entries.contains_key(&key) && self.entries.len() >= max {
            let to_remove = self.entries.len() - max + 1;
            let drain_count = to_remove.min(self.insertion_order.len());
            for old in self.insertion_order.drain(..drain_count) {
                self.entries.remove(&old);
            }
        }
        self.insertion_order.retain(|k| k != &key);
        self.insertion_order.push(key.clone());
        self.entries.insert(
            key,
            LocalEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.insertion_order.retain(|k| k != key);
    }
}

/// Running cache counters, readable at any time.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

/// Two-tier cache: bounded local map backed by a shared store.
///
/// A shared-tier outage degrades reads to misses and writes to logged
/// best-effort attempts. The cache never surfaces a store error to callers.
pub struct TieredCache {
    config: CacheConfig,
    local: RwLock<LocalTier>,
    shared: Arc<dyn SharedStore>,
    metrics: Arc<Metrics>,
    stats: StatCounters,
    /// Shared writes still running on background tasks
    pending_writes: Arc<AtomicUsize>,
    write_drained: Arc<Notify>,
}

impl TieredCache {
    pub fn new(config: CacheConfig, shared: Arc<dyn SharedStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            local: RwLock::new(LocalTier::default()),
            shared,
            metrics,
            stats: StatCounters::default(),
            pending_writes: Arc::new(AtomicUsize::new(0)),
            write_drained: Arc::new(Notify::new()),
        }
    }

    /// Derive the opaque cache key for `(namespace, key, params)`.
    ///
    /// Parameters are canonicalized (object keys sorted recursively) before
    /// hashing so equivalent objects map to the same key regardless of
    /// property order.
    pub fn cache_key(namespace: &str, key: &str, params: Option<&serde_json::Value>) -> String {
        match params {
            Some(params) if !params.is_null() => {
                let mut hasher = Sha256::new();
                let sorted = sort_json_value(params);
                hasher.update(sorted.to_string().as_bytes());
                let digest = hex::encode(hasher.finalize());
                format!("{namespace}:{key}:{digest}")
            }
            _ => format!("{namespace}:{key}"),
        }
    }

    fn tag_key(tag: &str) -> String {
        format!("tag:{tag}")
    }

    /// Look up a value. Local tier first, then the shared tier; a shared hit
    /// is back-filled locally with `min(remaining shared TTL, local cap)` so
    /// the local copy never outlives the shared entry.
    pub async fn get(
        &self,
        namespace: &str,
        key: &str,
        params: Option<&serde_json::Value>,
    ) -> Option<serde_json::Value> {
        let cache_key = Self::cache_key(namespace, key, params);

        if let Some(value) = self.local.read().get(&cache_key) {
            tracing::debug!(cache_key = %cache_key, "local tier hit");
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_cache("hit_local");
            return Some(value);
        }

        let shared_entry = match self.shared.get(&cache_key).await {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(cache_key = %cache_key, %error, "shared tier unreachable, degrading to miss");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_cache("degraded");
                return None;
            }
        };

        if let Some(entry) = shared_entry {
            // Undecodable payloads are treated as misses, never errors
            if let Some(value) = decode_payload(&entry.data) {
                let local_ttl = entry.expires_in.min(self.config.local_ttl_cap);
                self.local.write().insert(
                    cache_key.clone(),
                    value.clone(),
                    local_ttl,
                    self.config.local_max_entries,
                );
                tracing::debug!(cache_key = %cache_key, "shared tier hit");
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_cache("hit_shared");
                return Some(value);
            }
            tracing::warn!(cache_key = %cache_key, "discarding undecodable shared entry");
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_cache("miss");
        None
    }

    /// Store a value in both tiers.
    ///
    /// The local write always happens before this returns, bounded by the
    /// local TTL cap. The shared write follows the resolved strategy; its
    /// failure is logged and counted, never surfaced.
    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        params: Option<&serde_json::Value>,
        value: serde_json::Value,
        options: SetOptions,
    ) {
        let cache_key = Self::cache_key(namespace, key, params);
        let policy = self.config.policy_for(namespace);
        let ttl = options.ttl.unwrap_or(policy.ttl);
        let strategy = options.strategy.unwrap_or(policy.strategy);

        let local_ttl = ttl.min(self.config.local_ttl_cap);
        self.local.write().insert(
            cache_key.clone(),
            value.clone(),
            local_ttl,
            self.config.local_max_entries,
        );
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_cache("set");

        for tag in &options.tags {
            self.register_tag(tag, &cache_key).await;
        }

        let encoded = match encode_payload(&value, estimated_size(&value) >= self.config.compression_threshold) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(cache_key = %cache_key, %error, "failed to encode payload, skipping shared write");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match strategy {
            WriteStrategy::CacheAside | WriteStrategy::WriteThrough => {
                if let Err(error) = self.shared.set_with_expiry(&cache_key, encoded, ttl).await {
                    tracing::warn!(cache_key = %cache_key, %error, "shared tier write failed");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            WriteStrategy::WriteBehind => {
                let shared = Arc::clone(&self.shared);
                let pending = Arc::clone(&self.pending_writes);
                let drained = Arc::clone(&self.write_drained);
                pending.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Err(error) = shared.set_with_expiry(&cache_key, encoded, ttl).await {
                        tracing::warn!(cache_key = %cache_key, %error, "write-behind shared write failed");
                    }
                    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        drained.notify_waiters();
                    }
                });
            }
        }
    }

    /// Remove a value from both tiers.
    pub async fn delete(&self, namespace: &str, key: &str, params: Option<&serde_json::Value>) {
        let cache_key = Self::cache_key(namespace, key, params);
        self.local.write().remove(&cache_key);
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_cache("delete");
        if let Err(error) = self.shared.delete(&cache_key).await {
            tracing::warn!(cache_key = %cache_key, %error, "shared tier delete failed");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove every cache key associated with any of `tags`, from both tiers.
    ///
    /// Returns the number of cache keys removed. Membership sets live in the
    /// shared tier so invalidation propagates to all gateway instances; their
    /// own expiry bounds growth.
    pub async fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let mut removed = 0;
        for tag in tags {
            let tag = tag.as_ref();
            let tag_key = Self::tag_key(tag);
            let members = match self.shared.set_members(&tag_key).await {
                Ok(members) => members,
                Err(error) => {
                    tracing::warn!(tag = %tag, %error, "could not read tag members, skipping");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            for cache_key in &members {
                self.local.write().remove(cache_key);
                if let Err(error) = self.shared.delete(cache_key).await {
                    tracing::warn!(cache_key = %cache_key, %error, "shared delete during invalidation failed");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
                removed += 1;
            }
            if let Err(error) = self.shared.delete(&tag_key).await {
                tracing::debug!(tag = %tag, %error, "could not drop tag set");
            }
            if !members.is_empty() {
                tracing::info!(tag = %tag, count = members.len(), "invalidated cache entries by tag");
            }
        }
        removed
    }

    async fn register_tag(&self, tag: &str, cache_key: &str) {
        let tag_key = Self::tag_key(tag);
        if let Err(error) = self.shared.add_to_set(&tag_key, cache_key).await {
            tracing::warn!(tag = %tag, %error, "could not register tag membership");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Err(error) = self.shared.expire_set(&tag_key, self.config.tag_set_ttl).await {
            tracing::debug!(tag = %tag, %error, "could not refresh tag set expiry");
        }
    }

    /// Wait until all write-behind tasks have completed. Call during drain
    /// before shutdown.
    pub async fn flush_pending_writes(&self) {
        loop {
            if self.pending_writes.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.write_drained.notified();
            tokio::pin!(notified);
            // Register before re-checking so a completion between the check
            // and the await is not lost
            notified.as_mut().enable();
            if self.pending_writes.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drop every local-tier entry. The shared tier is untouched.
    pub fn clear_local(&self) {
        let mut local = self.local.write();
        local.entries.clear();
        local.insertion_order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            sets: self.stats.sets.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("config", &self.config)
            .field("local_entries", &self.local.read().entries.len())
            .finish()
    }
}

/// Rough serialized size without allocating the full string for scalars
fn estimated_size(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null => 4,
        serde_json::Value::Bool(_) => 5,
        serde_json::Value::Number(_) => 12,
        serde_json::Value::String(s) => s.len() + 2,
        serde_json::Value::Array(items) => 2 + items.iter().map(estimated_size).sum::<usize>(),
        serde_json::Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 4 + estimated_size(v))
                .sum::<usize>()
        }
    }
}

/// Canonicalize parameter JSON so that key order never changes the derived
/// cache key. Objects are rebuilt with sorted keys at every level; arrays
/// keep their order (a reordered array is a different query).
fn sort_json_value(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, nested)| (key.clone(), sort_json_value(nested)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_json_value).collect()),
        scalar => scalar.clone(),
    }
}
