//! Shared cache tier boundary
//!
//! The second cache tier is an external key-value store (Redis or
//! compatible) shared between gateway instances. The core only depends on
//! the small [`SharedStore`] surface below; [`InMemorySharedStore`] is the
//! required single-instance implementation and the test double.
//!
//! Every operation is fallible: a store outage must degrade the cache to
//! misses and best-effort writes, never fail a request.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A value read from the shared tier, with its remaining lifetime.
///
/// The remaining TTL lets the local tier cap its back-fill copy so a local
/// entry never outlives the shared entry it mirrors.
#[derive(Debug, Clone)]
pub struct SharedEntry {
    pub data: Vec<u8>,
    pub expires_in: Duration,
}

/// Key-value store used as the cache's second tier.
///
/// Sets back tag-based invalidation: `add_to_set`/`set_members` maintain
/// tag → cache-key membership, `expire_set` bounds their growth.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<SharedEntry>>;

    async fn set_with_expiry(&self, key: &str, data: Vec<u8>, ttl: Duration)
        -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    async fn add_to_set(&self, set_key: &str, member: &str) -> anyhow::Result<()>;

    async fn set_members(&self, set_key: &str) -> anyhow::Result<Vec<String>>;

    async fn expire_set(&self, set_key: &str, ttl: Duration) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug)]
struct StoredSet {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

/// In-memory [`SharedStore`].
///
/// Correct for a single gateway instance; production deployments substitute
/// a networked store behind the same trait so instances agree on
/// invalidation.
#[derive(Debug, Default)]
pub struct InMemorySharedStore {
    values: RwLock<HashMap<String, StoredValue>>,
    sets: RwLock<HashMap<String, StoredSet>>,
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) values, for tests
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.values
            .read()
            .await
            .values()
            .filter(|v| v.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<SharedEntry>> {
        let now = Instant::now();
        {
            let values = self.values.read().await;
            if let Some(stored) = values.get(key) {
                if stored.expires_at > now {
                    return Ok(Some(SharedEntry {
                        data: stored.data.clone(),
                        expires_in: stored.expires_at - now,
                    }));
                }
            } else {
                return Ok(None);
            }
        }
        // Expired: drop it lazily
        self.values.write().await.remove(key);
        Ok(None)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        data: Vec<u8>,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        self.values.write().await.insert(
            key.to_string(),
            StoredValue {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> anyhow::Result<()> {
        let mut sets = self.sets.write().await;
        let set = sets.entry(set_key.to_string()).or_insert_with(|| StoredSet {
            members: HashSet::new(),
            expires_at: None,
        });
        set.members.insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, set_key: &str) -> anyhow::Result<Vec<String>> {
        let now = Instant::now();
        let sets = self.sets.read().await;
        Ok(sets
            .get(set_key)
            .filter(|s| s.expires_at.map(|at| at > now).unwrap_or(true))
            .map(|s| s.members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn expire_set(&self, set_key: &str, ttl: Duration) -> anyhow::Result<()> {
        if let Some(set) = self.sets.write().await.get_mut(set_key) {
            set.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

/// A store that fails every operation. Used in tests to verify the cache
/// degrades instead of erroring.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct FailingSharedStore;

#[cfg(test)]
#[async_trait]
impl SharedStore for FailingSharedStore {
    async fn get(&self, _key: &str) -> anyhow::Result<Option<SharedEntry>> {
        anyhow::bail!("shared store unreachable")
    }

    async fn set_with_expiry(
        &self,
        _key: &str,
        _data: Vec<u8>,
        _ttl: Duration,
    ) -> anyhow::Result<()> {
        anyhow::bail!("shared store unreachable")
    }

    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        anyhow::bail!("shared store unreachable")
    }

    async fn add_to_set(&self, _set_key: &str, _member: &str) -> anyhow::Result<()> {
        anyhow::bail!("shared store unreachable")
    }

    async fn set_members(&self, _set_key: &str) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("shared store unreachable")
    }

    async fn expire_set(&self, _set_key: &str, _ttl: Duration) -> anyhow::Result<()> {
        anyhow::bail!("shared store unreachable")
    }
}
