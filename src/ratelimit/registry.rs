//! Sharded registry of token buckets keyed by identity.

use parking_lot::RwLock;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::bucket::TokenBucket;
use super::identity::IdentityKey;
use super::policy::RateLimitPolicy;
use crate::error::Result;

/// Default number of independently locked shards.
pub const DEFAULT_SHARDS: usize = 16;

type Shard = RwLock<HashMap<IdentityKey, Arc<TokenBucket>>>;

/// Concurrent map from identity key to its token bucket.
///
/// Keys are spread over shards by hash. Lookups of existing buckets take a
/// shared lock on one shard only. Creation and eviction take that shard's
/// exclusive lock, so a sweep of one shard never stalls checks routed to
/// another.
pub struct LimiterRegistry {
    name: String,
    shards: Box<[Shard]>,
    hasher: RandomState,
}

impl LimiterRegistry {
    /// Create a registry with [`DEFAULT_SHARDS`] shards.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_shards(name, DEFAULT_SHARDS)
    }

    /// Create a registry with a specific shard count (at least one).
    pub fn with_shards(name: impl Into<String>, shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            name: name.into(),
            shards,
            hasher: RandomState::new(),
        }
    }

    /// Registry name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn shard(&self, key: &IdentityKey) -> &Shard {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Get the bucket for `key`, creating it seeded full if absent.
    ///
    /// An existing bucket whose policy differs from `policy` is switched to
    /// it, so policy changes reach live identities on their next request.
    pub fn get_or_create(
        &self,
        key: &IdentityKey,
        policy: RateLimitPolicy,
        now: Instant,
    ) -> Arc<TokenBucket> {
        let shard = self.shard(key);

        let existing = shard.read().get(key).cloned();
        if let Some(bucket) = existing {
            bucket.reconfigure(policy, now);
            return bucket;
        }

        let mut buckets = shard.write();
        // Another thread may have created it between the two locks.
        if let Some(bucket) = buckets.get(key) {
            let bucket = Arc::clone(bucket);
            drop(buckets);
            bucket.reconfigure(policy, now);
            return bucket;
        }

        debug!(
            registry = %self.name,
            key = %key,
            capacity = policy.capacity,
            refill_per_second = policy.refill_per_second,
            "Creating token bucket"
        );
        let bucket = Arc::new(TokenBucket::new(policy, now));
        buckets.insert(key.clone(), Arc::clone(&bucket));
        bucket
    }

    /// Take one token from the bucket for `key`, creating it seeded full if
    /// absent.
    ///
    /// The token is taken while the shard lock is still held, so a
    /// concurrent [`sweep`](Self::sweep) cannot evict the bucket between
    /// lookup and spend. Locks are always taken shard first, then bucket.
    pub fn try_acquire(
        &self,
        key: &IdentityKey,
        policy: RateLimitPolicy,
        now: Instant,
    ) -> Result<bool> {
        let shard = self.shard(key);

        {
            let buckets = shard.read();
            if let Some(bucket) = buckets.get(key) {
                bucket.reconfigure(policy, now);
                return bucket.try_acquire(now);
            }
        }

        let mut buckets = shard.write();
        let bucket = buckets.entry(key.clone()).or_insert_with(|| {
            debug!(
                registry = %self.name,
                key = %key,
                capacity = policy.capacity,
                refill_per_second = policy.refill_per_second,
                "Creating token bucket"
            );
            Arc::new(TokenBucket::new(policy, now))
        });
        bucket.reconfigure(policy, now);
        bucket.try_acquire(now)
    }

    /// Look up a bucket without creating one.
    pub fn get(&self, key: &IdentityKey) -> Option<Arc<TokenBucket>> {
        self.shard(key).read().get(key).cloned()
    }

    /// Remove the bucket for `key`. Returns whether one existed.
    pub fn remove(&self, key: &IdentityKey) -> bool {
        self.shard(key).write().remove(key).is_some()
    }

    /// Whether a bucket exists for `key`.
    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Evict every bucket that is full at `now` and untouched for at least
    /// `idle_after`. Returns the number of buckets evicted.
    ///
    /// Shards are visited one at a time and each holds its exclusive lock
    /// only for its own scan. A bucket below capacity is never evicted.
    pub fn sweep(&self, now: Instant, idle_after: Duration) -> usize {
        let mut evicted = 0;
        for (index, shard) in self.shards.iter().enumerate() {
            let mut buckets = shard.write();
            let before = buckets.len();
            buckets.retain(|key, bucket| {
                let idle = bucket.is_idle(now, idle_after);
                if idle {
                    trace!(registry = %self.name, key = %key, "Evicting idle bucket");
                }
                !idle
            });
            let removed = before - buckets.len();
            drop(buckets);

            if removed > 0 {
                debug!(registry = %self.name, shard = index, removed, "Swept shard");
            }
            evicted += removed;
        }
        evicted
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Drop every bucket.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .field("buckets", &self.len())
            .finish()
    }
}
