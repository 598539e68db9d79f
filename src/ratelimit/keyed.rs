//! Per-identity bucket cache sharing one limit configuration.

use parking_lot::RwLock;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::bucket::{LimitConfig, TokenBucket};
use super::clock::Clock;
use super::registry::RegistryKey;

/// Number of independently locked partitions of the identity map.
const SHARD_COUNT: usize = 16;

/// Maximum number of removals performed under a single write-lock hold.
const EVICTION_BATCH: usize = 256;

type Shard = RwLock<HashMap<String, LimiterEntry>>;

/// A bucket plus the time it was last used.
#[derive(Debug)]
pub struct LimiterEntry {
    bucket: Arc<TokenBucket>,
    /// Nanoseconds since the owning set's epoch.
    last_access: AtomicU64,
}

impl LimiterEntry {
    fn new(bucket: TokenBucket, now: u64) -> Self {
        Self {
            bucket: Arc::new(bucket),
            last_access: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access.load(Ordering::Relaxed))
    }
}

/// Mapping from identity to [`LimiterEntry`], all built from one [`LimitConfig`].
///
/// Identities are spread over [`SHARD_COUNT`] shards, each behind its own
/// lock. Lookups of known identities take only their shard's read lock. A
/// shard's write lock is taken when a new identity has to be inserted into it
/// or when the sweeper removes idle entries from it.
#[derive(Debug)]
pub struct KeyedLimiterSet {
    key: RegistryKey,
    limit: LimitConfig,
    shards: Box<[Shard]>,
    hasher: RandomState,
    clock: Arc<dyn Clock>,
    epoch: Instant,
}

impl KeyedLimiterSet {
    /// Create an empty set.
    pub fn new(key: RegistryKey, limit: LimitConfig, clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now();
        Self {
            key,
            limit,
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            clock,
            epoch,
        }
    }

    /// Return the bucket for `identity`, creating it on first use.
    ///
    /// Every call refreshes the entry's last-access time. Concurrent first
    /// access for the same identity yields exactly one bucket.
    pub fn get_or_create(&self, identity: &str) -> Arc<TokenBucket> {
        let now = self.ticks(self.clock.now());
        let shard = self.shard(identity);

        if let Some(entry) = shard.read().get(identity) {
            entry.touch(now);
            return Arc::clone(&entry.bucket);
        }

        let mut entries = shard.write();
        // Another caller may have inserted while we waited for the write lock.
        if let Some(entry) = entries.get(identity) {
            entry.touch(now);
            return Arc::clone(&entry.bucket);
        }

        debug!(
            registry_key = %self.key,
            identity = identity,
            "Creating new token bucket"
        );
        let entry = LimiterEntry::new(TokenBucket::new(self.limit, Arc::clone(&self.clock)), now);
        let bucket = Arc::clone(&entry.bucket);
        entries.insert(identity.to_owned(), entry);
        bucket
    }

    /// Remove every entry idle for longer than `ttl`.
    ///
    /// Shards are swept one at a time, so a lock is only ever held over a
    /// single shard. Candidates are collected under the shard's read lock and
    /// removed in bounded batches under its write lock, each entry re-checked
    /// at removal time so one touched in between survives. Returns the number
    /// of entries removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = self.ticks(self.clock.now());
        let ttl = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);

        let removed: usize = self
            .shards
            .iter()
            .map(|shard| Self::evict_shard(shard, now, ttl))
            .sum();

        if removed > 0 {
            trace!(registry_key = %self.key, removed = removed, "Evicted idle entries");
        }
        removed
    }

    fn evict_shard(shard: &Shard, now: u64, ttl: u64) -> usize {
        let stale: Vec<String> = shard
            .read()
            .iter()
            .filter(|(_, entry)| entry.idle_for(now) > ttl)
            .map(|(identity, _)| identity.clone())
            .collect();

        let mut removed = 0;
        for batch in stale.chunks(EVICTION_BATCH) {
            let mut entries = shard.write();
            for identity in batch {
                if entries.get(identity).is_some_and(|e| e.idle_for(now) > ttl) {
                    entries.remove(identity);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// How long `identity` has been idle, if it is tracked.
    pub fn idle_for(&self, identity: &str) -> Option<Duration> {
        let now = self.ticks(self.clock.now());
        self.shard(identity)
            .read()
            .get(identity)
            .map(|entry| Duration::from_nanos(entry.idle_for(now)))
    }

    /// Whether `identity` currently has a bucket.
    pub fn contains(&self, identity: &str) -> bool {
        self.shard(identity).read().contains_key(identity)
    }

    /// Number of tracked identities.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Whether no identity is tracked.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// The configuration signature this set belongs to.
    pub fn key(&self) -> &RegistryKey {
        &self.key
    }

    /// The limit every bucket in this set is built from.
    pub fn limit(&self) -> LimitConfig {
        self.limit
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    fn shard_index(&self, identity: &str) -> usize {
        (self.hasher.hash_one(identity) % SHARD_COUNT as u64) as usize
    }

    fn shard(&self, identity: &str) -> &Shard {
        &self.shards[self.shard_index(identity)]
    }

    fn ticks(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }
}
