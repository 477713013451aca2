//! Bounded cache of trusted publisher identities.
//!
//! Shared by every feed session in the process. Only records that passed the
//! trust checks are inserted. Entries expire after a TTL and the least
//! recently referenced entry is evicted when the cache is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::record::PublisherProfile;
use crate::model::ItemId;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct IdentityCacheConfig {
    /// How long a trusted identity is reused before it must be fetched again
    pub ttl: Duration,

    /// Maximum number of cached identities
    pub max_entries: usize,
}

impl Default for IdentityCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 10_000,
        }
    }
}

// =============================================================================
// Cached Identity
// =============================================================================

#[derive(Debug, Clone)]
struct CachedIdentity {
    profile: PublisherProfile,
    expires_at: Instant,
    last_referenced: Instant,
}

impl CachedIdentity {
    fn new(profile: PublisherProfile, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            profile,
            expires_at: now + ttl,
            last_referenced: now,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

// =============================================================================
// Identity Cache
// =============================================================================

/// Trusted identities indexed by identity record id.
pub struct IdentityCache {
    entries: DashMap<ItemId, CachedIdentity>,
    config: IdentityCacheConfig,
    stats: CacheStats,
}

impl IdentityCache {
    pub fn new(config: IdentityCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            stats: CacheStats::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(IdentityCacheConfig::default())
    }

    /// Admit a trusted profile, evicting the least recently referenced
    /// entry when full.
    pub fn insert(&self, profile: PublisherProfile) {
        if !self.entries.contains_key(&profile.info_id)
            && self.entries.len() >= self.config.max_entries
        {
            self.evict_lru();
        }

        let info_id = profile.info_id;
        self.entries
            .insert(info_id, CachedIdentity::new(profile, self.config.ttl));
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Look up a profile, refreshing its last-referenced time on a hit.
    pub fn get(&self, info_id: &ItemId) -> Option<PublisherProfile> {
        if let Some(mut entry) = self.entries.get_mut(info_id) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(info_id);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            entry.last_referenced = Instant::now();
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.profile.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn contains(&self, info_id: &ItemId) -> bool {
        self.entries
            .get(info_id)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    pub fn remove(&self, info_id: &ItemId) -> bool {
        self.entries.remove(info_id).is_some()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.stats
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    fn evict_lru(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.last_referenced)
            .map(|e| *e.key());

        if let Some(info_id) = oldest {
            self.entries.remove(&info_id);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(info = %info_id.short(), "evicted identity from cache");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}
