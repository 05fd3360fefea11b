//! Operation cache.
//!
//! Repeating an operation on the same inputs with the same parameters returns
//! the earlier result instead of recomputing it. The cache holds one claim on
//! every result it remembers, which keeps the object alive after the caller
//! deleted its own handle.
//!
//! ## Cache keys
//!
//! Keys are **content-addressed**: a SHA-256 digest of the operation name,
//! the [`ResourceId`] of every input object, and the operation parameters,
//! built with [`OperationKey::builder`]. Because identities are never reused
//! (slot generations are bumped on free), a key can only match while its
//! inputs are the very objects that produced it.
//!
//! ## Eviction
//!
//! Entries are evicted least recently used first whenever one of three limits
//! is exceeded: the number of cached operations, the session's tracked memory,
//! or the session's open tracked files. Evicting an entry releases the cache's
//! claim only. Handles to the same object stay valid; the object is freed when
//! the last claim goes.
//!
//! The cache itself only does bookkeeping. Releasing claims and freeing
//! objects is done by the [`Session`](crate::session::Session), outside the
//! cache lock.

use crate::config::CacheConfig;
use crate::handle::ResourceId;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Digest identifying one operation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey(String);

impl OperationKey {
    pub fn builder(operation: &str) -> OperationKeyBuilder {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update(b"\0");
        OperationKeyBuilder { hasher }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Feeds inputs and parameters into an [`OperationKey`].
///
/// Every field is written with a one-byte tag so differently typed parameter
/// lists never produce the same byte stream.
pub struct OperationKeyBuilder {
    hasher: Sha256,
}

impl OperationKeyBuilder {
    pub fn input(mut self, id: ResourceId) -> Self {
        self.hasher.update(b"i");
        self.hasher.update(id.to_le_bytes());
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.hasher.update(b"u");
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.hasher.update(b"U");
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn f32(mut self, value: f32) -> Self {
        self.hasher.update(b"f");
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn str(mut self, value: &str) -> Self {
        self.hasher.update(b"s");
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn finish(self) -> OperationKey {
        OperationKey(format!("{:x}", self.hasher.finalize()))
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    id: ResourceId,
    last_used: u64,
}

/// LRU bookkeeping for cached operation results.
#[derive(Debug)]
pub(crate) struct OperationCache {
    entries: HashMap<OperationKey, CacheEntry>,
    limits: CacheConfig,
    tick: u64,
    stats: CacheStats,
}

impl OperationCache {
    pub fn new(limits: CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            limits,
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a result, marking it most recently used.
    pub fn lookup(&mut self, key: &OperationKey) -> Option<ResourceId> {
        let tick = self.next_tick();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = tick;
                self.stats.hit();
                Some(entry.id)
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    /// Forget one entry without counting an eviction.
    pub fn forget(&mut self, key: &OperationKey) -> Option<ResourceId> {
        self.entries.remove(key).map(|e| e.id)
    }

    /// Remember a result. Returns the identity it replaced, whose claim the
    /// caller must release.
    pub fn insert(&mut self, key: OperationKey, id: ResourceId) -> Option<ResourceId> {
        let last_used = self.next_tick();
        self.entries
            .insert(key, CacheEntry { id, last_used })
            .map(|old| old.id)
    }

    /// Remove the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<ResourceId> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())?;
        let entry = self.entries.remove(&key)?;
        self.stats.evict();
        tracing::debug!("Evicting cached operation {} ({})", &key.as_str()[..12], entry.id);
        Some(entry.id)
    }

    /// Whether any limit is exceeded given the session's current usage.
    pub fn over_limits(&self, mem: u64, files: usize) -> bool {
        self.entries.len() > self.limits.max_operations
            || mem > self.limits.max_mem
            || files > self.limits.max_files
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<ResourceId> {
        self.entries.drain().map(|(_, e)| e.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn limits(&self) -> &CacheConfig {
        &self.limits
    }

    pub fn limits_mut(&mut self) -> &mut CacheConfig {
        &mut self.limits
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

/// Summary of cache activity for a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn miss(&mut self) {
        self.misses += 1;
    }

    pub fn evict(&mut self) {
        self.evictions += 1;
    }

    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.evictions > 0 {
            write!(
                f,
                "{} hits, {} misses, {} evicted ({} lookups)",
                self.hits,
                self.misses,
                self.evictions,
                self.lookups()
            )
        } else {
            write!(
                f,
                "{} hits, {} misses ({} lookups)",
                self.hits,
                self.misses,
                self.lookups()
            )
        }
    }
}
