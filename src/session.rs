//! Sessions: the owner of every native object.
//!
//! A [`Session`] holds the resource table, the deletion queue, the operation
//! cache, the tracked-resource counters, the worker pool and the operation
//! block list. Handles keep a weak reference back to their session, so
//! dropping the last `Session` clone frees every remaining object.
//!
//! ## Locking
//!
//! Table, queue and cache sit behind separate mutexes. The cache lock may be
//! held while taking the table lock, never the other way round. Objects whose
//! last claim is released are dropped after the table lock is released, and
//! the deletion queue is flushed outside its lock, so host callbacks (a
//! target's end hook, a closure captured by a custom source) never run while
//! a session lock is held.

use crate::cache::{CacheStats, OperationCache, OperationKey};
use crate::config::{self, BridgeConfig, ConfigError};
use crate::connection::{NativeSource, NativeTarget};
use crate::engine::{EngineError, NativeImage};
use crate::handle::{DeletionQueue, Handle, HandleError, ResourceId, ResourceKind, ResourceTable};
use crate::stats::{StatsSnapshot, Tracker};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A native object owned by the resource table.
pub(crate) enum Resource {
    Image(Arc<NativeImage>),
    Source(Arc<Mutex<NativeSource>>),
    Target(Arc<Mutex<NativeTarget>>),
}

impl Resource {
    fn kind(&self) -> ResourceKind {
        match self {
            Resource::Image(_) => ResourceKind::Image,
            Resource::Source(_) => ResourceKind::Source,
            Resource::Target(_) => ResourceKind::Target,
        }
    }
}

pub(crate) struct SessionInner {
    config: BridgeConfig,
    table: Mutex<ResourceTable<Resource>>,
    queue: Mutex<DeletionQueue>,
    cache: Mutex<OperationCache>,
    tracker: Arc<Tracker>,
    pool: rayon::ThreadPool,
    auto_delete: AtomicBool,
    blocked: Mutex<BTreeSet<String>>,
}

impl SessionInner {
    pub fn auto_delete(&self) -> bool {
        self.auto_delete.load(Ordering::Acquire)
    }

    pub fn enqueue(&self, handle: Handle) {
        self.queue.lock().push(handle);
    }

    pub fn dequeue(&self, handle: &Handle) -> bool {
        self.queue.lock().remove(handle)
    }

    pub fn retain(&self, id: ResourceId) -> bool {
        self.table.lock().retain(id)
    }

    /// Drop one claim, freeing the object outside the table lock when it was
    /// the last.
    pub fn release(&self, id: ResourceId) {
        let freed = self.table.lock().release(id);
        if let Some(resource) = freed {
            tracing::debug!("Freed {} {id}", resource.kind());
            drop(resource);
        }
    }

    fn resource<T>(
        &self,
        handle: &Handle,
        expected: ResourceKind,
        pick: impl FnOnce(&Resource) -> Option<T>,
    ) -> Result<T, HandleError> {
        let id = handle.live_id()?;
        let table = self.table.lock();
        let resource = table
            .get(id)
            .ok_or(HandleError::AlreadyDeleted { kind: handle.kind() })?;
        pick(resource).ok_or(HandleError::WrongKind {
            expected,
            found: resource.kind(),
        })
    }

    /// Evict least recently used cache entries until every limit holds.
    fn trim_cache(&self) {
        loop {
            let evicted = {
                let mut cache = self.cache.lock();
                if !cache.over_limits(self.tracker.mem(), self.tracker.files()) {
                    return;
                }
                match cache.pop_lru() {
                    Some(id) => id,
                    None => return,
                }
            };
            self.release(evicted);
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let pending = self.queue.get_mut().len();
        if pending > 0 {
            tracing::debug!("Dropping session with {pending} queued handles");
        }
        let live = self.table.get_mut().drain();
        if !live.is_empty() {
            tracing::debug!("Dropping session with {} live objects", live.len());
        }
    }
}

/// Shared owner of native objects. Cloning is cheap and yields the same
/// session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// A session with stock defaults.
    pub fn new() -> Result<Self, SessionError> {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let threads = config::effective_threads(&config.session);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("imgbridge-worker-{i}"))
            .build()?;
        let blocked = config.security.blocked_operations.iter().cloned().collect();
        tracing::debug!("Starting session with {threads} worker threads");
        Ok(Self {
            inner: Arc::new(SessionInner {
                table: Mutex::new(ResourceTable::new()),
                queue: Mutex::new(DeletionQueue::new()),
                cache: Mutex::new(OperationCache::new(config.cache.clone())),
                tracker: Tracker::new(),
                pool,
                auto_delete: AtomicBool::new(config.session.auto_delete),
                blocked: Mutex::new(blocked),
                config,
            }),
        })
    }

    /// A session configured from `imgbridge.toml` in `dir`, if present.
    pub fn from_config_dir(dir: &Path) -> Result<Self, SessionError> {
        Self::with_config(config::load_config(dir)?)
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub(crate) fn tracker(&self) -> &Arc<Tracker> {
        &self.inner.tracker
    }

    pub(crate) fn pool(&self) -> &rayon::ThreadPool {
        &self.inner.pool
    }

    // =========================================================================
    // Resource table
    // =========================================================================

    /// Store a new object and return the first handle to it.
    pub(crate) fn insert(&self, resource: Resource) -> Handle {
        let kind = resource.kind();
        let id = self.inner.table.lock().insert(resource);
        tracing::trace!("Created {kind} {id}");
        Handle::adopt(&self.inner, id, kind)
    }

    pub(crate) fn image_of(&self, handle: &Handle) -> Result<Arc<NativeImage>, HandleError> {
        self.inner.resource(handle, ResourceKind::Image, |r| match r {
            Resource::Image(i) => Some(Arc::clone(i)),
            _ => None,
        })
    }

    pub(crate) fn source_of(&self, handle: &Handle) -> Result<Arc<Mutex<NativeSource>>, HandleError> {
        self.inner.resource(handle, ResourceKind::Source, |r| match r {
            Resource::Source(s) => Some(Arc::clone(s)),
            _ => None,
        })
    }

    pub(crate) fn target_of(&self, handle: &Handle) -> Result<Arc<Mutex<NativeTarget>>, HandleError> {
        self.inner.resource(handle, ResourceKind::Target, |r| match r {
            Resource::Target(t) => Some(Arc::clone(t)),
            _ => None,
        })
    }

    /// Number of native objects with at least one claim.
    pub fn live_objects(&self) -> usize {
        self.inner.table.lock().len()
    }

    /// Claims held on `id` by handles and the cache; `0` once freed.
    pub fn claims(&self, id: ResourceId) -> u32 {
        self.inner.table.lock().claims(id)
    }

    // =========================================================================
    // Deletion queue
    // =========================================================================

    /// Queue every handle created from now on. Handles that already exist
    /// are not affected.
    pub fn set_auto_delete(&self, enabled: bool) {
        self.inner.auto_delete.store(enabled, Ordering::Release);
    }

    pub fn auto_delete(&self) -> bool {
        self.inner.auto_delete()
    }

    pub fn deletion_queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Delete every queued handle in insertion order and empty the queue.
    ///
    /// Handles queued while flushing (by an end hook, for instance) are
    /// deleted by the same call. Returns how many handles were deleted.
    pub fn flush_deletion_queue(&self) -> usize {
        let mut deleted = 0;
        loop {
            let mut batch = self.inner.queue.lock().take();
            if batch.is_empty() {
                break;
            }
            deleted += batch.flush();
        }
        if deleted > 0 {
            tracing::debug!("Flushed {deleted} queued handles");
        }
        deleted
    }

    /// Take the queued handles out, leaving the session's queue empty.
    pub fn take_deletion_queue(&self) -> DeletionQueue {
        self.inner.queue.lock().take()
    }

    /// Put saved handles back at the end of the queue.
    pub fn restore_deletion_queue(&self, saved: DeletionQueue) {
        self.inner.queue.lock().append(saved);
    }

    /// Swap in `queue` and return the previous contents.
    pub fn replace_deletion_queue(&self, queue: DeletionQueue) -> DeletionQueue {
        std::mem::replace(&mut *self.inner.queue.lock(), queue)
    }

    // =========================================================================
    // Operation cache
    // =========================================================================

    pub(crate) fn cache_lookup(&self, key: &OperationKey, kind: ResourceKind) -> Option<Handle> {
        let id = {
            let mut cache = self.inner.cache.lock();
            let id = cache.lookup(key)?;
            if !self.inner.table.lock().retain(id) {
                cache.forget(key);
                return None;
            }
            id
        };
        tracing::trace!("Cache hit for {id}");
        Some(Handle::adopt(&self.inner, id, kind))
    }

    /// Remember `handle`'s object as the result of `key`, then trim.
    pub(crate) fn cache_insert(&self, key: OperationKey, handle: &Handle) {
        let id = handle.id();
        if !self.inner.retain(id) {
            return;
        }
        let replaced = self.inner.cache.lock().insert(key, id);
        if let Some(old) = replaced {
            self.inner.release(old);
        }
        self.inner.trim_cache();
    }

    /// Number of operations currently cached.
    pub fn cache_size(&self) -> usize {
        self.inner.cache.lock().len()
    }

    pub fn cache_max(&self) -> usize {
        self.inner.cache.lock().limits().max_operations
    }

    pub fn set_cache_max(&self, max: usize) {
        self.inner.cache.lock().limits_mut().max_operations = max;
        self.inner.trim_cache();
    }

    pub fn cache_max_mem(&self) -> u64 {
        self.inner.cache.lock().limits().max_mem
    }

    pub fn set_cache_max_mem(&self, max: u64) {
        self.inner.cache.lock().limits_mut().max_mem = max;
        self.inner.trim_cache();
    }

    pub fn cache_max_files(&self) -> usize {
        self.inner.cache.lock().limits().max_files
    }

    pub fn set_cache_max_files(&self, max: usize) {
        self.inner.cache.lock().limits_mut().max_files = max;
        self.inner.trim_cache();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().stats()
    }

    /// Forget every cached operation. Handles stay valid.
    pub fn drop_all_cache(&self) {
        let ids = self.inner.cache.lock().drain();
        for id in ids {
            self.inner.release(id);
        }
    }

    // =========================================================================
    // Accounting and control
    // =========================================================================

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.tracker.snapshot()
    }

    /// Worker threads used for pixel work.
    pub fn concurrency(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    /// Block or unblock an operation by name.
    ///
    /// Names nest on `_`: blocking `load` blocks `load_png` and every other
    /// loader; unblocking `load` clears every `load_*` entry as well.
    pub fn block_operation(&self, name: &str, blocked: bool) {
        let mut set = self.inner.blocked.lock();
        if blocked {
            set.insert(name.to_string());
        } else {
            let prefix = format!("{name}_");
            set.retain(|entry| entry != name && !entry.starts_with(&prefix));
        }
    }

    pub fn is_blocked(&self, operation: &str) -> bool {
        self.inner.blocked.lock().iter().any(|entry| {
            operation == entry
                || operation
                    .strip_prefix(entry.as_str())
                    .is_some_and(|rest| rest.starts_with('_'))
        })
    }

    /// Currently blocked operation names, sorted.
    pub fn blocked_operations(&self) -> Vec<String> {
        self.inner.blocked.lock().iter().cloned().collect()
    }

    pub(crate) fn check_blocked(&self, operation: &str) -> Result<(), EngineError> {
        if self.is_blocked(operation) {
            return Err(EngineError::Blocked(operation.to_string()));
        }
        Ok(())
    }

    /// Flush the deletion queue and drop the cache.
    pub fn shutdown(&self) {
        self.flush_deletion_queue();
        self.drop_all_cache();
        tracing::debug!(
            "Session shut down with {} live objects ({})",
            self.live_objects(),
            self.stats()
        );
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("live_objects", &self.live_objects())
            .field("queued", &self.deletion_queue_len())
            .field("cached", &self.cache_size())
            .finish()
    }
}
