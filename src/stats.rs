//! Tracked memory and open-file accounting.
//!
//! Every native object that owns a sizeable buffer or an OS file carries an
//! RAII guard from this module. Creating the guard adds to the session's
//! [`Tracker`]; dropping it subtracts. Because guards live inside the native
//! objects, the counters drop exactly when the resource table frees the
//! object, which is what the operation cache watches when deciding to trim.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Session-wide counters.
#[derive(Debug, Default)]
pub struct Tracker {
    allocations: AtomicUsize,
    mem: AtomicU64,
    mem_highwater: AtomicU64,
    files: AtomicUsize,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live tracked allocations.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    /// Bytes currently held by tracked allocations.
    pub fn mem(&self) -> u64 {
        self.mem.load(Ordering::Acquire)
    }

    /// Largest value [`mem`](Self::mem) has reached.
    pub fn mem_highwater(&self) -> u64 {
        self.mem_highwater.load(Ordering::Acquire)
    }

    /// Number of open tracked files.
    pub fn files(&self) -> usize {
        self.files.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations(),
            mem: self.mem(),
            mem_highwater: self.mem_highwater(),
            files: self.files(),
        }
    }

    fn add_mem(&self, amount: u64) {
        let now = self.mem.fetch_add(amount, Ordering::AcqRel) + amount;
        self.mem_highwater.fetch_max(now, Ordering::AcqRel);
    }

    fn sub_mem(&self, amount: u64) {
        self.mem.fetch_sub(amount, Ordering::AcqRel);
    }
}

/// Point-in-time copy of the [`Tracker`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub allocations: usize,
    pub mem: u64,
    pub mem_highwater: u64,
    pub files: usize,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} allocations, {} bytes (peak {}), {} files",
            self.allocations, self.mem, self.mem_highwater, self.files
        )
    }
}

/// RAII guard for one tracked allocation.
///
/// ```ignore
/// struct Blob {
///     data: Vec<u8>,
///     tracked: TrackedMemory,
/// }
///
/// impl Blob {
///     fn grow(&mut self, extra: &[u8]) {
///         self.data.extend_from_slice(extra);
///         self.tracked.set(self.data.len() as u64);
///     }
/// }
/// ```
pub struct TrackedMemory {
    tracker: Arc<Tracker>,
    amount: u64,
}

impl TrackedMemory {
    pub fn new(tracker: &Arc<Tracker>, amount: u64) -> Self {
        tracker.allocations.fetch_add(1, Ordering::AcqRel);
        tracker.add_mem(amount);
        Self {
            tracker: Arc::clone(tracker),
            amount,
        }
    }

    /// Set the tracked amount to a new value, applying the delta.
    pub fn set(&mut self, new_amount: u64) {
        if new_amount > self.amount {
            self.tracker.add_mem(new_amount - self.amount);
        } else {
            self.tracker.sub_mem(self.amount - new_amount);
        }
        self.amount = new_amount;
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
}

impl Drop for TrackedMemory {
    fn drop(&mut self) {
        self.tracker.sub_mem(self.amount);
        self.tracker.allocations.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for TrackedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedMemory")
            .field("amount", &self.amount)
            .finish()
    }
}

/// RAII guard for one open file.
pub struct TrackedFile {
    tracker: Arc<Tracker>,
}

impl TrackedFile {
    pub fn new(tracker: &Arc<Tracker>) -> Self {
        tracker.files.fetch_add(1, Ordering::AcqRel);
        Self {
            tracker: Arc::clone(tracker),
        }
    }
}

impl Drop for TrackedFile {
    fn drop(&mut self) {
        self.tracker.files.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for TrackedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TrackedFile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_guard_adds_and_removes() {
        let tracker = Tracker::new();
        let guard = TrackedMemory::new(&tracker, 1000);
        assert_eq!(tracker.mem(), 1000);
        assert_eq!(tracker.allocations(), 1);

        drop(guard);
        assert_eq!(tracker.mem(), 0);
        assert_eq!(tracker.allocations(), 0);
    }

    #[test]
    fn highwater_survives_release() {
        let tracker = Tracker::new();
        let a = TrackedMemory::new(&tracker, 300);
        let b = TrackedMemory::new(&tracker, 200);
        drop(a);
        drop(b);
        assert_eq!(tracker.mem(), 0);
        assert_eq!(tracker.mem_highwater(), 500);
    }

    #[test]
    fn set_applies_delta() {
        let tracker = Tracker::new();
        let mut guard = TrackedMemory::new(&tracker, 100);
        guard.set(400);
        assert_eq!(tracker.mem(), 400);
        guard.set(50);
        assert_eq!(tracker.mem(), 50);
        assert_eq!(guard.amount(), 50);
        assert_eq!(tracker.mem_highwater(), 400);
        assert_eq!(tracker.allocations(), 1);
    }

    #[test]
    fn file_guard_counts_open_files() {
        let tracker = Tracker::new();
        let a = TrackedFile::new(&tracker);
        let b = TrackedFile::new(&tracker);
        assert_eq!(tracker.files(), 2);
        drop(a);
        assert_eq!(tracker.files(), 1);
        drop(b);
        assert_eq!(tracker.files(), 0);
    }

    #[test]
    fn snapshot_display() {
        let snap = StatsSnapshot {
            allocations: 2,
            mem: 10,
            mem_highwater: 30,
            files: 1,
        };
        assert_eq!(snap.to_string(), "2 allocations, 10 bytes (peak 30), 1 files");
    }
}
