//! Deferred, explicitly flushed handle deletion.
//!
//! [`Handle::delete_later`](super::Handle::delete_later) appends to the
//! session's queue; nothing is released until the owner flushes it. Entries
//! are deleted in insertion order. The queue is a plain value so callers can
//! take it out of a session, run an isolated unit of work against an empty
//! one, and put the saved entries back afterwards.

use super::Handle;
use std::collections::VecDeque;
use std::fmt;

#[derive(Default)]
pub struct DeletionQueue {
    entries: VecDeque<Handle>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: Handle) {
        self.entries.push_back(handle);
        tracing::trace!("Queued handle for deletion (pending: {})", self.len());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether this exact handle (not merely an alias) is queued.
    pub fn contains(&self, handle: &Handle) -> bool {
        self.entries.iter().any(|h| h.same_handle(handle))
    }

    /// Remove one handle. Returns `false` if it was not queued.
    pub fn remove(&mut self, handle: &Handle) -> bool {
        match self.entries.iter().position(|h| h.same_handle(handle)) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Split off every entry from `start` onwards, in order.
    pub fn splice(&mut self, start: usize) -> DeletionQueue {
        let start = start.min(self.entries.len());
        DeletionQueue {
            entries: self.entries.split_off(start),
        }
    }

    /// Take every entry, leaving this queue empty.
    pub fn take(&mut self) -> DeletionQueue {
        std::mem::take(self)
    }

    /// Move the entries of `other` to the back of this queue.
    pub fn append(&mut self, mut other: DeletionQueue) {
        self.entries.append(&mut other.entries);
    }

    /// Delete every entry in insertion order and leave the queue empty.
    ///
    /// Returns how many handles were deleted. Entries that fail to delete are
    /// logged and skipped.
    pub fn flush(&mut self) -> usize {
        let mut deleted = 0;
        while let Some(handle) = self.entries.pop_front() {
            match handle.delete_scheduled() {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!("Skipping queued handle {}: {e}", handle.id()),
            }
        }
        deleted
    }

    #[cfg(test)]
    pub(crate) fn into_entries(self) -> VecDeque<Handle> {
        self.entries
    }
}

impl fmt::Debug for DeletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeletionQueue")
            .field("pending", &self.len())
            .finish()
    }
}
