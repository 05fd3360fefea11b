//! # imgbridge
//!
//! Handle lifetimes and host I/O callbacks for a native image engine.
//!
//! Host code never touches engine objects directly. It holds [`Handle`]s:
//! typed references into a [`Session`]'s resource table that must be deleted
//! explicitly, either right away or through the session's deletion queue.
//! Bytes move between host and engine through connections, which can be
//! backed by files, memory or host callbacks.
//!
//! ```text
//!   host ──Handle──▶ Session ──▶ ResourceTable ──▶ NativeImage | NativeSource | NativeTarget
//!                       │
//!                       ├──▶ OperationCache  (claims objects, LRU by count, memory, files)
//!                       ├──▶ DeletionQueue   (delete_later, auto-delete, FIFO flush)
//!                       └──▶ Tracker         (allocations, memory, open files)
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`handle`] | Handle lifecycle: delete, delete_later, clone, alias checks, auto-delete opt-out |
//! | [`session`] | Owns the resource table, deletion queue, operation cache and worker pool |
//! | [`connection`] | Sources and targets, including host-callback connections and the byte bridge |
//! | [`engine`] | The `Image` handle: loaders, a few pixel operations, savers |
//! | [`cache`] | Operation cache keyed by a digest of operation name and arguments |
//! | [`stats`] | Allocation, memory and open-file accounting |
//! | [`config`] | `imgbridge.toml` loading, validation and merging over stock defaults |
//! | [`diagnostics`] | Version strings, JSON configuration summary, temp file names |
//!
//! # Design Decisions
//!
//! ## Claims, Not Ownership
//!
//! Every handle owns one claim on its native object and the operation cache
//! may hold another. The object is released when the last claim goes. Cache
//! eviction therefore never invalidates a handle, and deleting a handle never
//! breaks a cached result that another handle still refers to.
//!
//! ## Deletion Is Explicit
//!
//! A handle is deleted with [`Handle::delete`] or queued with
//! [`Handle::delete_later`]. Dropping a handle without deleting it still
//! releases its claim, but this is logged as a leak. In auto-delete mode every
//! new handle is queued on creation and [`Session::flush_deletion_queue`]
//! releases them in FIFO order.
//!
//! ## Callbacks Never Unwind Into The Engine
//!
//! Host callbacks run behind [`connection::bridge`], which converts errors and
//! panics into the `-1` status the engine expects and keeps the message for the
//! caller. A custom target's end hook runs exactly once, whatever happened
//! during the write.

pub mod cache;
pub mod config;
pub mod handle;
pub mod connection;
pub mod engine;
pub mod session;
pub mod stats;
pub mod diagnostics;

pub use connection::{ConnectionError, Source, SourceCustom, Target, TargetCustom};
pub use engine::{EngineError, Image};
pub use handle::{DeletionQueue, Handle, HandleError, ResourceId, ResourceKind};
pub use session::{Session, SessionError};

#[cfg(test)]
pub(crate) mod test_helpers;
