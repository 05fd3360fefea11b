//! Handles: host-side references to native objects.
//!
//! A [`Handle`] refers to exactly one object in the session's
//! [`ResourceTable`](table::ResourceTable) and owns one claim on it. The
//! object stays alive while any claim remains, whether held by a handle or by
//! the operation cache.
//!
//! ```text
//!   Live ──delete_later──▶ Live + queued ──flush──▶ Deleted
//!     │                                                ▲
//!     └──────────────────────delete────────────────────┘
//! ```
//!
//! `Deleted` is per handle. Two handles are aliases when they carry the same
//! [`ResourceId`]; deleting one leaves the other usable.
//!
//! Deletion is explicit. Dropping the last Rust reference to a handle that was
//! never deleted still releases its claim, but that path exists as a fallback
//! and is logged: callers that care about prompt release of files and memory
//! delete or queue their handles.

mod queue;
mod table;

pub use queue::DeletionQueue;
pub use table::ResourceId;
pub(crate) use table::ResourceTable;

use crate::session::{Session, SessionInner};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("{kind} instance already deleted")]
    AlreadyDeleted { kind: ResourceKind },
    #[error("Object already scheduled for deletion")]
    ScheduledForDeletion { kind: ResourceKind },
    #[error("Session has been dropped")]
    SessionClosed,
    #[error("Expected {expected} but handle refers to {found}")]
    WrongKind {
        expected: ResourceKind,
        found: ResourceKind,
    },
}

/// Which native object type a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image,
    Source,
    Target,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Image => "Image",
            ResourceKind::Source => "Source",
            ResourceKind::Target => "Target",
        })
    }
}

#[derive(Debug, Default)]
struct HandleState {
    deleted: bool,
    delete_scheduled: bool,
    auto_delete_prevented: bool,
}

struct HandleCell {
    id: ResourceId,
    kind: ResourceKind,
    session: Weak<SessionInner>,
    state: Mutex<HandleState>,
}

impl HandleCell {
    fn session(&self) -> Result<Arc<SessionInner>, HandleError> {
        self.session.upgrade().ok_or(HandleError::SessionClosed)
    }

    fn release_claim(&self) {
        if let Some(session) = self.session.upgrade() {
            session.release(self.id);
        }
    }
}

impl Drop for HandleCell {
    fn drop(&mut self) {
        if !self.state.get_mut().deleted {
            tracing::debug!(
                "{} handle {} dropped without delete, releasing",
                self.kind,
                self.id
            );
            self.release_claim();
        }
    }
}

/// A reference to one native object with explicit lifetime control.
///
/// `Handle` is deliberately not `Clone`: a second reference to the same
/// object is made with [`try_clone`](Self::try_clone), which takes a new
/// claim and has its own deleted state.
pub struct Handle {
    cell: Arc<HandleCell>,
}

impl Handle {
    /// Wrap a claim the caller already holds on `id`.
    pub(crate) fn adopt(session: &Arc<SessionInner>, id: ResourceId, kind: ResourceKind) -> Self {
        let handle = Handle {
            cell: Arc::new(HandleCell {
                id,
                kind,
                session: Arc::downgrade(session),
                state: Mutex::new(HandleState::default()),
            }),
        };
        if session.auto_delete() {
            handle.cell.state.lock().delete_scheduled = true;
            session.enqueue(handle.share());
        }
        handle
    }

    /// Second reference to this very handle, used by the deletion queue.
    pub(crate) fn share(&self) -> Handle {
        Handle {
            cell: Arc::clone(&self.cell),
        }
    }

    pub(crate) fn same_handle(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub fn id(&self) -> ResourceId {
        self.cell.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.cell.kind
    }

    /// The session that owns the referenced object.
    pub fn session(&self) -> Result<Session, HandleError> {
        self.cell.session().map(Session::from_inner)
    }

    /// The identity of a handle that has not been deleted.
    pub(crate) fn live_id(&self) -> Result<ResourceId, HandleError> {
        if self.cell.state.lock().deleted {
            return Err(HandleError::AlreadyDeleted { kind: self.kind() });
        }
        Ok(self.cell.id)
    }

    /// True iff both handles refer to the same native object, whether or not
    /// either has been deleted.
    pub fn is_alias_of(&self, other: &Handle) -> bool {
        self.cell.id == other.cell.id && self.cell.session.ptr_eq(&other.cell.session)
    }

    /// True once [`delete`](Self::delete) has completed on this handle.
    /// Aliases may still keep the object alive.
    pub fn is_deleted(&self) -> bool {
        self.cell.state.lock().deleted
    }

    pub fn is_delete_scheduled(&self) -> bool {
        self.cell.state.lock().delete_scheduled
    }

    pub fn is_auto_delete_prevented(&self) -> bool {
        self.cell.state.lock().auto_delete_prevented
    }

    /// Release this handle's claim on the native object.
    ///
    /// Deleting twice, or deleting a handle that is queued for deletion, is
    /// an error and leaves the object untouched.
    pub fn delete(&self) -> Result<(), HandleError> {
        self.mark_deleted(false)?;
        self.cell.release_claim();
        Ok(())
    }

    /// Delete on behalf of the deletion queue.
    pub(crate) fn delete_scheduled(&self) -> Result<(), HandleError> {
        self.mark_deleted(true)?;
        self.cell.release_claim();
        Ok(())
    }

    fn mark_deleted(&self, from_queue: bool) -> Result<(), HandleError> {
        let mut state = self.cell.state.lock();
        if from_queue {
            state.delete_scheduled = false;
        }
        if state.deleted {
            return Err(HandleError::AlreadyDeleted { kind: self.kind() });
        }
        if state.delete_scheduled {
            return Err(HandleError::ScheduledForDeletion { kind: self.kind() });
        }
        state.deleted = true;
        Ok(())
    }

    /// Queue this handle on its session's deletion queue.
    ///
    /// Nothing is released until the queue is flushed.
    pub fn delete_later(&self) -> Result<&Self, HandleError> {
        let session = self.cell.session()?;
        {
            let mut state = self.cell.state.lock();
            if state.deleted {
                return Err(HandleError::AlreadyDeleted { kind: self.kind() });
            }
            if state.delete_scheduled {
                return Err(HandleError::ScheduledForDeletion { kind: self.kind() });
            }
            state.delete_scheduled = true;
        }
        session.enqueue(self.share());
        Ok(self)
    }

    /// Take this handle off the deletion queue and keep it off.
    pub fn prevent_auto_delete(&self) -> &Self {
        if let Ok(session) = self.cell.session() {
            session.dequeue(self);
        }
        let mut state = self.cell.state.lock();
        state.delete_scheduled = false;
        state.auto_delete_prevented = true;
        drop(state);
        self
    }

    /// New handle aliasing the same native object, with its own deleted and
    /// auto-delete state.
    pub fn try_clone(&self) -> Result<Handle, HandleError> {
        {
            let state = self.cell.state.lock();
            if state.deleted {
                return Err(HandleError::AlreadyDeleted { kind: self.kind() });
            }
            if state.delete_scheduled {
                return Err(HandleError::ScheduledForDeletion { kind: self.kind() });
            }
        }
        let session = self.cell.session()?;
        if !session.retain(self.cell.id) {
            return Err(HandleError::AlreadyDeleted { kind: self.kind() });
        }
        Ok(Handle::adopt(&session, self.cell.id, self.cell.kind))
    }
}

impl AsRef<Handle> for Handle {
    fn as_ref(&self) -> &Handle {
        self
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.cell.state.lock();
        f.debug_struct("Handle")
            .field("kind", &self.cell.kind)
            .field("id", &self.cell.id)
            .field("deleted", &state.deleted)
            .field("delete_scheduled", &state.delete_scheduled)
            .finish()
    }
}

/// Declare a typed handle wrapper around [`Handle`].
///
/// The wrapper derefs to `Handle` for the lifetime surface and re-declares the
/// chaining methods so they return the wrapper type.
macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident => $kind:ident) => {
        $(#[$meta])*
        pub struct $name {
            handle: $crate::handle::Handle,
        }

        impl $name {
            pub(crate) fn from_handle(handle: $crate::handle::Handle) -> Self {
                debug_assert_eq!(handle.kind(), $crate::handle::ResourceKind::$kind);
                Self { handle }
            }

            pub fn handle(&self) -> &$crate::handle::Handle {
                &self.handle
            }

            /// New handle aliasing the same native object.
            pub fn try_clone(&self) -> Result<Self, $crate::handle::HandleError> {
                self.handle.try_clone().map(Self::from_handle)
            }

            pub fn delete_later(&self) -> Result<&Self, $crate::handle::HandleError> {
                self.handle.delete_later()?;
                Ok(self)
            }

            pub fn prevent_auto_delete(&self) -> &Self {
                self.handle.prevent_auto_delete();
                self
            }
        }

        impl std::ops::Deref for $name {
            type Target = $crate::handle::Handle;

            fn deref(&self) -> &Self::Target {
                &self.handle
            }
        }

        impl AsRef<$crate::handle::Handle> for $name {
            fn as_ref(&self) -> &$crate::handle::Handle {
                &self.handle
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", &self.handle.id())
                    .field("deleted", &self.handle.is_deleted())
                    .finish()
            }
        }
    };
}

pub(crate) use handle_type;
