//! Connections: byte streams between the engine and the outside world.
//!
//! A [`Source`] is something the engine reads an image from, a [`Target`] is
//! something it writes an encoded image to. Each is backed by a file, by
//! memory, or by host callbacks ([`SourceCustom`], [`TargetCustom`]).
//!
//! ```text
//!   Image::new_from_source ──▶ NativeSource ──▶ File | Memory | SourceBridge ──▶ host
//!   Image::write_to_target ──▶ NativeTarget ──▶ File | Memory | TargetBridge ──▶ host
//! ```
//!
//! Custom connections start with empty callback slots, or wrap a host type
//! implementing [`ByteSource`] or [`ByteSink`]. A custom source needs
//! `on_read`; without `on_seek` it is read sequentially through a replay
//! buffer. A custom target needs `on_write`; `on_end` is called exactly once
//! when the target is finalized, whether the write succeeded or not.
//!
//! Callbacks run while the engine holds the connection, so they must not call
//! back into the connection that invoked them.

pub mod bridge;
pub(crate) mod native;
mod replay;

pub use bridge::{
    ByteSink, ByteSource, CallbackError, CallbackResult, CallbackSink, CallbackSource, Whence,
};
pub(crate) use native::{HostSink, HostSource, NativeSource, NativeTarget};

use crate::handle::{Handle, HandleError, handle_type};
use crate::session::{Resource, Session};
use parking_lot::Mutex;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error("Callback failed: {0}")]
    Callback(String),
    #[error("no {0} callback set")]
    MissingCallback(&'static str),
    #[error("Short write: {written} of {expected} bytes accepted")]
    ShortWrite { written: usize, expected: usize },
    #[error("Connection is not seekable")]
    Unseekable,
    #[error("Connection {nick} is closed")]
    Closed { nick: String },
    #[error("Connection {nick} is not a memory target")]
    NotMemory { nick: String },
}

impl ConnectionError {
    /// Recover a connection error that travelled through `std::io`.
    pub(crate) fn from_io(e: io::Error) -> Self {
        if !e.get_ref().is_some_and(|inner| inner.is::<ConnectionError>()) {
            return ConnectionError::Io(e);
        }
        let kind = e.kind();
        match e.into_inner().map(|inner| inner.downcast::<ConnectionError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => ConnectionError::Io(io::Error::new(kind, other)),
            None => ConnectionError::Io(io::Error::from(kind)),
        }
    }
}

impl From<ConnectionError> for io::Error {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

handle_type! {
    /// Handle to a readable connection.
    Source => Source
}

handle_type! {
    /// Handle to a writable connection.
    Target => Target
}

impl Source {
    /// Open `path` for reading.
    pub fn new_from_file(session: &Session, path: impl AsRef<Path>) -> Result<Self, ConnectionError> {
        let native = NativeSource::from_file(session.tracker(), path.as_ref())?;
        Ok(Self::from_native(session, native))
    }

    /// Read from a copy of `data`.
    pub fn new_from_memory(session: &Session, data: &[u8]) -> Self {
        let native = NativeSource::from_memory(session.tracker(), data);
        Self::from_native(session, native)
    }

    fn from_native(session: &Session, native: NativeSource) -> Self {
        let handle = session.insert(Resource::Source(Arc::new(Mutex::new(native))));
        Self::from_handle(handle)
    }

    pub(crate) fn native(&self) -> Result<Arc<Mutex<NativeSource>>, HandleError> {
        self.handle().session()?.source_of(self.handle())
    }

    /// Path of a file source, `None` for other sources.
    pub fn filename(&self) -> Result<Option<PathBuf>, ConnectionError> {
        Ok(self.native()?.lock().filename().map(Path::to_path_buf))
    }

    /// Diagnostic name of the connection.
    pub fn nick(&self) -> Result<String, ConnectionError> {
        Ok(self.native()?.lock().nick().to_string())
    }
}

impl Target {
    /// Create or truncate `path` for writing.
    pub fn new_to_file(session: &Session, path: impl AsRef<Path>) -> Result<Self, ConnectionError> {
        let native = NativeTarget::to_file(
            session.tracker(),
            path.as_ref(),
            session.config().io.target_buffer_size,
        )?;
        Ok(Self::from_native(session, native))
    }

    /// Collect output in memory; read it back with [`blob`](Self::blob).
    pub fn new_to_memory(session: &Session) -> Self {
        let native = NativeTarget::to_memory(session.tracker(), session.config().io.target_buffer_size);
        Self::from_native(session, native)
    }

    fn from_native(session: &Session, native: NativeTarget) -> Self {
        let handle = session.insert(Resource::Target(Arc::new(Mutex::new(native))));
        Self::from_handle(handle)
    }

    pub(crate) fn native(&self) -> Result<Arc<Mutex<NativeTarget>>, HandleError> {
        self.handle().session()?.target_of(self.handle())
    }

    /// Copy of the bytes written to a memory target.
    pub fn blob(&self) -> Result<Vec<u8>, ConnectionError> {
        self.native()?.lock().blob()
    }

    pub fn filename(&self) -> Result<Option<PathBuf>, ConnectionError> {
        Ok(self.native()?.lock().filename().map(Path::to_path_buf))
    }

    pub fn nick(&self) -> Result<String, ConnectionError> {
        Ok(self.native()?.lock().nick().to_string())
    }

    /// Finalize the target. Later calls do nothing.
    pub fn end(&self) -> Result<(), ConnectionError> {
        self.native()?.lock().end()
    }

    pub fn is_ended(&self) -> Result<bool, ConnectionError> {
        Ok(self.native()?.lock().is_ended())
    }
}

/// A [`Source`] whose bytes come from host callbacks.
pub struct SourceCustom {
    source: Source,
}

impl SourceCustom {
    pub fn new(session: &Session) -> Self {
        Self::with_host(session, HostSource::Slots(CallbackSource::default()))
    }

    /// A source that reads from `host`. Without a seekable host, reads go
    /// through the replay buffer like a closure source without `on_seek`.
    pub fn from_byte_source(session: &Session, host: impl ByteSource + 'static) -> Self {
        Self::with_host(session, HostSource::Boxed(Box::new(host)))
    }

    fn with_host(session: &Session, host: HostSource) -> Self {
        let native = NativeSource::custom(session.tracker(), host);
        Self {
            source: Source::from_native(session, native),
        }
    }

    fn with_slots(&self, f: impl FnOnce(&mut CallbackSource)) -> Result<&Self, ConnectionError> {
        let native = self.source.native()?;
        let mut guard = native.lock();
        match guard.callbacks_mut() {
            Some(slots) => f(slots),
            None => tracing::warn!("callback ignored: source is backed by a host type"),
        }
        Ok(self)
    }

    /// Set the read callback: return up to `length` bytes, or `None` or an
    /// empty buffer at end of stream.
    pub fn on_read<F>(&self, f: F) -> Result<&Self, ConnectionError>
    where
        F: FnMut(usize) -> CallbackResult<Option<Vec<u8>>> + Send + 'static,
    {
        self.with_slots(|slots| slots.on_read = Some(Box::new(f)))
    }

    /// Set the seek callback: return the new absolute position.
    pub fn on_seek<F>(&self, f: F) -> Result<&Self, ConnectionError>
    where
        F: FnMut(i64, Whence) -> CallbackResult<u64> + Send + 'static,
    {
        self.with_slots(|slots| slots.on_seek = Some(Box::new(f)))
    }

    pub fn try_clone(&self) -> Result<Self, HandleError> {
        Ok(Self {
            source: self.source.try_clone()?,
        })
    }

    pub fn source(&self) -> &Source {
        &self.source
    }
}

impl Deref for SourceCustom {
    type Target = Source;

    fn deref(&self) -> &Source {
        &self.source
    }
}

impl AsRef<Handle> for SourceCustom {
    fn as_ref(&self) -> &Handle {
        self.source.handle()
    }
}

impl std::fmt::Debug for SourceCustom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SourceCustom").field(&self.source).finish()
    }
}

/// A [`Target`] whose bytes go to host callbacks.
pub struct TargetCustom {
    target: Target,
}

impl TargetCustom {
    pub fn new(session: &Session) -> Self {
        Self::with_host(session, HostSink::Slots(CallbackSink::default()))
    }

    /// A target that writes to `host`. Its `end` is called once, like
    /// `on_end`.
    pub fn from_byte_sink(session: &Session, host: impl ByteSink + 'static) -> Self {
        Self::with_host(session, HostSink::Boxed(Box::new(host)))
    }

    fn with_host(session: &Session, host: HostSink) -> Self {
        let native = NativeTarget::custom(host, session.config().io.target_buffer_size);
        Self {
            target: Target::from_native(session, native),
        }
    }

    fn with_slots(&self, f: impl FnOnce(&mut CallbackSink)) -> Result<&Self, ConnectionError> {
        let native = self.target.native()?;
        let mut guard = native.lock();
        match guard.callbacks_mut() {
            Some(slots) => f(slots),
            None => tracing::warn!("callback ignored: target is backed by a host type"),
        }
        Ok(self)
    }

    /// Set the write callback: consume the bytes and return how many were
    /// taken. Taking fewer than offered fails the write.
    pub fn on_write<F>(&self, f: F) -> Result<&Self, ConnectionError>
    where
        F: FnMut(&[u8]) -> CallbackResult<usize> + Send + 'static,
    {
        self.with_slots(|slots| slots.on_write = Some(Box::new(f)))
    }

    pub fn on_read<F>(&self, f: F) -> Result<&Self, ConnectionError>
    where
        F: FnMut(usize) -> CallbackResult<Option<Vec<u8>>> + Send + 'static,
    {
        self.with_slots(|slots| slots.on_read = Some(Box::new(f)))
    }

    pub fn on_seek<F>(&self, f: F) -> Result<&Self, ConnectionError>
    where
        F: FnMut(i64, Whence) -> CallbackResult<u64> + Send + 'static,
    {
        self.with_slots(|slots| slots.on_seek = Some(Box::new(f)))
    }

    /// Set the end hook, called once when the target is finalized.
    pub fn on_end<F>(&self, f: F) -> Result<&Self, ConnectionError>
    where
        F: FnMut() -> CallbackResult<()> + Send + 'static,
    {
        self.with_slots(|slots| slots.on_end = Some(Box::new(f)))
    }

    pub fn try_clone(&self) -> Result<Self, HandleError> {
        Ok(Self {
            target: self.target.try_clone()?,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl Deref for TargetCustom {
    type Target = Target;

    fn deref(&self) -> &Target {
        &self.target
    }
}

impl AsRef<Handle> for TargetCustom {
    fn as_ref(&self) -> &Handle {
        self.target.handle()
    }
}

impl std::fmt::Debug for TargetCustom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TargetCustom").field(&self.target).finish()
    }
}
