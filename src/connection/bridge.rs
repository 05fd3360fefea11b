//! Synchronous callback bridge between engine I/O and host code.
//!
//! The engine pulls bytes from sources and pushes bytes to targets with a
//! blocking, C-style calling convention: handlers return an `i64` where `-1`
//! means failure and, for reads, `0` means end of stream. Host code plugs in
//! through the [`ByteSource`] and [`ByteSink`] traits. [`CallbackSource`] and
//! [`CallbackSink`] implement them from closure slots.
//!
//! Every payload is copied across the bridge, and every value the host hands
//! back is checked against the buffer it refers to before anything is copied.
//! Host errors and host panics never escape a handler: they are stored on the
//! bridge, the handler returns `-1`, and the I/O layer re-raises the stored
//! error as a [`ConnectionError`].

use super::ConnectionError;
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;

/// Origin of a seek, with the native numbering (`0`, `1`, `2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl Whence {
    pub fn from_native(value: i32) -> Option<Self> {
        match value {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }

    /// Split a `SeekFrom` into a signed offset and an origin.
    ///
    /// Offsets from the start above `i64::MAX` cannot be expressed natively.
    pub fn split(pos: io::SeekFrom) -> Result<(i64, Whence), ConnectionError> {
        match pos {
            io::SeekFrom::Start(n) => i64::try_from(n)
                .map(|n| (n, Whence::Set))
                .map_err(|_| ConnectionError::Callback(format!("seek offset {n} out of range"))),
            io::SeekFrom::Current(n) => Ok((n, Whence::Cur)),
            io::SeekFrom::End(n) => Ok((n, Whence::End)),
        }
    }
}

/// Failure reported by host code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("no {0} callback set")]
    Missing(&'static str),
    #[error("{0}")]
    Failed(String),
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        CallbackError::Failed(message)
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        CallbackError::Failed(message.to_string())
    }
}

impl From<io::Error> for CallbackError {
    fn from(e: io::Error) -> Self {
        CallbackError::Failed(e.to_string())
    }
}

pub type CallbackResult<T> = Result<T, CallbackError>;

/// Host side of a readable stream.
pub trait ByteSource: Send {
    /// Return up to `length` bytes. `None` or an empty buffer is end of
    /// stream; fewer bytes than requested is not.
    fn read(&mut self, length: usize) -> CallbackResult<Option<Vec<u8>>>;

    /// Reposition and return the new absolute offset.
    fn seek(&mut self, _offset: i64, _whence: Whence) -> CallbackResult<u64> {
        Err(CallbackError::Missing("seek"))
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

/// Host side of a writable stream.
pub trait ByteSink: Send {
    /// Consume bytes and return how many were taken.
    fn write(&mut self, data: &[u8]) -> CallbackResult<usize>;

    /// Read back previously written bytes. Only needed by formats that
    /// patch their output.
    fn read(&mut self, _length: usize) -> CallbackResult<Option<Vec<u8>>> {
        Err(CallbackError::Missing("read"))
    }

    fn seek(&mut self, _offset: i64, _whence: Whence) -> CallbackResult<u64> {
        Err(CallbackError::Missing("seek"))
    }

    /// Called exactly once when the target is finalized.
    fn end(&mut self) -> CallbackResult<()> {
        Ok(())
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn is_readable(&self) -> bool {
        false
    }
}

type ReadFn = Box<dyn FnMut(usize) -> CallbackResult<Option<Vec<u8>>> + Send>;
type SeekFn = Box<dyn FnMut(i64, Whence) -> CallbackResult<u64> + Send>;
type WriteFn = Box<dyn FnMut(&[u8]) -> CallbackResult<usize> + Send>;
type EndFn = Box<dyn FnMut() -> CallbackResult<()> + Send>;

/// [`ByteSource`] assembled from optional closures.
///
/// Without `on_seek` the source is unseekable and the engine reads it
/// sequentially.
#[derive(Default)]
pub struct CallbackSource {
    pub on_read: Option<ReadFn>,
    pub on_seek: Option<SeekFn>,
}

impl ByteSource for CallbackSource {
    fn read(&mut self, length: usize) -> CallbackResult<Option<Vec<u8>>> {
        match self.on_read.as_mut() {
            Some(f) => f(length),
            None => Err(CallbackError::Missing("read")),
        }
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> CallbackResult<u64> {
        match self.on_seek.as_mut() {
            Some(f) => f(offset, whence),
            None => Err(CallbackError::Missing("seek")),
        }
    }

    fn is_seekable(&self) -> bool {
        self.on_seek.is_some()
    }
}

impl fmt::Debug for CallbackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSource")
            .field("on_read", &self.on_read.is_some())
            .field("on_seek", &self.on_seek.is_some())
            .finish()
    }
}

/// [`ByteSink`] assembled from optional closures.
#[derive(Default)]
pub struct CallbackSink {
    pub on_write: Option<WriteFn>,
    pub on_read: Option<ReadFn>,
    pub on_seek: Option<SeekFn>,
    pub on_end: Option<EndFn>,
}

impl ByteSink for CallbackSink {
    fn write(&mut self, data: &[u8]) -> CallbackResult<usize> {
        match self.on_write.as_mut() {
            Some(f) => f(data),
            None => Err(CallbackError::Missing("write")),
        }
    }

    fn read(&mut self, length: usize) -> CallbackResult<Option<Vec<u8>>> {
        match self.on_read.as_mut() {
            Some(f) => f(length),
            None => Err(CallbackError::Missing("read")),
        }
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> CallbackResult<u64> {
        match self.on_seek.as_mut() {
            Some(f) => f(offset, whence),
            None => Err(CallbackError::Missing("seek")),
        }
    }

    fn end(&mut self) -> CallbackResult<()> {
        match self.on_end.as_mut() {
            Some(f) => f(),
            None => Ok(()),
        }
    }

    fn is_seekable(&self) -> bool {
        self.on_seek.is_some()
    }

    fn is_readable(&self) -> bool {
        self.on_read.is_some()
    }
}

impl fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSink")
            .field("on_write", &self.on_write.is_some())
            .field("on_read", &self.on_read.is_some())
            .field("on_seek", &self.on_seek.is_some())
            .field("on_end", &self.on_end.is_some())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("callback panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("callback panicked: {s}")
    } else {
        "callback panicked".to_string()
    }
}

/// Run host code, turning a panic into a callback error.
pub(crate) fn guarded<T>(f: impl FnOnce() -> CallbackResult<T>) -> CallbackResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(CallbackError::Failed(panic_message(payload))),
    }
}

fn stored(error: CallbackError) -> ConnectionError {
    match error {
        CallbackError::Missing(name) => ConnectionError::MissingCallback(name),
        CallbackError::Failed(message) => ConnectionError::Callback(message),
    }
}

/// Copy a host read result into `buffer`, validating its length.
fn copy_read(
    result: CallbackResult<Option<Vec<u8>>>,
    buffer: &mut [u8],
) -> CallbackResult<i64> {
    match result? {
        None => Ok(0),
        Some(bytes) if bytes.len() > buffer.len() => Err(CallbackError::Failed(format!(
            "read callback returned {} bytes for a {} byte request",
            bytes.len(),
            buffer.len()
        ))),
        Some(bytes) => {
            buffer[..bytes.len()].copy_from_slice(&bytes);
            Ok(bytes.len() as i64)
        }
    }
}

fn check_seek(result: CallbackResult<u64>) -> CallbackResult<i64> {
    let pos = result?;
    i64::try_from(pos)
        .map_err(|_| CallbackError::Failed(format!("seek callback returned {pos}, past i64::MAX")))
}

/// Native-convention handlers over a [`ByteSource`].
pub struct SourceBridge<'a> {
    source: &'a mut dyn ByteSource,
    last_error: Option<CallbackError>,
}

impl<'a> SourceBridge<'a> {
    pub fn new(source: &'a mut dyn ByteSource) -> Self {
        Self {
            source,
            last_error: None,
        }
    }

    fn fail(&mut self, error: CallbackError) -> i64 {
        tracing::debug!("Source callback failed: {error}");
        self.last_error = Some(error);
        -1
    }

    /// Fill `buffer` from the host. Returns bytes copied, `0` at end of
    /// stream, `-1` on failure.
    pub fn read_handler(&mut self, buffer: &mut [u8]) -> i64 {
        if buffer.is_empty() {
            return 0;
        }
        tracing::trace!("source read({})", buffer.len());
        let length = buffer.len();
        let source = &mut *self.source;
        match guarded(|| copy_read(source.read(length), buffer)) {
            Ok(n) => n,
            Err(e) => self.fail(e),
        }
    }

    /// Returns the new absolute position or `-1`.
    pub fn seek_handler(&mut self, offset: i64, whence: i32) -> i64 {
        tracing::trace!("source seek({offset}, {whence})");
        let Some(whence) = Whence::from_native(whence) else {
            return self.fail(CallbackError::Failed(format!("invalid whence {whence}")));
        };
        let source = &mut *self.source;
        match guarded(|| check_seek(source.seek(offset, whence))) {
            Ok(pos) => pos,
            Err(e) => self.fail(e),
        }
    }

    /// The error behind the most recent `-1`.
    pub fn take_error(&mut self) -> ConnectionError {
        self.last_error
            .take()
            .map(stored)
            .unwrap_or_else(|| ConnectionError::Callback("unknown callback failure".into()))
    }

    /// `read_handler` with the result turned back into `io::Result`.
    pub fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.read_handler(buffer) {
            n if n >= 0 => Ok(n as usize),
            _ => Err(self.take_error().into()),
        }
    }

    pub fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (offset, whence) = Whence::split(pos)?;
        match self.seek_handler(offset, whence as i32) {
            n if n >= 0 => Ok(n as u64),
            _ => Err(self.take_error().into()),
        }
    }
}

/// Native-convention handlers over a [`ByteSink`].
pub struct TargetBridge<'a> {
    sink: &'a mut dyn ByteSink,
    last_error: Option<CallbackError>,
}

impl<'a> TargetBridge<'a> {
    pub fn new(sink: &'a mut dyn ByteSink) -> Self {
        Self {
            sink,
            last_error: None,
        }
    }

    fn fail(&mut self, error: CallbackError) -> i64 {
        tracing::debug!("Target callback failed: {error}");
        self.last_error = Some(error);
        -1
    }

    /// Hand a copy of `data` to the host. Returns bytes taken or `-1`.
    pub fn write_handler(&mut self, data: &[u8]) -> i64 {
        tracing::trace!("target write({})", data.len());
        let sink = &mut *self.sink;
        let offered = data.len();
        let result = guarded(|| {
            let taken = sink.write(data)?;
            if taken > offered {
                return Err(CallbackError::Failed(format!(
                    "write callback reported {taken} bytes for a {offered} byte buffer"
                )));
            }
            Ok(taken as i64)
        });
        match result {
            Ok(n) => n,
            Err(e) => self.fail(e),
        }
    }

    pub fn read_handler(&mut self, buffer: &mut [u8]) -> i64 {
        if buffer.is_empty() {
            return 0;
        }
        tracing::trace!("target read({})", buffer.len());
        let length = buffer.len();
        let sink = &mut *self.sink;
        match guarded(|| copy_read(sink.read(length), buffer)) {
            Ok(n) => n,
            Err(e) => self.fail(e),
        }
    }

    pub fn seek_handler(&mut self, offset: i64, whence: i32) -> i64 {
        tracing::trace!("target seek({offset}, {whence})");
        let Some(whence) = Whence::from_native(whence) else {
            return self.fail(CallbackError::Failed(format!("invalid whence {whence}")));
        };
        let sink = &mut *self.sink;
        match guarded(|| check_seek(sink.seek(offset, whence))) {
            Ok(pos) => pos,
            Err(e) => self.fail(e),
        }
    }

    /// Returns `0` on success, `-1` on failure.
    pub fn end_handler(&mut self) -> i32 {
        tracing::trace!("target end");
        let sink = &mut *self.sink;
        match guarded(|| sink.end()) {
            Ok(()) => 0,
            Err(e) => {
                self.fail(e);
                -1
            }
        }
    }

    pub fn take_error(&mut self) -> ConnectionError {
        self.last_error
            .take()
            .map(stored)
            .unwrap_or_else(|| ConnectionError::Callback("unknown callback failure".into()))
    }

    /// Write all of `data`, failing on a short write.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        match self.write_handler(data) {
            n if n < 0 => Err(self.take_error()),
            n if (n as usize) < data.len() => Err(ConnectionError::ShortWrite {
                written: n as usize,
                expected: data.len(),
            }),
            _ => Ok(()),
        }
    }

    pub fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.read_handler(buffer) {
            n if n >= 0 => Ok(n as usize),
            _ => Err(self.take_error().into()),
        }
    }

    pub fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (offset, whence) = Whence::split(pos)?;
        match self.seek_handler(offset, whence as i32) {
            n if n >= 0 => Ok(n as u64),
            _ => Err(self.take_error().into()),
        }
    }

    pub fn end(&mut self) -> Result<(), ConnectionError> {
        match self.end_handler() {
            0 => Ok(()),
            _ => Err(self.take_error()),
        }
    }
}
