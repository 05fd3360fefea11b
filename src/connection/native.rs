//! Native connection state held in the session's resource table.
//!
//! Handles never touch these directly: every operation locks the connection's
//! mutex for its whole duration, so one connection sees strictly sequential
//! reads, writes, seeks and its final `end`.

use super::ConnectionError;
use super::bridge::{ByteSink, ByteSource, CallbackSink, CallbackSource, SourceBridge, TargetBridge};
use super::replay::Replay;
use crate::stats::{TrackedFile, TrackedMemory, Tracker};
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) const MEMORY_NICK: &str = "memory";
pub(crate) const SOURCE_CUSTOM_NICK: &str = "source_custom";
pub(crate) const TARGET_CUSTOM_NICK: &str = "target_custom";

// =============================================================================
// Host ends
// =============================================================================

/// The host side of a custom source: closure slots, or a host type.
pub(crate) enum HostSource {
    Slots(CallbackSource),
    Boxed(Box<dyn ByteSource>),
}

impl HostSource {
    fn get(&mut self) -> &mut dyn ByteSource {
        match self {
            HostSource::Slots(slots) => slots,
            HostSource::Boxed(source) => source.as_mut(),
        }
    }

    fn is_seekable(&self) -> bool {
        match self {
            HostSource::Slots(slots) => slots.is_seekable(),
            HostSource::Boxed(source) => source.is_seekable(),
        }
    }
}

/// The host side of a custom target.
pub(crate) enum HostSink {
    Slots(CallbackSink),
    Boxed(Box<dyn ByteSink>),
}

impl HostSink {
    fn get(&mut self) -> &mut dyn ByteSink {
        match self {
            HostSink::Slots(slots) => slots,
            HostSink::Boxed(sink) => sink.as_mut(),
        }
    }

    fn is_seekable(&self) -> bool {
        match self {
            HostSink::Slots(slots) => slots.is_seekable(),
            HostSink::Boxed(sink) => sink.is_seekable(),
        }
    }

    fn is_readable(&self) -> bool {
        match self {
            HostSink::Slots(slots) => slots.is_readable(),
            HostSink::Boxed(sink) => sink.is_readable(),
        }
    }
}

// =============================================================================
// Sources
// =============================================================================

enum SourceBackend {
    File {
        file: File,
        _tracked: TrackedFile,
    },
    Memory {
        data: Cursor<Vec<u8>>,
        _tracked: TrackedMemory,
    },
    Custom {
        callbacks: HostSource,
        replay: Replay,
        tracked: TrackedMemory,
    },
}

/// Readable end of a connection.
pub(crate) struct NativeSource {
    backend: SourceBackend,
    filename: Option<PathBuf>,
    nick: String,
}

/// Upstream reader for the replay buffer.
struct Upstream<'a>(SourceBridge<'a>);

impl Read for Upstream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl NativeSource {
    pub fn from_file(tracker: &Arc<Tracker>, path: &Path) -> Result<Self, ConnectionError> {
        let file = File::open(path)?;
        Ok(Self {
            backend: SourceBackend::File {
                file,
                _tracked: TrackedFile::new(tracker),
            },
            filename: Some(path.to_path_buf()),
            nick: path.display().to_string(),
        })
    }

    /// The bytes are copied.
    pub fn from_memory(tracker: &Arc<Tracker>, data: &[u8]) -> Self {
        let data = data.to_vec();
        let tracked = TrackedMemory::new(tracker, data.len() as u64);
        Self {
            backend: SourceBackend::Memory {
                data: Cursor::new(data),
                _tracked: tracked,
            },
            filename: None,
            nick: MEMORY_NICK.to_string(),
        }
    }

    pub fn custom(tracker: &Arc<Tracker>, host: HostSource) -> Self {
        Self {
            backend: SourceBackend::Custom {
                callbacks: host,
                replay: Replay::new(),
                tracked: TrackedMemory::new(tracker, 0),
            },
            filename: None,
            nick: SOURCE_CUSTOM_NICK.to_string(),
        }
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Callback slots of a custom source built from closures.
    pub fn callbacks_mut(&mut self) -> Option<&mut CallbackSource> {
        match &mut self.backend {
            SourceBackend::Custom {
                callbacks: HostSource::Slots(slots),
                ..
            } => Some(slots),
            _ => None,
        }
    }
}

impl Read for NativeSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.backend {
            SourceBackend::File { file, .. } => file.read(buf),
            SourceBackend::Memory { data, .. } => data.read(buf),
            SourceBackend::Custom {
                callbacks,
                replay,
                tracked,
            } => {
                if callbacks.is_seekable() {
                    return SourceBridge::new(callbacks.get()).read(buf);
                }
                let mut upstream = Upstream(SourceBridge::new(callbacks.get()));
                let n = replay.read(&mut upstream, buf)?;
                tracked.set(replay.retained() as u64);
                Ok(n)
            }
        }
    }
}

impl Seek for NativeSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.backend {
            SourceBackend::File { file, .. } => file.seek(pos),
            SourceBackend::Memory { data, .. } => data.seek(pos),
            SourceBackend::Custom {
                callbacks,
                replay,
                tracked,
            } => {
                if callbacks.is_seekable() {
                    return SourceBridge::new(callbacks.get()).seek(pos);
                }
                let mut upstream = Upstream(SourceBridge::new(callbacks.get()));
                let at = replay.seek(&mut upstream, pos)?;
                tracked.set(replay.retained() as u64);
                Ok(at)
            }
        }
    }
}

// =============================================================================
// Targets
// =============================================================================

enum TargetBackend {
    File {
        file: Option<(File, TrackedFile)>,
    },
    Memory {
        data: Cursor<Vec<u8>>,
        tracked: TrackedMemory,
    },
    Custom {
        callbacks: HostSink,
    },
}

/// Writable end of a connection.
///
/// Writes are collected in a pending buffer and handed to the backend in
/// blocks of `buffer_size` bytes. The buffer is flushed before any seek or
/// read and when the target ends.
pub(crate) struct NativeTarget {
    backend: TargetBackend,
    pending: Vec<u8>,
    buffer_size: usize,
    ended: bool,
    filename: Option<PathBuf>,
    nick: String,
}

impl NativeTarget {
    fn with_backend(backend: TargetBackend, buffer_size: usize) -> Self {
        Self {
            backend,
            pending: Vec::with_capacity(buffer_size),
            buffer_size,
            ended: false,
            filename: None,
            nick: String::new(),
        }
    }

    /// Creates or truncates `path`.
    pub fn to_file(
        tracker: &Arc<Tracker>,
        path: &Path,
        buffer_size: usize,
    ) -> Result<Self, ConnectionError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut target = Self::with_backend(
            TargetBackend::File {
                file: Some((file, TrackedFile::new(tracker))),
            },
            buffer_size,
        );
        target.filename = Some(path.to_path_buf());
        target.nick = path.display().to_string();
        Ok(target)
    }

    pub fn to_memory(tracker: &Arc<Tracker>, buffer_size: usize) -> Self {
        let mut target = Self::with_backend(
            TargetBackend::Memory {
                data: Cursor::new(Vec::new()),
                tracked: TrackedMemory::new(tracker, 0),
            },
            buffer_size,
        );
        target.nick = MEMORY_NICK.to_string();
        target
    }

    pub fn custom(host: HostSink, buffer_size: usize) -> Self {
        let mut target = Self::with_backend(
            TargetBackend::Custom { callbacks: host },
            buffer_size,
        );
        target.nick = TARGET_CUSTOM_NICK.to_string();
        target
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn callbacks_mut(&mut self) -> Option<&mut CallbackSink> {
        match &mut self.backend {
            TargetBackend::Custom {
                callbacks: HostSink::Slots(slots),
            } => Some(slots),
            _ => None,
        }
    }

    pub fn is_seekable(&self) -> bool {
        match &self.backend {
            TargetBackend::Custom { callbacks } => callbacks.is_seekable(),
            _ => true,
        }
    }

    fn check_open(&self) -> Result<(), ConnectionError> {
        if self.ended {
            return Err(ConnectionError::Closed {
                nick: self.nick.clone(),
            });
        }
        Ok(())
    }

    /// Copy of everything written to a memory target.
    pub fn blob(&mut self) -> Result<Vec<u8>, ConnectionError> {
        if !self.ended {
            self.flush_pending()?;
        }
        match &self.backend {
            TargetBackend::Memory { data, .. } => Ok(data.get_ref().clone()),
            _ => Err(ConnectionError::NotMemory {
                nick: self.nick.clone(),
            }),
        }
    }

    /// Hand the pending buffer to the backend.
    fn flush_pending(&mut self) -> Result<(), ConnectionError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let result = match &mut self.backend {
            TargetBackend::File { file: Some((file, _)) } => {
                file.write_all(&pending).map_err(ConnectionError::from)
            }
            TargetBackend::File { file: None } => Err(ConnectionError::Closed {
                nick: self.nick.clone(),
            }),
            TargetBackend::Memory { data, tracked } => {
                let r = data.write_all(&pending).map_err(ConnectionError::from);
                tracked.set(data.get_ref().len() as u64);
                r
            }
            TargetBackend::Custom { callbacks } => {
                TargetBridge::new(callbacks.get()).write_all(&pending)
            }
        };
        self.pending = pending;
        self.pending.clear();
        result
    }

    /// Finalize the target: flush, then close the file or call the end hook.
    ///
    /// Runs at most once. The end hook is called even when the final flush
    /// fails; the first error is returned.
    pub fn end(&mut self) -> Result<(), ConnectionError> {
        if self.ended {
            return Ok(());
        }
        let flushed = self.flush_pending();
        self.ended = true;
        let finished = match &mut self.backend {
            TargetBackend::File { file } => match file.take() {
                Some((mut f, tracked)) => {
                    let r = f.flush().map_err(ConnectionError::from);
                    drop(f);
                    drop(tracked);
                    r
                }
                None => Ok(()),
            },
            TargetBackend::Memory { .. } => Ok(()),
            TargetBackend::Custom { callbacks } => TargetBridge::new(callbacks.get()).end(),
        };
        tracing::debug!("Ended target {}", self.nick);
        flushed.and(finished)
    }
}

impl Write for NativeTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= self.buffer_size {
            self.flush_pending()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        Ok(self.flush_pending()?)
    }
}

impl Seek for NativeTarget {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_open()?;
        self.flush_pending()?;
        match &mut self.backend {
            TargetBackend::File { file: Some((file, _)) } => file.seek(pos),
            TargetBackend::File { file: None } => Err(ConnectionError::Closed {
                nick: self.nick.clone(),
            }
            .into()),
            TargetBackend::Memory { data, .. } => data.seek(pos),
            TargetBackend::Custom { callbacks } => {
                if !callbacks.is_seekable() {
                    return Err(ConnectionError::Unseekable.into());
                }
                TargetBridge::new(callbacks.get()).seek(pos)
            }
        }
    }
}

impl Read for NativeTarget {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        self.flush_pending()?;
        match &mut self.backend {
            TargetBackend::File { file: Some((file, _)) } => file.read(buf),
            TargetBackend::File { file: None } => Ok(0),
            TargetBackend::Memory { data, .. } => data.read(buf),
            TargetBackend::Custom { callbacks } => {
                if !callbacks.is_readable() {
                    return Err(ConnectionError::MissingCallback("read").into());
                }
                TargetBridge::new(callbacks.get()).read(buf)
            }
        }
    }
}

impl Drop for NativeTarget {
    fn drop(&mut self) {
        if !self.ended
            && let Err(e) = self.end()
        {
            tracing::warn!("Failed to end target {} on drop: {e}", self.nick);
        }
    }
}
