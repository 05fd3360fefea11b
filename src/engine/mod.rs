//! The image engine behind the handles.
//!
//! [`Image`] is a handle to decoded pixels held by a session. The catalog is
//! deliberately small: enough constructors, pixel operations and savers to
//! drive handles and connections end to end.
//!
//! | Operation | Cached | Runs on |
//! |---|---|---|
//! | [`Image::black`] | yes | caller |
//! | [`Image::new_from_file`] | yes (path, size, mtime) | caller |
//! | [`Image::new_from_buffer`], [`Image::new_from_source`] | no | caller |
//! | [`Image::invert`], [`Image::gaussblur`], [`Image::resize`] | yes | worker pool |
//! | [`Image::max_abs_difference`] | no | worker pool |
//! | [`Image::write_to_file`], [`Image::write_to_buffer`], [`Image::write_to_target`] | no | caller |
//!
//! Constructors and `resize` refuse sizes above the session's
//! `security.max_image_pixels`. A save reports progress to the callback set
//! with [`Image::on_progress`] from the calling thread.
//!
//! Connection I/O, and therefore every host callback, runs on the calling
//! thread. Only pixel work is handed to the session's worker pool.

mod format;
mod native;

pub use format::{LOAD_FORMATS, SAVE_FORMATS, SaveFormat};
pub(crate) use native::NativeImage;

use crate::cache::OperationKey;
use crate::connection::{ConnectionError, NativeSource, NativeTarget, Source, Target};
use crate::handle::{HandleError, ResourceKind, handle_type};
use crate::session::{Resource, Session};
use image::{DynamicImage, ImageError, ImageReader};
use crate::connection::bridge::CallbackResult;
use native::{Cancelled, Monitor, ProgressFn};
use std::io::{self, BufReader, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("Unknown image format")]
    UnknownFormat,
    #[error("Unsupported save suffix: {0}")]
    UnsupportedSuffix(String),
    #[error("{format} output needs a seekable target")]
    UnseekableTarget { format: &'static str },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("{0}: operation is blocked")]
    Blocked(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl EngineError {
    fn from_io(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<Cancelled>()) {
            return EngineError::Cancelled;
        }
        match ConnectionError::from_io(e) {
            ConnectionError::Io(e) => EngineError::Io(e),
            other => EngineError::Connection(other),
        }
    }

    fn from_image(e: ImageError, wrap: fn(String) -> EngineError) -> Self {
        match e {
            ImageError::IoError(e) => Self::from_io(e),
            other => wrap(other.to_string()),
        }
    }
}

handle_type! {
    /// Handle to a decoded image.
    Image => Image
}

/// Return the cached result for `key`, or build, register and cache it.
fn cached(
    session: &Session,
    key: OperationKey,
    build: impl FnOnce() -> Result<DynamicImage, EngineError>,
) -> Result<Image, EngineError> {
    if let Some(handle) = session.cache_lookup(&key, ResourceKind::Image) {
        return Ok(Image::from_handle(handle));
    }
    let image = register(session, build()?);
    session.cache_insert(key, image.handle());
    Ok(image)
}

fn register(session: &Session, pixels: DynamicImage) -> Image {
    register_native(session, NativeImage::new(session.tracker(), pixels))
}

fn register_native(session: &Session, native: NativeImage) -> Image {
    Image::from_handle(session.insert(Resource::Image(Arc::new(native))))
}

/// Refuse sizes over the session's pixel budget.
fn check_pixels(session: &Session, width: u32, height: u32) -> Result<(), EngineError> {
    let max = session.config().security.max_image_pixels;
    if u64::from(width) * u64::from(height) > max {
        return Err(EngineError::InvalidArgument(format!(
            "{width}x{height} exceeds the limit of {max} pixels"
        )));
    }
    Ok(())
}

/// Decode the whole of `source`, starting from its first byte.
fn decode(session: &Session, source: &mut NativeSource) -> Result<DynamicImage, EngineError> {
    source.rewind().map_err(EngineError::from_io)?;
    let capacity = session.config().io.source_buffer_size;
    let reader = ImageReader::new(BufReader::with_capacity(capacity, source))
        .with_guessed_format()
        .map_err(EngineError::from_io)?;
    let format = reader.format().ok_or(EngineError::UnknownFormat)?;
    session.check_blocked(&format!("load_{}", format::format_name(format)))?;
    reader
        .decode()
        .map_err(|e| EngineError::from_image(e, EngineError::Decode))
}

/// Encode into `target` and end it. The target is ended on every path.
fn save(
    session: &Session,
    image: &NativeImage,
    format: SaveFormat,
    target: &mut NativeTarget,
) -> Result<(), EngineError> {
    let prepared = session
        .check_blocked(&format!("save_{}", format.name()))
        .and_then(|()| image.check_kill())
        .and_then(|()| {
            if format.needs_seek() && !target.is_seekable() {
                return Err(EngineError::UnseekableTarget {
                    format: format.name(),
                });
            }
            Ok(())
        });
    let mut progress = image.take_progress();
    let encoded = prepared.and_then(|()| {
        let total = image.pixels().as_bytes().len() as u64;
        let mut monitor = Monitor::new(&mut *target, image.killed_flag(), progress.as_mut(), total);
        monitor.start().map_err(EngineError::from_io)?;
        format
            .encode(image.pixels(), &mut monitor)
            .map_err(|e| EngineError::from_image(e, EngineError::Encode))?;
        monitor.finish().map_err(EngineError::from_io)
    });
    if let Some(progress) = progress {
        image.restore_progress(progress);
    }
    let ended = target.end();
    encoded?;
    ended?;
    Ok(())
}

impl Image {
    pub(crate) fn native(&self) -> Result<Arc<NativeImage>, HandleError> {
        self.handle().session()?.image_of(self.handle())
    }

    /// Live native image, failing if its kill flag is set.
    fn live(&self) -> Result<Arc<NativeImage>, EngineError> {
        let native = self.native()?;
        native.check_kill()?;
        Ok(native)
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    /// A one-band image of zeros.
    pub fn black(session: &Session, width: u32, height: u32) -> Result<Self, EngineError> {
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidArgument(format!(
                "image size must be non-zero, got {width}x{height}"
            )));
        }
        check_pixels(session, width, height)?;
        session.check_blocked("black")?;
        let key = OperationKey::builder("black").u32(width).u32(height).finish();
        cached(session, key, || Ok(DynamicImage::new_luma8(width, height)))
    }

    /// Decode a file. Repeated loads of an unchanged file hit the cache.
    pub fn new_from_file(session: &Session, path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as u64);
        let key = OperationKey::builder("new_from_file")
            .str(&path.to_string_lossy())
            .u64(meta.len())
            .u64(mtime)
            .finish();
        if let Some(handle) = session.cache_lookup(&key, ResourceKind::Image) {
            return Ok(Image::from_handle(handle));
        }
        let mut source = NativeSource::from_file(session.tracker(), path)?;
        let pixels = decode(session, &mut source)?;
        drop(source);
        let native = NativeImage::new(session.tracker(), pixels).with_origin(path);
        let image = register_native(session, native);
        session.cache_insert(key, image.handle());
        Ok(image)
    }

    /// Decode an encoded image held in memory. The bytes are copied.
    pub fn new_from_buffer(session: &Session, data: &[u8]) -> Result<Self, EngineError> {
        let mut source = NativeSource::from_memory(session.tracker(), data);
        let pixels = decode(session, &mut source)?;
        Ok(register(session, pixels))
    }

    /// Decode from a connection, holding it for the whole load.
    pub fn new_from_source(session: &Session, source: &Source) -> Result<Self, EngineError> {
        let native = source.native()?;
        let pixels = {
            let mut guard = native.lock();
            decode(session, &mut guard)?
        };
        Ok(register(session, pixels))
    }

    /// Wrap raw 8-bit interleaved pixels with 1 to 4 bands. The bytes are
    /// copied.
    pub fn new_from_memory(
        session: &Session,
        data: &[u8],
        width: u32,
        height: u32,
        bands: u8,
    ) -> Result<Self, EngineError> {
        let expected = width as usize * height as usize * bands as usize;
        if data.len() != expected {
            return Err(EngineError::InvalidArgument(format!(
                "{width}x{height}x{bands} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        let raw = data.to_vec();
        let pixels = match bands {
            1 => image::GrayImage::from_raw(width, height, raw).map(DynamicImage::ImageLuma8),
            2 => image::GrayAlphaImage::from_raw(width, height, raw).map(DynamicImage::ImageLumaA8),
            3 => image::RgbImage::from_raw(width, height, raw).map(DynamicImage::ImageRgb8),
            4 => image::RgbaImage::from_raw(width, height, raw).map(DynamicImage::ImageRgba8),
            _ => None,
        }
        .ok_or_else(|| EngineError::InvalidArgument(format!("unsupported band count {bands}")))?;
        Ok(register(session, pixels))
    }

    // =========================================================================
    // Header
    // =========================================================================

    pub fn width(&self) -> Result<u32, EngineError> {
        Ok(self.native()?.width())
    }

    pub fn height(&self) -> Result<u32, EngineError> {
        Ok(self.native()?.height())
    }

    pub fn bands(&self) -> Result<u8, EngineError> {
        Ok(self.native()?.bands())
    }

    // =========================================================================
    // Pixel operations
    // =========================================================================

    /// Run a cached unary operation on the worker pool.
    fn unary(
        &self,
        name: &str,
        key: impl FnOnce(crate::cache::OperationKeyBuilder) -> crate::cache::OperationKeyBuilder,
        op: impl FnOnce(&DynamicImage) -> DynamicImage + Send,
    ) -> Result<Image, EngineError> {
        let session = self.handle().session()?;
        session.check_blocked(name)?;
        let id = self.handle().live_id()?;
        let native = self.live()?;
        let key = key(OperationKey::builder(name).input(id)).finish();
        cached(&session, key, || {
            let out = session.pool().install(|| op(native.pixels()));
            native.check_kill()?;
            Ok(out)
        })
    }

    pub fn invert(&self) -> Result<Image, EngineError> {
        self.unary("invert", |k| k, native::invert)
    }

    pub fn gaussblur(&self, sigma: f32) -> Result<Image, EngineError> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(EngineError::InvalidArgument(format!(
                "sigma must be positive, got {sigma}"
            )));
        }
        self.unary("gaussblur", |k| k.f32(sigma), move |img| native::gaussblur(img, sigma))
    }

    /// Scale both axes by `scale`.
    pub fn resize(&self, scale: f64) -> Result<Image, EngineError> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(EngineError::InvalidArgument(format!(
                "scale must be positive, got {scale}"
            )));
        }
        let (width, height) = {
            let current = self.native()?;
            let scaled = |n: u32| {
                native::scaled_dimension(n, scale).ok_or_else(|| {
                    EngineError::InvalidArgument(format!("scale {scale} overflows a {n} pixel side"))
                })
            };
            (scaled(current.width())?, scaled(current.height())?)
        };
        check_pixels(&self.handle().session()?, width, height)?;
        self.unary("resize", |k| k.u64(scale.to_bits()), move |img| {
            native::resize(img, width, height)
        })
    }

    /// Largest absolute per-sample difference to `other`. Both images must
    /// have the same size and band count.
    pub fn max_abs_difference(&self, other: &Image) -> Result<u32, EngineError> {
        let a = self.live()?;
        let b = other.live()?;
        if (a.width(), a.height(), a.bands()) != (b.width(), b.height(), b.bands()) {
            return Err(EngineError::InvalidArgument(format!(
                "images differ in shape: {}x{}x{} vs {}x{}x{}",
                a.width(),
                a.height(),
                a.bands(),
                b.width(),
                b.height(),
                b.bands()
            )));
        }
        let session = self.handle().session()?;
        Ok(session
            .pool()
            .install(|| native::max_abs_difference(a.pixels(), b.pixels())))
    }

    // =========================================================================
    // Savers
    // =========================================================================

    /// Save to a file, format chosen by extension (`out.jpg[Q=90]`).
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let (path, format) = SaveFormat::split_path(path.as_ref())?;
        let session = self.handle().session()?;
        let native = self.live()?;
        let mut target = NativeTarget::to_file(
            session.tracker(),
            &path,
            session.config().io.target_buffer_size,
        )?;
        save(&session, &native, format, &mut target)
    }

    /// Encode to memory, format chosen by suffix (`.png`, `.jpg[Q=90]`).
    pub fn write_to_buffer(&self, suffix: &str) -> Result<Vec<u8>, EngineError> {
        let format = SaveFormat::from_suffix(suffix)?;
        let session = self.handle().session()?;
        let native = self.live()?;
        let mut target = NativeTarget::to_memory(session.tracker(), session.config().io.target_buffer_size);
        save(&session, &native, format, &mut target)?;
        Ok(target.blob()?)
    }

    /// Encode to a connection and end it. The end hook of a custom target
    /// runs exactly once whether or not the save succeeds.
    pub fn write_to_target(&self, target: &Target, suffix: &str) -> Result<(), EngineError> {
        let target_native = target.native()?;
        let mut guard = target_native.lock();
        let prepared = SaveFormat::from_suffix(suffix).and_then(|format| {
            let session = self.handle().session()?;
            let native = self.live()?;
            Ok((session, native, format))
        });
        match prepared {
            Ok((session, native, format)) => save(&session, &native, format, &mut guard),
            Err(e) => {
                if let Err(end) = guard.end() {
                    tracing::warn!("Failed to end target {} after error: {end}", guard.nick());
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Set or clear the kill flag. While set, operations on this image fail
    /// with [`EngineError::Cancelled`], including an encode already writing.
    pub fn set_kill(&self, kill: bool) -> Result<(), EngineError> {
        self.native()?.set_kill(kill);
        Ok(())
    }

    pub fn is_killed(&self) -> Result<bool, EngineError> {
        Ok(self.native()?.is_killed())
    }

    /// Set the progress callback, called on the saving thread with a
    /// percentage from 0 to 100 while this image is encoded. An error or
    /// panic from the callback cancels the save.
    ///
    /// The callback belongs to the native image, so aliases and cache hits
    /// of this image share it.
    pub fn on_progress<F>(&self, f: F) -> Result<&Self, EngineError>
    where
        F: FnMut(u32) -> CallbackResult<()> + Send + 'static,
    {
        let progress: ProgressFn = Box::new(f);
        self.native()?.set_progress(Some(progress));
        Ok(self)
    }

    pub fn clear_progress(&self) -> Result<&Self, EngineError> {
        self.native()?.set_progress(None);
        Ok(self)
    }

    // =========================================================================
    // File lifetime
    // =========================================================================

    /// The file this image was loaded from, if any.
    pub fn filename(&self) -> Result<Option<PathBuf>, EngineError> {
        Ok(self.native()?.origin().map(Path::to_path_buf))
    }

    /// Delete the backing file once the native image is freed, that is once
    /// every handle is deleted and the cache has let go of it.
    pub fn set_delete_on_close(&self, delete: bool) -> Result<(), EngineError> {
        let native = self.native()?;
        if native.origin().is_none() {
            return Err(EngineError::InvalidArgument(
                "image was not loaded from a file".into(),
            ));
        }
        native.set_delete_on_close(delete);
        Ok(())
    }
}
