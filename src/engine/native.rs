//! Decoded images and the pixel work done on them.

use super::EngineError;
use crate::connection::bridge::{CallbackResult, guarded};
use crate::stats::{TrackedMemory, Tracker};
use image::DynamicImage;
use image::imageops::FilterType;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Host progress hook, called with a percentage.
pub(crate) type ProgressFn = Box<dyn FnMut(u32) -> CallbackResult<()> + Send>;

/// Decoded pixels plus their tracked allocation, kill flag and host hooks.
pub(crate) struct NativeImage {
    pixels: DynamicImage,
    killed: AtomicBool,
    progress: Mutex<Option<ProgressFn>>,
    origin: Option<PathBuf>,
    delete_on_close: AtomicBool,
    _tracked: TrackedMemory,
}

impl NativeImage {
    pub fn new(tracker: &Arc<Tracker>, pixels: DynamicImage) -> Self {
        let tracked = TrackedMemory::new(tracker, pixels.as_bytes().len() as u64);
        Self {
            pixels,
            killed: AtomicBool::new(false),
            progress: Mutex::new(None),
            origin: None,
            delete_on_close: AtomicBool::new(false),
            _tracked: tracked,
        }
    }

    /// Remember the file these pixels were decoded from.
    pub fn with_origin(mut self, path: &Path) -> Self {
        self.origin = Some(path.to_path_buf());
        self
    }

    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    pub fn set_delete_on_close(&self, delete: bool) {
        self.delete_on_close.store(delete, Ordering::Release);
    }

    pub fn set_progress(&self, progress: Option<ProgressFn>) {
        *self.progress.lock() = progress;
    }

    /// Move the progress hook out so host code never runs under the lock.
    pub fn take_progress(&self) -> Option<ProgressFn> {
        self.progress.lock().take()
    }

    /// Put a taken hook back unless the host installed a new one meanwhile.
    pub fn restore_progress(&self, progress: ProgressFn) {
        let mut slot = self.progress.lock();
        if slot.is_none() {
            *slot = Some(progress);
        }
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn bands(&self) -> u8 {
        self.pixels.color().channel_count()
    }

    pub fn set_kill(&self, kill: bool) {
        self.killed.store(kill, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn killed_flag(&self) -> &AtomicBool {
        &self.killed
    }

    pub fn check_kill(&self) -> Result<(), EngineError> {
        if self.is_killed() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

pub(crate) fn invert(img: &DynamicImage) -> DynamicImage {
    let mut out = img.clone();
    out.invert();
    out
}

pub(crate) fn gaussblur(img: &DynamicImage, sigma: f32) -> DynamicImage {
    img.blur(sigma)
}

/// `n` scaled and rounded, never below 1. `None` when the result does not
/// fit in a `u32`.
pub(crate) fn scaled_dimension(n: u32, scale: f64) -> Option<u32> {
    let scaled = (f64::from(n) * scale).round().max(1.0);
    if scaled.is_finite() && scaled <= f64::from(u32::MAX) {
        Some(scaled as u32)
    } else {
        None
    }
}

pub(crate) fn resize(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    img.resize_exact(width, height, FilterType::Lanczos3)
}

/// Largest per-sample absolute difference between two same-shaped images.
pub(crate) fn max_abs_difference(a: &DynamicImage, b: &DynamicImage) -> u32 {
    let color = a.color();
    if color.bytes_per_pixel() == color.channel_count() {
        a.as_bytes()
            .par_iter()
            .zip(b.as_bytes().par_iter())
            .map(|(x, y)| x.abs_diff(*y) as u32)
            .max()
            .unwrap_or(0)
    } else {
        let (a, b) = (a.to_rgba16(), b.to_rgba16());
        a.as_raw()
            .par_iter()
            .zip(b.as_raw().par_iter())
            .map(|(x, y)| x.abs_diff(*y) as u32)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Error, Debug)]
#[error("operation cancelled")]
pub(crate) struct Cancelled;

/// Writer between an encoder and its target. Fails once the kill flag is
/// set and reports progress to the host as bytes go out.
///
/// Progress is estimated against the raw pixel size, so it stays below 100
/// until [`Monitor::finish`].
pub(crate) struct Monitor<'a, W> {
    inner: W,
    killed: &'a AtomicBool,
    progress: Option<&'a mut ProgressFn>,
    total: u64,
    written: u64,
    reported: Option<u32>,
}

impl<'a, W> Monitor<'a, W> {
    pub fn new(
        inner: W,
        killed: &'a AtomicBool,
        progress: Option<&'a mut ProgressFn>,
        total: u64,
    ) -> Self {
        Self {
            inner,
            killed,
            progress,
            total: total.max(1),
            written: 0,
            reported: None,
        }
    }

    fn check(&self) -> io::Result<()> {
        if self.killed.load(Ordering::Acquire) {
            return Err(io::Error::other(Cancelled));
        }
        Ok(())
    }

    fn report(&mut self, percent: u32) -> io::Result<()> {
        if self.reported.is_some_and(|last| last >= percent) {
            return Ok(());
        }
        self.reported = Some(percent);
        let Some(progress) = self.progress.as_deref_mut() else {
            return Ok(());
        };
        tracing::trace!("progress {percent}%");
        guarded(|| progress(percent)).map_err(|e| {
            tracing::debug!("Progress callback stopped the operation: {e}");
            io::Error::other(Cancelled)
        })
    }

    pub fn start(&mut self) -> io::Result<()> {
        self.check()?;
        self.report(0)
    }

    pub fn finish(&mut self) -> io::Result<()> {
        self.report(100)
    }
}

impl<W: Write> Write for Monitor<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        let percent = (self.written.saturating_mul(100) / self.total).min(99) as u32;
        self.report(percent)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for Monitor<'_, W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check()?;
        self.inner.seek(pos)
    }
}

impl Drop for NativeImage {
    fn drop(&mut self) {
        if !self.delete_on_close.load(Ordering::Acquire) {
            return;
        }
        if let Some(path) = &self.origin {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Deleted {} on close", path.display()),
                Err(e) => tracing::warn!("Failed to delete {} on close: {e}", path.display()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};

    #[test]
    fn tracks_pixel_memory() {
        let tracker = Tracker::new();
        let image = NativeImage::new(&tracker, DynamicImage::new_rgb8(10, 10));
        assert_eq!(tracker.mem(), 300);
        assert_eq!(image.bands(), 3);
        drop(image);
        assert_eq!(tracker.mem(), 0);
    }

    #[test]
    fn invert_flips_samples() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 2, Luma([10])));
        let inverted = invert(&img);
        assert_eq!(inverted.as_bytes(), &[245; 4]);
    }

    #[test]
    fn scaled_dimension_rounds_and_never_collapses() {
        assert_eq!(scaled_dimension(10, 0.5), Some(5));
        assert_eq!(scaled_dimension(4, 0.01), Some(1));
        assert_eq!(scaled_dimension(3, 1.5), Some(5));
    }

    #[test]
    fn scaled_dimension_rejects_overflow() {
        assert_eq!(scaled_dimension(4, 1e12), None);
        assert_eq!(scaled_dimension(u32::MAX, 2.0), None);
        assert_eq!(scaled_dimension(u32::MAX, 1.0), Some(u32::MAX));
    }

    #[test]
    fn resize_hits_requested_size() {
        let img = DynamicImage::new_rgb8(10, 4);
        let out = resize(&img, 5, 2);
        assert_eq!((out.width(), out.height()), (5, 2));
    }

    #[test]
    fn identical_images_have_zero_difference() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(8, 8, |x, y| {
            image::Rgb([x as u8 * 30, y as u8 * 30, 7])
        }));
        assert_eq!(max_abs_difference(&img, &img.clone()), 0);
        // Pixel (0, 0) has a zero sample, which inverts to 255
        assert_eq!(max_abs_difference(&img, &invert(&img)), 255);
    }

    #[test]
    fn monitor_fails_writes_once_killed() {
        let flag = AtomicBool::new(false);
        let mut out = Vec::new();
        {
            let mut writer = Monitor::new(std::io::Cursor::new(&mut out), &flag, None, 100);
            writer.write_all(b"ok").unwrap();
            flag.store(true, Ordering::Release);
            let err = writer.write_all(b"late").unwrap_err();
            assert!(err.get_ref().is_some_and(|e| e.is::<Cancelled>()));
        }
        assert_eq!(out, b"ok");
    }

    #[test]
    fn monitor_reports_rising_percentages() {
        let flag = AtomicBool::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let mut progress: ProgressFn = Box::new(move |p| {
            log.lock().push(p);
            Ok(())
        });
        let mut writer = Monitor::new(io::sink(), &flag, Some(&mut progress), 10);
        writer.start().unwrap();
        writer.write_all(b"abc").unwrap();
        writer.write_all(b"abc").unwrap();
        writer.write_all(b"abcdefgh").unwrap();
        writer.finish().unwrap();
        assert_eq!(*seen.lock(), [0, 30, 60, 99, 100]);
    }

    #[test]
    fn failing_progress_cancels() {
        let flag = AtomicBool::new(false);
        let mut progress: ProgressFn = Box::new(|p| match p {
            0 => Ok(()),
            _ => Err("stop".into()),
        });
        let mut writer = Monitor::new(io::sink(), &flag, Some(&mut progress), 10);
        writer.start().unwrap();
        let err = writer.write_all(b"abcde").unwrap_err();
        assert!(err.get_ref().is_some_and(|e| e.is::<Cancelled>()));
    }

    #[test]
    fn delete_on_close_removes_origin() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("scratch.png");
        std::fs::write(&path, b"x").unwrap();
        let tracker = Tracker::new();

        let kept = NativeImage::new(&tracker, DynamicImage::new_luma8(1, 1)).with_origin(&path);
        drop(kept);
        assert!(path.exists());

        let doomed = NativeImage::new(&tracker, DynamicImage::new_luma8(1, 1)).with_origin(&path);
        doomed.set_delete_on_close(true);
        drop(doomed);
        assert!(!path.exists());
    }
}
