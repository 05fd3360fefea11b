//! Shared test utilities for the imgbridge unit tests.
//!
//! Provides synthetic images and recording callbacks so tests do not depend
//! on fixture files.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let session = Session::new().unwrap();
//! let image = gradient_image(&session, 32, 24);
//! let (target, log) = recording_target(&session);
//! image.write_to_target(&target, ".png").unwrap();
//! assert_eq!(log.ends(), 1);
//! ```

use crate::connection::TargetCustom;
use crate::engine::Image;
use crate::session::Session;
use parking_lot::Mutex;
use std::sync::Arc;

// =========================================================================
// Synthetic images
// =========================================================================

/// Raw RGB pixels of a deterministic gradient.
pub fn gradient_pixels(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            out.push((x * 255 / width.max(1)) as u8);
            out.push((y * 255 / height.max(1)) as u8);
            out.push(((x + y) % 256) as u8);
        }
    }
    out
}

/// A three-band gradient image registered with `session`.
pub fn gradient_image(session: &Session, width: u32, height: u32) -> Image {
    Image::new_from_memory(session, &gradient_pixels(width, height), width, height, 3)
        .unwrap_or_else(|e| panic!("failed to build {width}x{height} gradient: {e}"))
}

// =========================================================================
// Recording callbacks
// =========================================================================

/// What a recording target saw.
#[derive(Debug, Default)]
pub struct TargetLog {
    pub bytes: Vec<u8>,
    pub writes: usize,
    pub ends: usize,
}

/// Shared view of a [`TargetLog`].
#[derive(Debug, Clone, Default)]
pub struct SharedLog(Arc<Mutex<TargetLog>>);

impl SharedLog {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().bytes.clone()
    }

    pub fn writes(&self) -> usize {
        self.0.lock().writes
    }

    pub fn ends(&self) -> usize {
        self.0.lock().ends
    }
}

/// A custom target that appends every write to a log and counts end calls.
pub fn recording_target(session: &Session) -> (TargetCustom, SharedLog) {
    let log = SharedLog::default();
    let target = TargetCustom::new(session);
    let on_write = log.clone();
    let on_end = log.clone();
    target
        .on_write(move |data| {
            let mut log = on_write.0.lock();
            log.bytes.extend_from_slice(data);
            log.writes += 1;
            Ok(data.len())
        })
        .and_then(|t| {
            t.on_end(move || {
                on_end.0.lock().ends += 1;
                Ok(())
            })
        })
        .unwrap_or_else(|e| panic!("failed to set target callbacks: {e}"));
    (target, log)
}
