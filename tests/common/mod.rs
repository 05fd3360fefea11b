//! Helpers shared by the integration tests.

#![allow(dead_code)]

use imgbridge::connection::CallbackError;
use imgbridge::{Image, Session, SourceCustom, TargetCustom};
use std::sync::{Arc, Mutex};

pub fn session() -> Session {
    Session::new().expect("session with stock config")
}

/// A three-band gradient, large enough that every encoder writes in several
/// chunks.
pub fn gradient(session: &Session, width: u32, height: u32) -> Image {
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.extend([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x ^ y) % 256) as u8]);
        }
    }
    Image::new_from_memory(session, &pixels, width, height, 3).expect("gradient image")
}

/// Everything a recording target saw.
#[derive(Debug, Default)]
pub struct Recorded {
    pub bytes: Vec<u8>,
    pub ends: usize,
}

pub type Record = Arc<Mutex<Recorded>>;

/// A write-only custom target that records bytes and end calls.
pub fn recording_target(session: &Session) -> (TargetCustom, Record) {
    let record = Record::default();
    let target = TargetCustom::new(session);
    let writes = Arc::clone(&record);
    let ends = Arc::clone(&record);
    target
        .on_write(move |data| {
            writes.lock().unwrap().bytes.extend_from_slice(data);
            Ok(data.len())
        })
        .unwrap()
        .on_end(move || {
            ends.lock().unwrap().ends += 1;
            Ok(())
        })
        .unwrap();
    (target, record)
}

/// A read-only custom source streaming `data` in chunks of at most `chunk`
/// bytes, with no seek callback.
pub fn streaming_source(session: &Session, data: Vec<u8>, chunk: usize) -> SourceCustom {
    let source = SourceCustom::new(session);
    let mut pos = 0;
    source
        .on_read(move |length| {
            let n = length.min(chunk).min(data.len() - pos);
            let out = data[pos..pos + n].to_vec();
            pos += n;
            Ok(Some(out))
        })
        .unwrap();
    source
}

/// A seekable custom source over `data`.
pub fn seekable_source(session: &Session, data: Vec<u8>) -> SourceCustom {
    let data = Arc::new(data);
    let pos = Arc::new(Mutex::new(0u64));
    let source = SourceCustom::new(session);
    let (read_data, read_pos) = (Arc::clone(&data), Arc::clone(&pos));
    source
        .on_read(move |length| {
            let mut pos = read_pos.lock().unwrap();
            let start = (*pos as usize).min(read_data.len());
            let end = (start + length).min(read_data.len());
            *pos = end as u64;
            Ok(Some(read_data[start..end].to_vec()))
        })
        .unwrap()
        .on_seek(move |offset, whence| {
            let mut pos = pos.lock().unwrap();
            let base = match whence {
                imgbridge::connection::Whence::Set => 0,
                imgbridge::connection::Whence::Cur => *pos as i64,
                imgbridge::connection::Whence::End => data.len() as i64,
            };
            let next = base + offset;
            if next < 0 {
                return Err(CallbackError::Failed(format!("seek before start: {next}")));
            }
            *pos = next as u64;
            Ok(*pos)
        })
        .unwrap();
    source
}
