//! Sequential fallback for sources that cannot seek.
//!
//! Every byte pulled from the upstream reader is retained, so rewinds and
//! backward seeks within the consumed range are served from memory. Forward
//! seeks read through, and seeking relative to the end drains the stream.

use std::io::{self, Read, SeekFrom};

#[derive(Debug, Default)]
pub(crate) struct Replay {
    buffer: Vec<u8>,
    pos: u64,
    eof: bool,
}

impl Replay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes retained so far.
    pub fn retained(&self) -> usize {
        self.buffer.len()
    }

    pub fn read<R: Read + ?Sized>(&mut self, upstream: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = self.buffer.len() as u64;
        if self.pos < len {
            let start = self.pos as usize;
            let n = buf.len().min(self.buffer.len() - start);
            buf[..n].copy_from_slice(&self.buffer[start..start + n]);
            self.pos += n as u64;
            return Ok(n);
        }
        if self.pos > len {
            self.fill_to(upstream, self.pos)?;
            if self.pos > self.buffer.len() as u64 {
                return Ok(0);
            }
            return self.read(upstream, buf);
        }
        if self.eof {
            return Ok(0);
        }
        let n = upstream.read(buf)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buffer.extend_from_slice(&buf[..n]);
            self.pos += n as u64;
        }
        Ok(n)
    }

    pub fn seek<R: Read + ?Sized>(&mut self, upstream: &mut R, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => {
                self.drain(upstream)?;
                (self.buffer.len() as u64).checked_add_signed(d)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        self.pos = target;
        Ok(target)
    }

    /// Pull from upstream until `target` bytes are retained or the stream ends.
    fn fill_to<R: Read + ?Sized>(&mut self, upstream: &mut R, target: u64) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        while !self.eof && (self.buffer.len() as u64) < target {
            let want = (target - self.buffer.len() as u64).min(chunk.len() as u64) as usize;
            let n = upstream.read(&mut chunk[..want])?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buffer.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(())
    }

    fn drain<R: Read + ?Sized>(&mut self, upstream: &mut R) -> io::Result<()> {
        if !self.eof {
            upstream.read_to_end(&mut self.buffer)?;
            self.eof = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `chunk` bytes per call.
    struct Trickle {
        inner: Cursor<Vec<u8>>,
        chunk: usize,
        calls: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            let n = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..n])
        }
    }

    fn trickle(data: &[u8], chunk: usize) -> Trickle {
        Trickle {
            inner: Cursor::new(data.to_vec()),
            chunk,
            calls: 0,
        }
    }

    fn read_all(replay: &mut Replay, upstream: &mut Trickle) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = replay.read(upstream, &mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn rewind_replays_from_memory() {
        let mut upstream = trickle(b"hello world", 4);
        let mut replay = Replay::new();
        assert_eq!(read_all(&mut replay, &mut upstream), b"hello world");
        let calls = upstream.calls;

        replay.seek(&mut upstream, SeekFrom::Start(0)).unwrap();
        assert_eq!(read_all(&mut replay, &mut upstream), b"hello world");
        assert_eq!(upstream.calls, calls);
        assert_eq!(replay.retained(), 11);
    }

    #[test]
    fn backward_seek_within_consumed_range() {
        let mut upstream = trickle(b"abcdefgh", 8);
        let mut replay = Replay::new();
        let mut buf = [0u8; 6];
        replay.read(&mut upstream, &mut buf).unwrap();

        replay.seek(&mut upstream, SeekFrom::Current(-4)).unwrap();
        let mut two = [0u8; 2];
        replay.read(&mut upstream, &mut two).unwrap();
        assert_eq!(&two, b"cd");
    }

    #[test]
    fn forward_seek_reads_through() {
        let mut upstream = trickle(b"0123456789", 3);
        let mut replay = Replay::new();
        replay.seek(&mut upstream, SeekFrom::Start(7)).unwrap();
        let mut buf = [0u8; 3];
        let n = replay.read(&mut upstream, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"789");
    }

    #[test]
    fn seek_from_end_drains_stream() {
        let mut upstream = trickle(b"0123456789", 2);
        let mut replay = Replay::new();
        let pos = replay.seek(&mut upstream, SeekFrom::End(-2)).unwrap();
        assert_eq!(pos, 8);
        assert_eq!(replay.retained(), 10);
        let mut buf = [0u8; 4];
        let n = replay.read(&mut upstream, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"89");
    }

    #[test]
    fn seek_past_end_reads_nothing() {
        let mut upstream = trickle(b"abc", 8);
        let mut replay = Replay::new();
        replay.seek(&mut upstream, SeekFrom::Start(10)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(replay.read(&mut upstream, &mut buf).unwrap(), 0);
    }

    #[test]
    fn negative_position_is_rejected() {
        let mut upstream = trickle(b"abc", 8);
        let mut replay = Replay::new();
        let err = replay.seek(&mut upstream, SeekFrom::Current(-1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
