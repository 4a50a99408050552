//! Seekable source streams and bounded windows over them.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::FfuError;

/// A `Read + Seek` window of `length` bytes starting at `start` in `inner`.
///
/// Positions are relative to the window; reads stop at its end.
pub struct PartialStream<R> {
    inner: R,
    start: u64,
    length: u64,
    position: u64,
}

impl<R: Seek> PartialStream<R> {
    pub fn new(mut inner: R, start: u64, length: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self {
            inner,
            start,
            length,
            position: 0,
        })
    }
}

impl<R: Read + Seek> Read for PartialStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length {
            return Ok(0);
        }
        let remaining = self.length - self.position;
        let to_read = (buf.len() as u64).min(remaining) as usize;
        let n = self.inner.read(&mut buf[..to_read])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Seek> Seek for PartialStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.length as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }
        self.position = new_pos as u64;
        self.inner.seek(SeekFrom::Start(self.start + self.position))?;
        Ok(self.position)
    }
}

/// Open a raw image file or block device for reading.
///
/// Returns the buffered stream and its length, found by seeking to the end
/// (which also works for block devices, where file metadata reports zero).
pub fn open_seekable_source(path: &Path) -> Result<(BufReader<File>, u64), FfuError> {
    let file = File::open(path).map_err(|e| {
        FfuError::Io(io::Error::new(
            e.kind(),
            format!("cannot open {}: {e}", path.display()),
        ))
    })?;
    let mut reader = BufReader::new(file);
    let len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;
    Ok((reader, len))
}
