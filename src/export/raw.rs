use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};

use super::{is_all_zeros, CHUNK_SIZE};
use crate::error::FfuError;

/// Copy `reader` into a new file at `output`, seeking over all-zero chunks.
///
/// The file is left sparse on filesystems that support holes. Returns the
/// logical length written.
pub(crate) fn write_sparse(
    reader: &mut impl Read,
    output: &Path,
    progress_cb: &mut impl FnMut(u64),
    cancel_check: &impl Fn() -> bool,
) -> Result<u64> {
    let file = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let len = copy_sparse(reader, &mut writer, progress_cb, cancel_check)?;
    writer.flush()?;
    writer.get_mut().set_len(len)?;
    Ok(len)
}

/// Copy `reader` into `writer`, seeking forward instead of writing zero chunks.
///
/// The caller fixes the final length; a trailing hole is not materialised.
pub(crate) fn copy_sparse(
    reader: &mut impl Read,
    writer: &mut (impl Write + Seek),
    progress_cb: &mut impl FnMut(u64),
    cancel_check: &impl Fn() -> bool,
) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut position: u64 = 0;
    let mut hole = false;
    loop {
        if cancel_check() {
            return Err(FfuError::Cancelled.into());
        }
        let n = read_full(reader, &mut buf).context("failed to read virtual disk")?;
        if n == 0 {
            break;
        }
        if is_all_zeros(&buf[..n]) {
            hole = true;
        } else {
            if hole {
                writer.seek(SeekFrom::Start(position))?;
                hole = false;
            }
            writer
                .write_all(&buf[..n])
                .context("failed to write output")?;
        }
        position += n as u64;
        progress_cb(position);
    }
    if hole {
        writer.seek(SeekFrom::Start(position))?;
    }
    Ok(position)
}

/// Fill `buf` unless the reader ends first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_sparse_copy_preserves_content() {
        let tmp = TempDir::new().unwrap();
        let mut data = vec![0u8; 4 * CHUNK_SIZE];
        data[CHUNK_SIZE + 3] = 0xAA;
        let path = tmp.path().join("disk.img");

        let n = write_sparse(&mut Cursor::new(&data), &path, &mut |_| {}, &|| false).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_trailing_zeros_keep_length() {
        let tmp = TempDir::new().unwrap();
        let mut data = vec![0u8; 2 * CHUNK_SIZE + 17];
        data[0] = 1;
        let path = tmp.path().join("disk.img");

        write_sparse(&mut Cursor::new(&data), &path, &mut |_| {}, &|| false).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), data.len() as u64);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }
}
