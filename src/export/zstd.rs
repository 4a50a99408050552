use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};

use super::CHUNK_SIZE;
use crate::error::FfuError;

const ZSTD_LEVEL: i32 = 3;

/// Compress `reader` into a single zstd stream at `output`.
pub(crate) fn write_zstd(
    reader: &mut impl Read,
    output: &Path,
    progress_cb: &mut impl FnMut(u64),
    cancel_check: &impl Fn() -> bool,
) -> Result<u64> {
    let file = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut encoder = zstd::Encoder::new(BufWriter::new(file), ZSTD_LEVEL)
        .context("failed to create zstd encoder")?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total_read: u64 = 0;
    loop {
        if cancel_check() {
            return Err(FfuError::Cancelled.into());
        }
        let n = reader.read(&mut buf).context("failed to read virtual disk")?;
        if n == 0 {
            break;
        }
        encoder
            .write_all(&buf[..n])
            .context("failed to write compressed data")?;
        total_read += n as u64;
        progress_cb(total_read);
    }

    let mut inner = encoder.finish().context("failed to finalize zstd stream")?;
    inner.flush()?;
    Ok(total_read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_write_zstd_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut data = vec![0u8; 65536];
        data[1000..1010].copy_from_slice(b"FFU-BLOCKS");
        let path = tmp.path().join("disk.zst");

        let n = write_zstd(&mut Cursor::new(&data), &path, &mut |_| {}, &|| false).unwrap();
        assert_eq!(n, 65536);

        let compressed = std::fs::read(&path).unwrap();
        assert!(compressed.len() < 65536);
        assert_eq!(zstd::decode_all(&compressed[..]).unwrap(), data);
    }
}
