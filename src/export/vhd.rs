use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256};

use super::raw::write_sparse;

pub const VHD_COOKIE: &[u8; 8] = b"conectix";
pub const VHD_FOOTER_SIZE: usize = 512;

/// Seconds between the Unix epoch and 2000-01-01 00:00:00 UTC.
const VHD_EPOCH_OFFSET: u64 = 946_684_800;
const DISK_TYPE_FIXED: u32 = 2;

/// Fixed VHD footer for a flat disk of `disk_size` bytes.
///
/// Big-endian fields: cookie, features (2), format version 1.0, data offset
/// (all ones for fixed disks), timestamp, creator `rffu`, creator host
/// `Wi2k`, original and current size, CHS geometry, disk type, checksum,
/// unique id.
pub fn vhd_footer(disk_size: u64, timestamp: u32, unique_id: [u8; 16]) -> [u8; VHD_FOOTER_SIZE] {
    let mut f = [0u8; VHD_FOOTER_SIZE];
    f[0..8].copy_from_slice(VHD_COOKIE);
    BigEndian::write_u32(&mut f[8..12], 2);
    BigEndian::write_u32(&mut f[12..16], 0x0001_0000);
    BigEndian::write_u64(&mut f[16..24], u64::MAX);
    BigEndian::write_u32(&mut f[24..28], timestamp);
    f[28..32].copy_from_slice(b"rffu");
    BigEndian::write_u32(&mut f[32..36], 0x0001_0000);
    f[36..40].copy_from_slice(b"Wi2k");
    BigEndian::write_u64(&mut f[40..48], disk_size);
    BigEndian::write_u64(&mut f[48..56], disk_size);

    let (cylinders, heads, sectors) = chs_geometry(disk_size);
    BigEndian::write_u16(&mut f[56..58], cylinders);
    f[58] = heads;
    f[59] = sectors;
    BigEndian::write_u32(&mut f[60..64], DISK_TYPE_FIXED);
    f[68..84].copy_from_slice(&unique_id);

    // checksum field is still zero here
    let sum = f.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    BigEndian::write_u32(&mut f[64..68], !sum);
    f
}

/// CHS geometry for the footer, as (cylinders, heads, sectors per track).
pub(crate) fn chs_geometry(disk_size: u64) -> (u16, u8, u8) {
    let sectors = (disk_size / 512).min(65535 * 16 * 255);
    if sectors == 0 {
        return (0, 0, 0);
    }
    if sectors >= 65535 * 16 * 63 {
        return ((sectors / (16 * 255)) as u16, 16, 255);
    }

    let mut spt = 17u64;
    let mut track_count = sectors / spt;
    let mut heads = track_count.div_ceil(1024).max(4);
    if track_count >= heads * 1024 || heads > 16 {
        spt = 31;
        heads = 16;
        track_count = sectors / spt;
    }
    if track_count >= heads * 1024 {
        spt = 63;
        heads = 16;
        track_count = sectors / spt;
    }
    ((track_count / heads) as u16, heads as u8, spt as u8)
}

fn footer_identity(output: &Path) -> (u32, [u8; 16]) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let timestamp = now.as_secs().saturating_sub(VHD_EPOCH_OFFSET) as u32;

    let mut hasher = Sha256::new();
    hasher.update(now.as_nanos().to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(output.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    (timestamp, id)
}

/// Write a fixed VHD: the sparse flat image, then the footer.
pub(crate) fn write_vhd(
    reader: &mut impl Read,
    output: &Path,
    progress_cb: &mut impl FnMut(u64),
    cancel_check: &impl Fn() -> bool,
) -> Result<u64> {
    let disk_size = write_sparse(reader, output, progress_cb, cancel_check)?;
    let (timestamp, id) = footer_identity(output);
    let footer = vhd_footer(disk_size, timestamp, id);

    let mut file = OpenOptions::new()
        .write(true)
        .open(output)
        .with_context(|| format!("failed to reopen {}", output.display()))?;
    file.seek(SeekFrom::Start(disk_size))?;
    file.write_all(&footer).context("failed to write VHD footer")?;
    Ok(disk_size)
}
