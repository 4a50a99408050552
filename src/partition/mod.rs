pub mod gpt;
pub mod splitter;

use std::io::{Read, Seek, SeekFrom};

use crate::error::FfuError;
use gpt::{Gpt, GptHeader};

pub use splitter::{split_image, FlashPart, PartSource, SplitOptions, SplitResult, UnlockState};

/// Sectors probed for the GPT header before the partition array size is known.
const GPT_PROBE_SECTORS: u64 = 34;

/// Read and parse the GPT at the start of `reader`.
///
/// Reads enough sectors to find the header, then extends the read to cover
/// the whole partition entry array.
pub fn read_gpt(reader: &mut (impl Read + Seek), sector_size: u32) -> Result<Gpt, FfuError> {
    let disk_len = reader.seek(SeekFrom::End(0))?;
    let probe_len = (GPT_PROBE_SECTORS * sector_size as u64).min(disk_len);
    let mut buf = vec![0u8; probe_len as usize];
    reader.seek(SeekFrom::Start(0))?;
    reader
        .read_exact(&mut buf)
        .map_err(|e| FfuError::InvalidGpt(format!("cannot read GPT sectors: {e}")))?;

    let (_, header) = GptHeader::locate(&buf, sector_size)?;
    let required = header.table_end(sector_size)?;
    if required > buf.len() as u64 {
        if required > disk_len {
            return Err(FfuError::InvalidGpt(format!(
                "partition table ends at byte {required}, disk holds {disk_len}"
            )));
        }
        let old_len = buf.len();
        buf.resize(required as usize, 0);
        reader.read_exact(&mut buf[old_len..])?;
    }
    Gpt::parse(&buf, sector_size)
}

/// Format a byte count as a human-readable size string using binary (base-1024) units.
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    const TIB: u64 = 1024 * GIB;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
