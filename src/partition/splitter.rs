//! Turns a GPT disk image into the list of block-aligned extents ("flash
//! parts") that go into a store.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;

use super::gpt::{Gpt, GptHeader};
use crate::error::FfuError;
use crate::stream::PartialStream;

/// Where the bytes of a flash part come from.
#[derive(Debug, Clone)]
pub enum PartSource {
    /// The source disk image, starting at `source_offset`.
    Image,
    /// A synthetic in-memory buffer (the rebuilt GPT).
    Buffer(Arc<[u8]>),
}

/// A contiguous, block-aligned window into a source, placed at
/// `start_location` on the target device.
#[derive(Debug, Clone)]
pub struct FlashPart {
    pub source: PartSource,
    pub source_offset: u64,
    pub start_location: u64,
    pub length: u64,
}

impl FlashPart {
    pub fn block_count(&self, block_size: u32) -> u64 {
        self.length / block_size as u64
    }

    /// Open a sequential reader over the part's bytes.
    pub fn open<'a, S: Read + Seek>(
        &'a self,
        image: &'a mut S,
    ) -> Result<Box<dyn Read + 'a>, FfuError> {
        match &self.source {
            PartSource::Image => Ok(Box::new(PartialStream::new(
                image,
                self.source_offset,
                self.length,
            )?)),
            PartSource::Buffer(data) => {
                let start = self.source_offset as usize;
                let end = start + self.length as usize;
                if end > data.len() {
                    return Err(FfuError::Alignment(format!(
                        "buffer flash part ends at {end}, buffer holds {}",
                        data.len()
                    )));
                }
                Ok(Box::new(Cursor::new(&data[start..end])))
            }
        }
    }
}

/// Device unlock states recognised from sentinel partition names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnlockState {
    /// `IS_UNLOCKED` is present; the UEFI boot-services variable store is kept.
    Unlocked,
    /// `HACK` is present; the backup boot-services variable store is kept.
    HackUnlocked,
}

struct UnlockRule {
    state: UnlockState,
    sentinels: &'static [&'static str],
    keeps: &'static str,
}

const UNLOCK_RULES: [UnlockRule; 2] = [
    UnlockRule {
        state: UnlockState::Unlocked,
        sentinels: &["IS_UNLOCKED"],
        keeps: "UEFI_BS_NV",
    },
    UnlockRule {
        state: UnlockState::HackUnlocked,
        sentinels: &["HACK"],
        keeps: "BACKUP_BS_NV",
    },
];

impl UnlockState {
    /// The excluded partition this state brings back into the image.
    pub fn kept_partition(self) -> &'static str {
        UNLOCK_RULES
            .iter()
            .find(|r| r.state == self)
            .map(|r| r.keeps)
            .unwrap_or_default()
    }
}

/// States whose sentinel partitions are all present in `gpt`.
pub fn detect_unlock_states(gpt: &Gpt) -> Vec<UnlockState> {
    UNLOCK_RULES
        .iter()
        .filter(|rule| rule.sentinels.iter().all(|s| gpt.has_partition(s)))
        .map(|rule| rule.state)
        .collect()
}

fn is_listed(name: &str, list: &[String]) -> bool {
    list.iter().any(|n| n.eq_ignore_ascii_case(name))
}

/// Whether partition `name` is left out of the image.
pub fn is_excluded(name: &str, excluded: &[String], unlock_states: &[UnlockState]) -> bool {
    if !is_listed(name, excluded) {
        return false;
    }
    !unlock_states
        .iter()
        .any(|state| state.kept_partition().eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone)]
pub struct SplitOptions<'a> {
    pub block_size: u32,
    pub sector_size: u32,
    pub excluded: &'a [String],
}

#[derive(Debug, Clone)]
pub struct SplitResult {
    pub gpt: Gpt,
    /// First block of the image with the GPT rebuilt.
    pub gpt_block: Arc<[u8]>,
    /// Leading synthetic GPT part followed by the partition extents.
    pub flash_parts: Vec<FlashPart>,
    pub unlock_states: Vec<UnlockState>,
    pub image_len: u64,
}

/// Build a flash part for an inclusive sector range of the source image.
pub fn make_flash_part(
    first_sector: u64,
    last_sector: u64,
    block_size: u32,
    sector_size: u32,
) -> Result<FlashPart, FfuError> {
    let sectors_per_block = (block_size / sector_size) as u64;
    let end_sector = last_sector
        .checked_add(1)
        .filter(|&end| end > first_sector)
        .ok_or_else(|| {
            FfuError::InvalidGpt(format!(
                "sectors {first_sector}..={last_sector} do not form a valid range"
            ))
        })?;
    let (Some(start), Some(end)) = (
        first_sector.checked_mul(sector_size as u64),
        end_sector.checked_mul(sector_size as u64),
    ) else {
        return Err(FfuError::InvalidGpt(format!(
            "sectors {first_sector}..={last_sector} lie beyond the addressable range"
        )));
    };
    if first_sector % sectors_per_block != 0 || end_sector % sectors_per_block != 0 {
        return Err(FfuError::Alignment(format!(
            "sectors {first_sector}..={last_sector} are not aligned to {sectors_per_block}-sector blocks \
             (block size {block_size}, sector size {sector_size})"
        )));
    }
    Ok(FlashPart {
        source: PartSource::Image,
        source_offset: start,
        start_location: start,
        length: end - start,
    })
}

/// Read the GPT from the first block of `image` and split the image into
/// flash parts, skipping excluded partitions.
pub fn split_image<S: Read + Seek>(
    image: &mut S,
    opts: &SplitOptions<'_>,
) -> Result<SplitResult, FfuError> {
    let block_size = opts.block_size;
    let sector_size = opts.sector_size;
    if sector_size == 0 || block_size == 0 || block_size % sector_size != 0 {
        return Err(FfuError::Alignment(format!(
            "block size {block_size} is not a multiple of sector size {sector_size}"
        )));
    }

    let image_len = image.seek(SeekFrom::End(0))?;
    if image_len < block_size as u64 {
        return Err(FfuError::InvalidGpt(format!(
            "image is {image_len} bytes, shorter than one {block_size}-byte block"
        )));
    }
    image.seek(SeekFrom::Start(0))?;
    let mut block = vec![0u8; block_size as usize];
    image.read_exact(&mut block)?;

    let (_, header) = GptHeader::locate(&block, sector_size)?;
    let required = header.table_end(sector_size)?;
    if (block_size as u64) < required {
        return Err(FfuError::Alignment(format!(
            "block size {block_size} cannot hold the GPT header and table ({required} bytes)"
        )));
    }

    let gpt = Gpt::parse(&block, sector_size)?;
    if block_size as u64 != required {
        if let Some(p) = gpt
            .partitions
            .iter()
            .find(|p| p.first_sector < (block_size / sector_size) as u64)
        {
            return Err(FfuError::Alignment(format!(
                "partition {} starts at sector {}, inside the GPT block",
                p.name, p.first_sector
            )));
        }
    }
    gpt.rebuild(&mut block)?;

    let unlock_states = detect_unlock_states(&gpt);
    if !unlock_states.is_empty() {
        info!("Detected unlock state(s): {unlock_states:?}");
    }

    let gpt_block: Arc<[u8]> = Arc::from(block);
    let mut flash_parts = vec![FlashPart {
        source: PartSource::Buffer(Arc::clone(&gpt_block)),
        source_offset: 0,
        start_location: 0,
        length: block_size as u64,
    }];

    let mut current: Option<(u64, u64)> = None;
    for p in gpt.sorted_partitions() {
        if p.end_offset(sector_size).map_or(true, |end| end > image_len) {
            return Err(FfuError::InvalidGpt(format!(
                "partition {} ends at sector {}, past the end of the image",
                p.name, p.last_sector
            )));
        }

        if is_excluded(&p.name, opts.excluded, &unlock_states) {
            debug!("Excluding partition {}", p.name);
            if let Some((first, last)) = current.take() {
                flash_parts.push(make_flash_part(first, last, block_size, sector_size)?);
            }
            continue;
        }

        match current.as_mut() {
            Some(range) => range.1 = range.1.max(p.last_sector),
            None => current = Some((p.first_sector, p.last_sector)),
        }
    }
    if let Some((first, last)) = current {
        flash_parts.push(make_flash_part(first, last, block_size, sector_size)?);
    }

    debug!(
        "Split image into {} flash part(s) from {} partition(s)",
        flash_parts.len(),
        gpt.partitions.len()
    );

    Ok(SplitResult {
        gpt,
        gpt_block,
        flash_parts,
        unlock_states,
        image_len,
    })
}
