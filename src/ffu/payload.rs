//! Block payload generation: one payload per emitted block, each carrying
//! its hash, its device locations and where its bytes come from.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use log::debug;

use super::structs::{DiskLocation, WriteDescriptor};
use super::{empty_block_hash, hash_block, BlockHash};
use crate::error::FfuError;
use crate::partition::{FlashPart, PartSource, SplitResult};

/// Where a payload's block is read from when the container is written.
#[derive(Debug, Clone)]
pub enum BlockSource {
    /// `block_size` bytes at `offset` in the source image.
    Image { offset: u64 },
    /// `block_size` bytes at `offset` in an in-memory buffer.
    Buffer { data: Arc<[u8]>, offset: u64 },
    /// An all-zero block.
    Zeroes,
}

impl BlockSource {
    /// Fill `buf` with the block's bytes.
    pub fn read_into<S: Read + Seek>(&self, image: &mut S, buf: &mut [u8]) -> Result<(), FfuError> {
        match self {
            BlockSource::Image { offset } => {
                image.seek(SeekFrom::Start(*offset))?;
                image.read_exact(buf)?;
            }
            BlockSource::Buffer { data, offset } => {
                let start = *offset as usize;
                let block = data.get(start..start + buf.len()).ok_or_else(|| {
                    FfuError::Alignment(format!(
                        "block at buffer offset {start} runs past the {}-byte buffer",
                        data.len()
                    ))
                })?;
                buf.copy_from_slice(block);
            }
            BlockSource::Zeroes => buf.fill(0),
        }
        Ok(())
    }
}

/// One block of store data with its write descriptor.
#[derive(Debug, Clone)]
pub struct BlockPayload {
    pub hash: BlockHash,
    pub descriptor: WriteDescriptor,
    pub source: BlockSource,
}

/// Payloads produced for the flash parts, plus how many blank blocks were
/// left out.
#[derive(Debug, Clone, Default)]
pub struct GeneratedPayloads {
    pub payloads: Vec<BlockPayload>,
    pub elided_blocks: u64,
}

/// Tracks the current run of blank blocks.
///
/// At most `budget` blank blocks of a run are buffered; they are emitted
/// when the run ends or when the budget is exhausted, and any further blank
/// blocks of that run are dropped.
struct BlankRun {
    budget: u32,
    count: u32,
    pending: Vec<BlockPayload>,
    dropped: u64,
}

impl BlankRun {
    fn new(budget: u32) -> Self {
        Self {
            budget,
            count: 0,
            pending: Vec::new(),
            dropped: 0,
        }
    }

    fn flush(&mut self, out: &mut Vec<BlockPayload>) {
        out.append(&mut self.pending);
    }

    fn push_blank(&mut self, payload: BlockPayload, out: &mut Vec<BlockPayload>) {
        if self.count < self.budget {
            self.pending.push(payload);
            self.count += 1;
        } else {
            self.flush(out);
            self.dropped += 1;
        }
    }

    fn push_data(&mut self, payload: BlockPayload, out: &mut Vec<BlockPayload>) {
        self.flush(out);
        self.count = 0;
        out.push(payload);
    }

    fn finish_part(&mut self, out: &mut Vec<BlockPayload>) {
        self.flush(out);
        self.count = 0;
    }
}

fn block_source(part: &FlashPart, offset_in_part: u64) -> BlockSource {
    let offset = part.source_offset + offset_in_part;
    match &part.source {
        PartSource::Image => BlockSource::Image { offset },
        PartSource::Buffer(data) => BlockSource::Buffer {
            data: Arc::clone(data),
            offset,
        },
    }
}

fn device_block_index(index: u64) -> Result<u32, FfuError> {
    u32::try_from(index).map_err(|_| FfuError::AddressSpace { block_index: index })
}

/// Hash every block of `parts` and build their payloads, eliding blank
/// runs longer than `max_blank_blocks`.
///
/// `progress_cb` receives (blocks processed, total blocks).
pub fn generate_payloads<S: Read + Seek>(
    image: &mut S,
    parts: &[FlashPart],
    block_size: u32,
    max_blank_blocks: u32,
    progress_cb: &mut impl FnMut(u64, u64),
    cancel_check: &impl Fn() -> bool,
) -> Result<GeneratedPayloads, FfuError> {
    let bs = block_size as u64;
    let empty_hash = empty_block_hash(block_size);
    let total_blocks: u64 = parts.iter().map(|p| p.block_count(block_size)).sum();

    let mut payloads = Vec::new();
    let mut blanks = BlankRun::new(max_blank_blocks);
    let mut buf = vec![0u8; block_size as usize];
    let mut done: u64 = 0;

    for part in parts {
        if part.start_location % bs != 0 || part.length % bs != 0 {
            return Err(FfuError::Alignment(format!(
                "flash part at byte {} ({} bytes) is not aligned to {block_size}-byte blocks",
                part.start_location, part.length
            )));
        }
        let first_block = part.start_location / bs;
        let block_count = part.block_count(block_size);
        device_block_index(first_block + block_count.saturating_sub(1))?;

        let mut reader = part.open(image)?;
        for i in 0..block_count {
            if cancel_check() {
                return Err(FfuError::Cancelled);
            }
            reader.read_exact(&mut buf)?;
            let hash = hash_block(&buf);
            let payload = BlockPayload {
                hash,
                descriptor: WriteDescriptor::single(DiskLocation::from_start(
                    device_block_index(first_block + i)?,
                )),
                source: block_source(part, i * bs),
            };
            if hash == empty_hash {
                blanks.push_blank(payload, &mut payloads);
            } else {
                blanks.push_data(payload, &mut payloads);
            }
            done += 1;
            progress_cb(done, total_blocks);
        }
        blanks.finish_part(&mut payloads);
    }

    debug!(
        "Generated {} block payload(s), elided {} blank block(s)",
        payloads.len(),
        blanks.dropped
    );
    Ok(GeneratedPayloads {
        payloads,
        elided_blocks: blanks.dropped,
    })
}

/// Payload that zeroes both GPT copies before anything else is written.
pub fn erase_payload(block_size: u32) -> BlockPayload {
    BlockPayload {
        hash: empty_block_hash(block_size),
        descriptor: WriteDescriptor {
            block_count: 1,
            locations: vec![DiskLocation::from_start(0), DiskLocation::from_end(0)],
            stored_data_size: None,
        },
        source: BlockSource::Zeroes,
    }
}

/// Payload written last at the final device block: the rebuilt primary GPT
/// for fixed-size stores, otherwise the last block of the source image.
///
/// Only fixed-size stores write the primary GPT a second time. A growable
/// store writes it once, at `FromStart 0`, and its final block carries the
/// source's trailing sectors (the backup GPT) so the device keeps a backup
/// table at its real end. Either way a store gets exactly three GPT-related
/// payloads.
pub fn terminal_payload<S: Read + Seek>(
    image: &mut S,
    split: &SplitResult,
    block_size: u32,
    fixed_size: bool,
) -> Result<BlockPayload, FfuError> {
    let source = if fixed_size {
        BlockSource::Buffer {
            data: Arc::clone(&split.gpt_block),
            offset: 0,
        }
    } else {
        BlockSource::Image {
            offset: split.image_len - block_size as u64,
        }
    };
    let mut buf = vec![0u8; block_size as usize];
    source.read_into(image, &mut buf)?;
    Ok(BlockPayload {
        hash: hash_block(&buf),
        descriptor: WriteDescriptor::single(DiskLocation::from_end(0)),
        source,
    })
}

/// The complete, ordered payload list of one store: the erase payload, the
/// flash part blocks (the rebuilt GPT first) and the terminal payload.
pub fn build_store_payloads<S: Read + Seek>(
    image: &mut S,
    split: &SplitResult,
    block_size: u32,
    max_blank_blocks: u32,
    fixed_size: bool,
    progress_cb: &mut impl FnMut(u64, u64),
    cancel_check: &impl Fn() -> bool,
) -> Result<GeneratedPayloads, FfuError> {
    let generated = generate_payloads(
        image,
        &split.flash_parts,
        block_size,
        max_blank_blocks,
        progress_cb,
        cancel_check,
    )?;

    let mut payloads = Vec::with_capacity(generated.payloads.len() + 2);
    payloads.push(erase_payload(block_size));
    payloads.extend(generated.payloads);
    payloads.push(terminal_payload(image, split, block_size, fixed_size)?);

    Ok(GeneratedPayloads {
        payloads,
        elided_blocks: generated.elided_blocks,
    })
}
