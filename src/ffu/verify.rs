//! Hash table verification of an opened container.

use std::io::{Read, Seek};

use log::{debug, info};
use serde::Serialize;

use super::hash_block;
use super::reader::FfuImage;
use crate::error::{hex, FfuError, HashRegion};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub header_chunks: u64,
    pub data_blocks: u64,
    pub catalog_size: u32,
}

fn compare(
    table: &[u8],
    entry: u64,
    region: HashRegion,
    block_index: u64,
    data: &[u8],
) -> Result<(), FfuError> {
    let start = entry as usize * 32;
    let expected = &table[start..start + 32];
    let actual = hash_block(data);
    if expected != actual {
        return Err(FfuError::HashMismatch {
            region,
            block_index,
            expected: hex(expected),
            actual: hex(&actual),
        });
    }
    Ok(())
}

/// Recompute the SHA-256 of every header chunk and every logical data block
/// and compare against the container's hash table.
///
/// Data block indices count across stores in container order.
/// `progress_cb` receives (entries checked, total entries).
pub fn verify<R: Read + Seek>(
    image: &mut FfuImage<R>,
    progress_cb: &mut impl FnMut(u64, u64),
    cancel_check: &impl Fn() -> bool,
) -> Result<VerifyReport, FfuError> {
    let block_size = image.block_size() as usize;
    let header_region = image.header_region()?;
    let header_chunks = header_region.len().div_ceil(block_size) as u64;
    let data_blocks: u64 = image
        .stores
        .iter()
        .flat_map(|s| s.write_descriptors.iter())
        .map(|wd| wd.block_count as u64)
        .sum();
    let total = header_chunks + data_blocks;
    let table_entries = image.hash_table.len() as u64 / 32;
    if table_entries != total {
        return Err(FfuError::MalformedRecord(format!(
            "hash table has {table_entries} entries, container has {header_chunks} header chunk(s) and {data_blocks} block(s)"
        )));
    }
    let table = image.hash_table.clone();

    let mut entry: u64 = 0;
    for (i, chunk) in header_region.chunks(block_size).enumerate() {
        compare(&table, entry, HashRegion::Header, i as u64, chunk)?;
        entry += 1;
        progress_cb(entry, total);
    }
    debug!("{header_chunks} header chunk(s) verified");

    let mut block_index: u64 = 0;
    for store in 0..image.stores.len() {
        for descriptor in 0..image.stores[store].write_descriptors.len() {
            if cancel_check() {
                return Err(FfuError::Cancelled);
            }
            let data = image.read_descriptor_data(store, descriptor)?;
            for block in data.chunks(block_size) {
                compare(&table, entry, HashRegion::BlockData, block_index, block)?;
                entry += 1;
                block_index += 1;
            }
            progress_cb(entry, total);
        }
    }

    info!("Verified {header_chunks} header chunk(s) and {data_blocks} data block(s)");
    Ok(VerifyReport {
        header_chunks,
        data_blocks,
        catalog_size: image.security.catalog_size,
    })
}
