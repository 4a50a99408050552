//! Container assembly.
//!
//! Layout, every section padded to the block size:
//! security header, catalog, hash table | image header, manifest, device
//! targets | one section per store (header, write descriptors) | block data
//! of store 1, store 2, ...

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use log::{debug, info};
use serde::Serialize;

use super::manifest::{build_manifest, FullFlashParams, StoreParams};
use super::payload::{build_store_payloads, BlockPayload};
use super::structs::{
    DeviceTargetInfo, FormatVersion, ImageHeader, SecurityHeader, StoreExtension, StoreHeader,
    SECURITY_HEADER_SIZE, SHA256_ALGORITHM_ID,
};
use super::{hash_block, write_padding};
use crate::compress::{BlockCodec, CompressionAlgorithm};
use crate::error::FfuError;
use crate::partition::splitter::is_excluded;
use crate::partition::{format_size, split_image, SplitOptions, SplitResult, UnlockState};
use crate::sign::CatalogSigner;

/// One source disk and the device it targets.
pub struct StoreInput<S> {
    pub source: S,
    /// Target device path, recorded in V2 store headers and the manifest.
    pub device_path: String,
    /// Whether the target device has exactly the size of the source image.
    pub fixed_size: bool,
    pub max_blank_blocks: u32,
    pub excluded_partitions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FfuOptions {
    pub format: FormatVersion,
    pub block_size: u32,
    pub sector_size: u32,
    pub platform_ids: Vec<String>,
    /// Required by, and only allowed with, `FormatVersion::V1Compressed`.
    pub compression: Option<CompressionAlgorithm>,
    pub os_version: String,
    pub description: String,
    pub device_targets: Vec<DeviceTargetInfo>,
}

impl Default for FfuOptions {
    fn default() -> Self {
        Self {
            format: FormatVersion::V1,
            block_size: 0x20000,
            sector_size: 512,
            platform_ids: Vec::new(),
            compression: None,
            os_version: String::new(),
            description: String::new(),
            device_targets: Vec::new(),
        }
    }
}

impl FfuOptions {
    pub fn validate(&self, store_count: usize) -> Result<(), FfuError> {
        if self.sector_size < 512 || !self.sector_size.is_power_of_two() {
            return Err(FfuError::InvalidConfig(format!(
                "sector size {} is not a power of two of at least 512",
                self.sector_size
            )));
        }
        if self.block_size == 0
            || self.block_size % 1024 != 0
            || self.block_size % self.sector_size != 0
        {
            return Err(FfuError::InvalidConfig(format!(
                "block size {} is not a multiple of 1 KiB and of the sector size {}",
                self.block_size, self.sector_size
            )));
        }
        match (self.format.is_compressed(), self.compression) {
            (true, None) => {
                return Err(FfuError::InvalidConfig(
                    "compressed format requires a compression algorithm".into(),
                ))
            }
            (false, Some(alg)) => {
                return Err(FfuError::InvalidConfig(format!(
                    "compression {alg} requires the v1-compressed format"
                )))
            }
            _ => {}
        }
        if store_count == 0 {
            return Err(FfuError::InvalidConfig("no store inputs given".into()));
        }
        if self.format != FormatVersion::V2 && store_count > 1 {
            return Err(FfuError::InvalidConfig(format!(
                "{} stores given, {} containers hold exactly one",
                store_count,
                self.format.as_str()
            )));
        }
        if store_count > u16::MAX as usize {
            return Err(FfuError::InvalidConfig(format!(
                "{store_count} stores exceed the store index range"
            )));
        }
        Ok(())
    }

    fn chunk_size_kb(&self) -> u32 {
        self.block_size / 1024
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub store_index: u16,
    pub device_path: String,
    pub payload_count: usize,
    pub elided_blocks: u64,
    pub stored_bytes: u64,
    pub excluded_partitions: Vec<String>,
    pub unlock_states: Vec<UnlockState>,
}

/// What was written.
#[derive(Debug, Clone, Serialize)]
pub struct FfuSummary {
    pub format: FormatVersion,
    pub block_size: u32,
    /// Bytes before the first data block.
    pub header_bytes: u64,
    pub total_bytes: u64,
    pub hash_table_entries: usize,
    pub catalog_size: u32,
    pub stores: Vec<StoreSummary>,
}

struct StorePlan {
    split: SplitResult,
    payloads: Vec<BlockPayload>,
    elided_blocks: u64,
    excluded: Vec<String>,
    stored_bytes: u64,
}

/// Assemble a container from `stores` into `out`.
///
/// `progress_cb` receives (work units done, total); hashing the flash parts
/// and writing each payload are one unit per block. The total is exact once
/// payload generation has finished.
pub fn write_ffu<S: Read + Seek, W: Write>(
    stores: &mut [StoreInput<S>],
    options: &FfuOptions,
    codec: &dyn BlockCodec,
    signer: &dyn CatalogSigner,
    out: &mut W,
    progress_cb: &mut impl FnMut(u64, u64),
    cancel_check: &impl Fn() -> bool,
) -> Result<FfuSummary, FfuError> {
    options.validate(stores.len())?;
    let block_size = options.block_size;
    let bs = block_size as u64;

    // Split every store first so the hashing total is known up front.
    let mut splits = Vec::with_capacity(stores.len());
    for (i, store) in stores.iter_mut().enumerate() {
        let split = split_image(
            &mut store.source,
            &SplitOptions {
                block_size,
                sector_size: options.sector_size,
                excluded: &store.excluded_partitions,
            },
        )?;
        info!(
            "Store {}: {} partition(s), {} flash part(s), image {}",
            i + 1,
            split.gpt.partitions.len(),
            split.flash_parts.len(),
            format_size(split.image_len)
        );
        splits.push(split);
    }
    let hash_total: u64 = splits
        .iter()
        .flat_map(|s| s.flash_parts.iter())
        .map(|p| p.block_count(block_size))
        .sum();

    let mut plans = Vec::with_capacity(stores.len());
    let mut hashed: u64 = 0;
    for (store, split) in stores.iter_mut().zip(splits) {
        let base = hashed;
        let generated = build_store_payloads(
            &mut store.source,
            &split,
            block_size,
            store.max_blank_blocks,
            store.fixed_size,
            &mut |done, _| progress_cb(base + done, hash_total),
            cancel_check,
        )?;
        hashed += split
            .flash_parts
            .iter()
            .map(|p| p.block_count(block_size))
            .sum::<u64>();

        let excluded = split
            .gpt
            .partitions
            .iter()
            .filter(|p| is_excluded(&p.name, &store.excluded_partitions, &split.unlock_states))
            .map(|p| p.name.clone())
            .collect();
        plans.push(StorePlan {
            split,
            payloads: generated.payloads,
            elided_blocks: generated.elided_blocks,
            excluded,
            stored_bytes: 0,
        });
    }

    let payload_total: u64 = plans.iter().map(|p| p.payloads.len() as u64).sum();
    let passes = if options.compression.is_some() { 2 } else { 1 };
    let grand_total = hash_total + payload_total * passes;
    let mut done = hash_total;

    // Stored sizes must be known before the descriptors are written, so
    // blocks that shrink are spooled in payload order until then.
    let mut buf = vec![0u8; block_size as usize];
    let mut spool = None;
    if let Some(alg) = options.compression {
        let mut writer = BufWriter::new(tempfile::tempfile()?);
        for (store, plan) in stores.iter_mut().zip(plans.iter_mut()) {
            for payload in plan.payloads.iter_mut() {
                if cancel_check() {
                    return Err(FfuError::Cancelled);
                }
                payload.source.read_into(&mut store.source, &mut buf)?;
                let packed = codec.compress(alg, &buf)?;
                let size = if packed.len() < buf.len() {
                    writer.write_all(&packed)?;
                    packed.len()
                } else {
                    buf.len()
                };
                payload.descriptor.stored_data_size = Some(size as u32);
                plan.stored_bytes += size as u64;
                done += 1;
                progress_cb(done, grand_total);
            }
        }
        spool = Some(rewind_spool(writer)?);
    } else {
        for plan in plans.iter_mut() {
            plan.stored_bytes = plan
                .payloads
                .iter()
                .map(|p| p.descriptor.block_count as u64 * bs)
                .sum();
        }
    }

    let manifest = build_manifest(
        &FullFlashParams {
            version: options.format.manifest_version().to_string(),
            os_version: options.os_version.clone(),
            description: options.description.clone(),
            antitheft_version: String::new(),
            platform_ids: options.platform_ids.clone(),
        },
        &plans
            .iter()
            .zip(stores.iter())
            .enumerate()
            .map(|(i, (plan, store))| StoreParams {
                store_index: i as u16 + 1,
                device_path: store.device_path.clone(),
                sector_size: options.sector_size,
                min_sector_count: plan.split.image_len / options.sector_size as u64,
                is_main_os_store: i == 0,
                partitions: plan.split.gpt.partitions.clone(),
                skipped_partitions: plan.excluded.clone(),
            })
            .collect::<Vec<_>>(),
    );

    let mut header_region = image_header_section(options, &manifest)?;
    for (i, (plan, store)) in plans.iter().zip(stores.iter()).enumerate() {
        let section = store_section(options, plan, store, i, plans.len())?;
        header_region.extend_from_slice(&section);
    }

    let mut hash_table: Vec<u8> =
        Vec::with_capacity((header_region.len() / bs as usize + payload_total as usize) * 32);
    for chunk in header_region.chunks(block_size as usize) {
        hash_table.extend_from_slice(&hash_block(chunk));
    }
    let header_hashes = header_region.len() / block_size as usize;
    for plan in &plans {
        for payload in &plan.payloads {
            hash_table.extend_from_slice(&payload.hash);
        }
    }

    let catalog = signer.sign_catalog(&hash_table)?;
    let security = SecurityHeader {
        chunk_size_kb: options.chunk_size_kb(),
        hash_algorithm: SHA256_ALGORITHM_ID,
        catalog_size: u32::try_from(catalog.len())
            .map_err(|_| FfuError::Signing("catalog exceeds 4 GiB".into()))?,
        hash_table_size: u32::try_from(hash_table.len()).map_err(|_| {
            FfuError::InvalidConfig("hash table exceeds 4 GiB; use a larger block size".into())
        })?,
    };
    debug!(
        "Hash table: {} header chunk(s), {} block(s); catalog {} bytes",
        header_hashes,
        payload_total,
        catalog.len()
    );

    security.write_to(out)?;
    out.write_all(&catalog)?;
    out.write_all(&hash_table)?;
    let mut position = SECURITY_HEADER_SIZE as u64 + catalog.len() as u64 + hash_table.len() as u64;
    position += write_padding(out, position, bs)?;
    out.write_all(&header_region)?;
    position += header_region.len() as u64;
    let header_bytes = position;

    for (store, plan) in stores.iter_mut().zip(plans.iter()) {
        for payload in &plan.payloads {
            if cancel_check() {
                return Err(FfuError::Cancelled);
            }
            match (spool.as_mut(), payload.descriptor.stored_data_size) {
                (Some(spool), Some(size)) if size < block_size => {
                    let packed = &mut buf[..size as usize];
                    spool.read_exact(packed)?;
                    out.write_all(packed)?;
                    position += size as u64;
                }
                _ => {
                    payload.source.read_into(&mut store.source, &mut buf)?;
                    out.write_all(&buf)?;
                    position += bs;
                }
            }
            done += 1;
            progress_cb(done, grand_total);
        }
    }
    out.flush()?;

    let summary = FfuSummary {
        format: options.format,
        block_size,
        header_bytes,
        total_bytes: position,
        hash_table_entries: hash_table.len() / 32,
        catalog_size: security.catalog_size,
        stores: plans
            .iter()
            .zip(stores.iter())
            .enumerate()
            .map(|(i, (plan, store))| StoreSummary {
                store_index: i as u16 + 1,
                device_path: store.device_path.clone(),
                payload_count: plan.payloads.len(),
                elided_blocks: plan.elided_blocks,
                stored_bytes: plan.stored_bytes,
                excluded_partitions: plan.excluded.clone(),
                unlock_states: plan.split.unlock_states.clone(),
            })
            .collect(),
    };
    info!(
        "Wrote {} container: {} in {} payload(s)",
        options.format.as_str(),
        format_size(summary.total_bytes),
        payload_total
    );
    Ok(summary)
}

fn rewind_spool(writer: BufWriter<File>) -> Result<BufReader<File>, FfuError> {
    let mut file = writer
        .into_inner()
        .map_err(|e| FfuError::Io(e.into_error()))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(BufReader::new(file))
}

/// Image header, manifest and device target records, padded.
fn image_header_section(options: &FfuOptions, manifest: &str) -> Result<Vec<u8>, FfuError> {
    let header = ImageHeader {
        manifest_length: u32::try_from(manifest.len())
            .map_err(|_| FfuError::InvalidConfig("manifest exceeds 4 GiB".into()))?,
        chunk_size_kb: options.chunk_size_kb(),
        device_target_info_count: if options.device_targets.is_empty() {
            None
        } else {
            Some(options.device_targets.len() as u32)
        },
    };
    let mut section = Vec::new();
    header.write_to(&mut section)?;
    section.extend_from_slice(manifest.as_bytes());
    for target in &options.device_targets {
        target.write_to(&mut section)?;
    }
    let len = section.len() as u64;
    write_padding(&mut section, len, options.block_size as u64)?;
    Ok(section)
}

/// Store header and write descriptors, padded.
fn store_section<S>(
    options: &FfuOptions,
    plan: &StorePlan,
    store: &StoreInput<S>,
    index: usize,
    store_count: usize,
) -> Result<Vec<u8>, FfuError> {
    let mut descriptors = Vec::new();
    for payload in &plan.payloads {
        payload.descriptor.write_to(&mut descriptors)?;
    }

    let extension = match options.format {
        FormatVersion::V1 => StoreExtension::V1,
        FormatVersion::V1Compressed => StoreExtension::V1Compressed {
            compression_algorithm: options
                .compression
                .map(CompressionAlgorithm::id)
                .unwrap_or_default(),
        },
        FormatVersion::V2 => StoreExtension::V2 {
            number_of_stores: store_count as u16,
            store_index: index as u16 + 1,
            store_payload_size: plan.stored_bytes,
            device_path: store.device_path.clone(),
        },
    };

    let payload_count = u32::try_from(plan.payloads.len())
        .map_err(|_| FfuError::AddressSpace { block_index: plan.payloads.len() as u64 })?;
    let header = StoreHeader {
        update_type: 0,
        minor_version: 0,
        full_flash_minor_version: 0,
        platform_ids: options.platform_ids.clone(),
        block_size: options.block_size,
        write_descriptor_count: payload_count,
        write_descriptor_length: descriptors.len() as u32,
        validate_descriptor_count: 0,
        validate_descriptor_length: 0,
        initial_table_index: 0,
        initial_table_count: 0,
        flash_only_table_index: 0,
        flash_only_table_count: 1,
        final_table_index: payload_count.saturating_sub(1),
        final_table_count: 1,
        extension,
    };

    let mut section = Vec::with_capacity(header.encoded_len() + descriptors.len());
    header.write_to(&mut section)?;
    section.extend_from_slice(&descriptors);
    let len = section.len() as u64;
    write_padding(&mut section, len, options.block_size as u64)?;
    Ok(section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::NativeCodec;
    use crate::error::ErrorKind;
    use crate::ffu::structs::{IMAGE_SIGNATURE, SECURITY_SIGNATURE};
    use crate::partition::gpt::tests::make_gpt_buffer;
    use crate::sign::UnsignedCatalog;
    use std::io::Cursor;

    const BS: u32 = 4096;

    fn disk() -> Cursor<Vec<u8>> {
        let mut data = make_gpt_buffer(512, 16, 64 * 512, &[("A", 8, 23), ("B", 24, 55)]);
        for b in &mut data[8 * 512..24 * 512] {
            *b = 0x5A;
        }
        Cursor::new(data)
    }

    fn input(source: Cursor<Vec<u8>>) -> StoreInput<Cursor<Vec<u8>>> {
        StoreInput {
            source,
            device_path: "VenHw(860845C1-BE09-4355-8BC1-30D64FF8E63A)".into(),
            fixed_size: true,
            max_blank_blocks: 1,
            excluded_partitions: vec![],
        }
    }

    fn options(format: FormatVersion) -> FfuOptions {
        FfuOptions {
            format,
            block_size: BS,
            platform_ids: vec!["Contoso.Phone".into()],
            compression: format.is_compressed().then_some(CompressionAlgorithm::Lznt1),
            ..Default::default()
        }
    }

    fn write(
        stores: &mut [StoreInput<Cursor<Vec<u8>>>],
        opts: &FfuOptions,
    ) -> (Vec<u8>, FfuSummary) {
        let mut out = Vec::new();
        let summary = write_ffu(
            stores,
            opts,
            &NativeCodec,
            &UnsignedCatalog,
            &mut out,
            &mut |_, _| {},
            &|| false,
        )
        .unwrap();
        (out, summary)
    }

    #[test]
    fn test_layout_v1() {
        let (out, summary) = write(&mut [input(disk())], &options(FormatVersion::V1));

        assert_eq!(&out[4..16], SECURITY_SIGNATURE);
        // erase, GPT, A (2 blocks), B (1 of 4 blank), terminal
        assert_eq!(summary.stores[0].payload_count, 6);
        assert_eq!(summary.stores[0].elided_blocks, 3);
        // image header section and store section are one block each
        assert_eq!(summary.hash_table_entries, 2 + 6);
        assert_eq!(summary.header_bytes, 3 * BS as u64);
        assert_eq!(out.len() as u64, summary.total_bytes);
        assert_eq!(summary.total_bytes, (3 + 6) * BS as u64);

        let image_header = &out[BS as usize..];
        assert_eq!(&image_header[4..16], IMAGE_SIGNATURE);
    }

    #[test]
    fn test_store_tables() {
        let (out, _) = write(&mut [input(disk())], &options(FormatVersion::V1));
        let store = StoreHeader::decode(&out[2 * BS as usize..]).unwrap();
        assert_eq!(store.write_descriptor_count, 6);
        assert_eq!((store.initial_table_index, store.initial_table_count), (0, 0));
        assert_eq!((store.flash_only_table_index, store.flash_only_table_count), (0, 1));
        assert_eq!((store.final_table_index, store.final_table_count), (5, 1));
        assert_eq!(store.platform_ids, vec!["Contoso.Phone".to_string()]);
    }

    #[test]
    fn test_v2_multi_store_headers() {
        let mut stores = [input(disk()), input(disk())];
        stores[1].device_path = "VenHw(1234)".into();
        let (out, summary) = write(&mut stores, &options(FormatVersion::V2));
        assert_eq!(summary.stores.len(), 2);

        let first = StoreHeader::decode(&out[2 * BS as usize..]).unwrap();
        let second = StoreHeader::decode(&out[3 * BS as usize..]).unwrap();
        match (&first.extension, &second.extension) {
            (
                StoreExtension::V2 {
                    number_of_stores: 2,
                    store_index: 1,
                    store_payload_size,
                    ..
                },
                StoreExtension::V2 {
                    store_index: 2,
                    device_path,
                    ..
                },
            ) => {
                assert_eq!(*store_payload_size, 6 * BS as u64);
                assert_eq!(device_path, "VenHw(1234)");
            }
            other => panic!("unexpected extensions {other:?}"),
        }
    }

    #[test]
    fn test_compressed_store_sizes() {
        let (out, summary) = write(&mut [input(disk())], &options(FormatVersion::V1Compressed));
        let store = &summary.stores[0];
        assert!(store.stored_bytes < store.payload_count as u64 * BS as u64);
        assert_eq!(out.len() as u64, summary.header_bytes + store.stored_bytes);
    }

    #[test]
    fn test_v1_rejects_multiple_stores() {
        let mut stores = [input(disk()), input(disk())];
        let mut out = Vec::new();
        let err = write_ffu(
            &mut stores,
            &options(FormatVersion::V1),
            &NativeCodec,
            &UnsignedCatalog,
            &mut out,
            &mut |_, _| {},
            &|| false,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(out.is_empty());
    }

    #[test]
    fn test_options_validation() {
        let mut opts = options(FormatVersion::V1);
        assert!(opts.validate(1).is_ok());
        opts.compression = Some(CompressionAlgorithm::Lznt1);
        assert!(opts.validate(1).is_err());

        let mut opts = options(FormatVersion::V1Compressed);
        opts.compression = None;
        assert!(opts.validate(1).is_err());

        let mut opts = options(FormatVersion::V2);
        opts.block_size = 1536;
        assert!(opts.validate(1).is_err());
        opts.block_size = 4096;
        opts.sector_size = 768;
        assert!(opts.validate(1).is_err());
        opts.sector_size = 4096;
        assert!(opts.validate(3).is_ok());
        assert!(opts.validate(0).is_err());
    }

    #[test]
    fn test_cancel_before_output() {
        let mut out = Vec::new();
        let err = write_ffu(
            &mut [input(disk())],
            &options(FormatVersion::V1),
            &NativeCodec,
            &UnsignedCatalog,
            &mut out,
            &mut |_, _| {},
            &|| true,
        )
        .unwrap_err();
        assert!(matches!(err, FfuError::Cancelled));
    }

    #[test]
    fn test_progress_reaches_total() {
        let mut last = (0, 0);
        let mut out = Vec::new();
        write_ffu(
            &mut [input(disk())],
            &options(FormatVersion::V1),
            &NativeCodec,
            &UnsignedCatalog,
            &mut out,
            &mut |d, t| last = (d, t),
            &|| false,
        )
        .unwrap();
        // 7 hashed blocks (GPT, A, B), 6 payloads written
        assert_eq!(last, (13, 13));
    }
}
