//! Container parsing and the per-store virtual disk.

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};

use log::{debug, warn};
use serde::Serialize;

use super::manifest::Manifest;
use super::structs::{
    DeviceTargetInfo, DiskAccessMethod, FormatVersion, ImageHeader, SecurityHeader,
    StoreExtension, StoreHeader, ValidationDescriptor, WriteDescriptor, SECURITY_HEADER_SIZE,
    SHA256_ALGORITHM_ID,
};
use super::align_up;
use crate::compress::{BlockCodec, CompressionAlgorithm, NativeCodec};
use crate::error::FfuError;
use crate::partition::gpt::Partition;
use crate::partition::read_gpt;

/// Position of a device block inside a store's write descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRef {
    descriptor: u32,
    block: u32,
}

/// A run of device blocks backed by consecutive blocks of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    len: u64,
    descriptor: u32,
    first_block: u32,
}

impl Extent {
    /// The part of this extent starting `skip` blocks in.
    fn tail(self, skip: u64) -> Self {
        Extent {
            len: self.len - skip,
            descriptor: self.descriptor,
            first_block: self.first_block + skip as u32,
        }
    }
}

/// Non-overlapping device extents keyed by their first block. One entry per
/// descriptor location, so its size follows the descriptor table and not the
/// block counts it declares.
#[derive(Debug, Clone, Default)]
struct BlockMap {
    extents: BTreeMap<u64, Extent>,
}

impl BlockMap {
    /// Map `len` blocks at `start` to `descriptor`, replacing whatever was
    /// mapped there before.
    fn insert(&mut self, start: u64, len: u64, descriptor: u32) {
        if len == 0 {
            return;
        }
        let end = start + len;

        if let Some((&s, &e)) = self.extents.range(..start).next_back() {
            if s + e.len > start {
                if s + e.len > end {
                    self.extents.insert(end, e.tail(end - s));
                }
                self.extents.insert(
                    s,
                    Extent {
                        len: start - s,
                        ..e
                    },
                );
            }
        }

        let covered: Vec<u64> = self.extents.range(start..end).map(|(&s, _)| s).collect();
        for s in covered {
            if let Some(e) = self.extents.remove(&s) {
                if s + e.len > end {
                    self.extents.insert(end, e.tail(end - s));
                }
            }
        }

        self.extents.insert(
            start,
            Extent {
                len,
                descriptor,
                first_block: 0,
            },
        );
    }

    fn get(&self, block: u64) -> Option<BlockRef> {
        let (&s, e) = self.extents.range(..=block).next_back()?;
        (block < s + e.len).then(|| BlockRef {
            descriptor: e.descriptor,
            block: e.first_block + (block - s) as u32,
        })
    }

    fn mapped_blocks(&self) -> u64 {
        self.extents.values().map(|e| e.len).sum()
    }
}

/// A parsed store section.
#[derive(Debug, Clone)]
pub struct Store {
    pub header: StoreHeader,
    pub validation_descriptors: Vec<ValidationDescriptor>,
    pub write_descriptors: Vec<WriteDescriptor>,
    /// Absolute offset of the store's first data block.
    pub data_offset: u64,
    /// Bytes of block data stored for this store.
    pub data_len: u64,
    /// Device size in blocks, inferred from the addresses referenced.
    pub total_blocks: u64,
    descriptor_offsets: Vec<u64>,
    block_map: BlockMap,
}

impl Store {
    pub fn format(&self) -> FormatVersion {
        self.header.format()
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    /// Size of the virtual disk in bytes.
    pub fn disk_size(&self) -> u64 {
        self.total_blocks.saturating_mul(self.block_size() as u64)
    }

    /// Number of device blocks backed by data.
    pub fn mapped_blocks(&self) -> u64 {
        self.block_map.mapped_blocks()
    }

    pub fn compression(&self) -> Result<Option<CompressionAlgorithm>, FfuError> {
        match self.header.extension {
            StoreExtension::V1Compressed {
                compression_algorithm,
            } => CompressionAlgorithm::from_id(compression_algorithm).map(Some),
            _ => Ok(None),
        }
    }

    fn stored_size(&self, descriptor: &WriteDescriptor) -> u64 {
        descriptor
            .stored_data_size
            .map(u64::from)
            .unwrap_or(descriptor.block_count as u64 * self.block_size() as u64)
    }

    /// Reject descriptors whose stored bytes cannot hold the blocks they
    /// declare: raw data must match exactly, compressed data needs at least
    /// one byte per block.
    fn check_descriptor_sizes(&self) -> Result<(), FfuError> {
        let compressed = self.format().is_compressed();
        for (d, wd) in self.write_descriptors.iter().enumerate() {
            let expected = wd.block_count as u64 * self.block_size() as u64;
            let stored = self.stored_size(wd);
            let fits = if compressed {
                stored == expected || (stored >= wd.block_count as u64 && stored < expected)
            } else {
                stored == expected
            };
            if !fits {
                return Err(FfuError::MalformedRecord(format!(
                    "write descriptor {d} stores {stored} bytes for {} block(s)",
                    wd.block_count
                )));
            }
        }
        Ok(())
    }

    fn build_block_map(&mut self) -> Result<(), FfuError> {
        let mut max_from_start: Option<u64> = None;
        let mut max_from_end: Option<u64> = None;
        for wd in &self.write_descriptors {
            if wd.block_count == 0 {
                continue;
            }
            for loc in &wd.locations {
                let far = loc.block_index as u64 + wd.block_count as u64 - 1;
                let slot = match loc.access_method {
                    DiskAccessMethod::FromStart => &mut max_from_start,
                    DiskAccessMethod::FromEnd => &mut max_from_end,
                };
                *slot = Some(slot.map_or(far, |m| m.max(far)));
            }
        }
        self.total_blocks = match (max_from_start, max_from_end) {
            (s, Some(e)) => s.unwrap_or(0) + e + 2,
            (Some(s), None) => s + 1,
            (None, None) => 0,
        };

        let total = self.total_blocks;
        let mut map = BlockMap::default();
        for (d, wd) in self.write_descriptors.iter().enumerate() {
            let count = wd.block_count as u64;
            if count.saturating_mul(wd.locations.len() as u64) > total {
                return Err(FfuError::MalformedRecord(format!(
                    "write descriptor {d} writes {count} block(s) to {} location(s) on a {total}-block device",
                    wd.locations.len()
                )));
            }
            for loc in &wd.locations {
                let first = match loc.access_method {
                    DiskAccessMethod::FromStart => loc.block_index as u64,
                    DiskAccessMethod::FromEnd => total
                        .checked_sub(loc.block_index as u64 + count)
                        .ok_or(FfuError::AddressSpace {
                            block_index: loc.block_index as u64,
                        })?,
                };
                map.insert(first, count, d as u32);
            }
        }
        self.block_map = map;
        Ok(())
    }
}

/// An opened container.
pub struct FfuImage<R> {
    reader: R,
    codec: Box<dyn BlockCodec>,
    pub security: SecurityHeader,
    pub catalog: Vec<u8>,
    pub hash_table: Vec<u8>,
    pub image_header: ImageHeader,
    pub manifest_text: String,
    pub device_targets: Vec<DeviceTargetInfo>,
    pub stores: Vec<Store>,
    header_region_offset: u64,
    header_region_len: u64,
}

impl<R: Read + Seek> FfuImage<R> {
    /// Parse a container, decompressing with the native codec.
    pub fn open(reader: R) -> Result<Self, FfuError> {
        Self::open_with_codec(reader, Box::new(NativeCodec))
    }

    pub fn open_with_codec(mut reader: R, codec: Box<dyn BlockCodec>) -> Result<Self, FfuError> {
        reader.seek(SeekFrom::Start(0))?;
        let security = SecurityHeader::read_from(&mut reader)?;
        if security.hash_algorithm != SHA256_ALGORITHM_ID {
            return Err(FfuError::MalformedRecord(format!(
                "unsupported hash algorithm {:#x}",
                security.hash_algorithm
            )));
        }
        if security.chunk_size_kb == 0 {
            return Err(FfuError::MalformedRecord("chunk size is zero".into()));
        }
        if security.hash_table_size % 32 != 0 {
            return Err(FfuError::MalformedRecord(format!(
                "hash table size {} is not a multiple of 32",
                security.hash_table_size
            )));
        }
        let block_size = security.chunk_size_kb as u64 * 1024;

        let catalog = read_vec(&mut reader, security.catalog_size as usize, "catalog")?;
        let hash_table = read_vec(&mut reader, security.hash_table_size as usize, "hash table")?;

        let header_region_offset = align_up(
            SECURITY_HEADER_SIZE as u64
                + security.catalog_size as u64
                + security.hash_table_size as u64,
            block_size,
        );
        reader.seek(SeekFrom::Start(header_region_offset))?;

        let image_header = ImageHeader::read_from(&mut reader)?;
        if image_header.chunk_size_kb != security.chunk_size_kb {
            warn!(
                "Image header chunk size {} KiB differs from security header {} KiB",
                image_header.chunk_size_kb, security.chunk_size_kb
            );
        }
        let manifest_bytes = read_vec(
            &mut reader,
            image_header.manifest_length as usize,
            "manifest",
        )?;
        let manifest_text = String::from_utf8_lossy(&manifest_bytes)
            .trim_end_matches('\0')
            .to_string();
        let mut device_targets = Vec::new();
        for _ in 0..image_header.device_target_info_count.unwrap_or(0) {
            device_targets.push(DeviceTargetInfo::read_from(&mut reader)?);
        }
        let mut pos = reader.stream_position()?;
        pos = align_up(pos, block_size);

        let mut stores: Vec<Store> = Vec::new();
        let mut store_count = 1usize;
        while stores.len() < store_count {
            reader.seek(SeekFrom::Start(pos))?;
            let store = read_store(&mut reader)?;
            if store.header.block_size as u64 != block_size {
                return Err(FfuError::MalformedRecord(format!(
                    "store block size {} differs from chunk size {block_size}",
                    store.header.block_size
                )));
            }
            if let StoreExtension::V2 {
                number_of_stores,
                store_index,
                ..
            } = &store.header.extension
            {
                if stores.is_empty() {
                    store_count = (*number_of_stores).max(1) as usize;
                }
                if *store_index as usize != stores.len() + 1 {
                    warn!(
                        "Store {} declares index {store_index}",
                        stores.len() + 1
                    );
                }
            }
            pos = align_up(
                pos + store.header.encoded_len() as u64
                    + store.header.validate_descriptor_length as u64
                    + store.header.write_descriptor_length as u64,
                block_size,
            );
            stores.push(store);
        }
        let header_region_len = pos - header_region_offset;

        let mut data_offset = pos;
        for store in stores.iter_mut() {
            store.data_offset = data_offset;
            let mut offset = data_offset;
            let mut offsets = Vec::with_capacity(store.write_descriptors.len());
            for wd in &store.write_descriptors {
                offsets.push(offset);
                offset += store.stored_size(wd);
            }
            store.descriptor_offsets = offsets;
            store.data_len = offset - data_offset;
            data_offset = offset;
        }

        let file_len = reader.seek(SeekFrom::End(0))?;
        if data_offset > file_len {
            return Err(FfuError::MalformedRecord(format!(
                "block data ends at byte {data_offset}, container holds {file_len}"
            )));
        }

        for store in stores.iter_mut() {
            store.check_descriptor_sizes()?;
            store.build_block_map()?;
            debug!(
                "Store {}: {} descriptor(s), {} mapped of {} block(s)",
                store.format().as_str(),
                store.write_descriptors.len(),
                store.mapped_blocks(),
                store.total_blocks
            );
        }

        Ok(Self {
            reader,
            codec,
            security,
            catalog,
            hash_table,
            image_header,
            manifest_text,
            device_targets,
            stores,
            header_region_offset,
            header_region_len,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.security.chunk_size_kb * 1024
    }

    pub fn format(&self) -> Option<FormatVersion> {
        self.stores.first().map(Store::format)
    }

    /// The image header, manifest and store sections as stored, padding included.
    pub fn header_region(&mut self) -> Result<Vec<u8>, FfuError> {
        self.reader.seek(SeekFrom::Start(self.header_region_offset))?;
        read_vec(&mut self.reader, self.header_region_len as usize, "header region")
    }

    /// Logical (decompressed) bytes of one write descriptor.
    pub fn read_descriptor_data(
        &mut self,
        store: usize,
        descriptor: usize,
    ) -> Result<Vec<u8>, FfuError> {
        let s = self
            .stores
            .get(store)
            .ok_or_else(|| FfuError::InvalidConfig(format!("no store {}", store + 1)))?;
        let wd = s.write_descriptors.get(descriptor).ok_or_else(|| {
            FfuError::MalformedRecord(format!("store has no write descriptor {descriptor}"))
        })?;
        let expected = wd.block_count as usize * s.block_size() as usize;
        let stored = s.stored_size(wd) as usize;
        let compression = s.compression()?;

        self.reader
            .seek(SeekFrom::Start(s.descriptor_offsets[descriptor]))?;
        let data = read_vec(&mut self.reader, stored, "block data")?;
        match compression {
            Some(alg) if stored != expected => self.codec.decompress(alg, &data, expected),
            _ if stored != expected => Err(FfuError::MalformedRecord(format!(
                "write descriptor {descriptor} stores {stored} bytes for {} block(s)",
                wd.block_count
            ))),
            _ => Ok(data),
        }
    }

    /// A seekable view of the device written by `store`.
    pub fn store_disk(&mut self, store: usize) -> Result<StoreDisk<'_, R>, FfuError> {
        if store >= self.stores.len() {
            return Err(FfuError::InvalidConfig(format!(
                "container has {} store(s), store {} requested",
                self.stores.len(),
                store + 1
            )));
        }
        Ok(StoreDisk {
            image: self,
            store,
            position: 0,
            cache: None,
        })
    }

    /// Summary of the container, including the GPT found on each store's disk.
    pub fn info(&mut self) -> Result<ContainerInfo, FfuError> {
        let manifest = Manifest::parse(&self.manifest_text).unwrap_or_else(|e| {
            warn!("Cannot parse manifest: {e}");
            Manifest::default()
        });
        let sector_size = manifest
            .get("Store", "SectorSize")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(512);

        let mut stores = Vec::with_capacity(self.stores.len());
        for i in 0..self.stores.len() {
            let partitions = {
                let mut disk = self.store_disk(i)?;
                match read_gpt(&mut disk, sector_size) {
                    Ok(gpt) => Some(gpt.partitions),
                    Err(e) => {
                        debug!("Store {}: no GPT on virtual disk: {e}", i + 1);
                        None
                    }
                }
            };
            let s = &self.stores[i];
            stores.push(StoreInfo {
                index: i + 1,
                header: s.header.clone(),
                write_descriptor_count: s.write_descriptors.len(),
                mapped_blocks: s.mapped_blocks(),
                total_blocks: s.total_blocks,
                disk_size: s.disk_size(),
                data_offset: s.data_offset,
                data_len: s.data_len,
                partitions,
            });
        }

        Ok(ContainerInfo {
            format: self.format(),
            block_size: self.block_size(),
            security: self.security.clone(),
            image_header: self.image_header.clone(),
            hash_table_entries: self.hash_table.len() / 32,
            manifest,
            device_targets: self.device_targets.clone(),
            stores,
        })
    }
}

fn read_vec(r: &mut impl Read, len: usize, what: &str) -> Result<Vec<u8>, FfuError> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(crate::error::truncated(what))?;
    Ok(buf)
}

fn read_store(r: &mut impl Read) -> Result<Store, FfuError> {
    let header = StoreHeader::read_from(r)?;

    let mut validation_descriptors = Vec::with_capacity(header.validate_descriptor_count as usize);
    let vd_bytes = read_vec(
        r,
        header.validate_descriptor_length as usize,
        "validation descriptors",
    )?;
    let mut vd_slice = &vd_bytes[..];
    for _ in 0..header.validate_descriptor_count {
        validation_descriptors.push(ValidationDescriptor::read_from(&mut vd_slice)?);
    }

    let wd_bytes = read_vec(
        r,
        header.write_descriptor_length as usize,
        "write descriptors",
    )?;
    let compressed = header.format().is_compressed();
    let mut wd_slice = &wd_bytes[..];
    let mut write_descriptors = Vec::with_capacity(header.write_descriptor_count as usize);
    for _ in 0..header.write_descriptor_count {
        write_descriptors.push(WriteDescriptor::read_from(&mut wd_slice, compressed)?);
    }
    if !wd_slice.is_empty() {
        warn!(
            "{} trailing byte(s) after {} write descriptor(s)",
            wd_slice.len(),
            write_descriptors.len()
        );
    }

    Ok(Store {
        header,
        validation_descriptors,
        write_descriptors,
        data_offset: 0,
        data_len: 0,
        total_blocks: 0,
        descriptor_offsets: Vec::new(),
        block_map: BlockMap::default(),
    })
}

/// Byte-addressable view of one store's target device. Blocks no write
/// descriptor covers read as zeros.
pub struct StoreDisk<'a, R> {
    image: &'a mut FfuImage<R>,
    store: usize,
    position: u64,
    cache: Option<(u32, Vec<u8>)>,
}

impl<R: Read + Seek> StoreDisk<'_, R> {
    pub fn len(&self) -> u64 {
        self.image.stores[self.store].disk_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the block at `block` into `buf`. Returns false for an unmapped
    /// block, leaving `buf` zeroed.
    pub fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<bool, FfuError> {
        let block_size = self.image.stores[self.store].block_size() as usize;
        let Some(r) = self.image.stores[self.store].block_map.get(block) else {
            buf[..block_size].fill(0);
            return Ok(false);
        };
        let cached = matches!(&self.cache, Some((d, _)) if *d == r.descriptor);
        if !cached {
            let data = self
                .image
                .read_descriptor_data(self.store, r.descriptor as usize)?;
            self.cache = Some((r.descriptor, data));
        }
        if let Some((_, data)) = &self.cache {
            let start = r.block as usize * block_size;
            buf[..block_size].copy_from_slice(&data[start..start + block_size]);
        }
        Ok(true)
    }

    pub fn is_mapped(&self, block: u64) -> bool {
        self.image.stores[self.store].block_map.get(block).is_some()
    }
}

impl<R: Read + Seek> Read for StoreDisk<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.len();
        if self.position >= len || buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.image.stores[self.store].block_size() as u64;
        let block = self.position / block_size;
        let offset = (self.position % block_size) as usize;
        let n = (block_size as usize - offset)
            .min(buf.len())
            .min((len - self.position) as usize);

        let mut block_buf = vec![0u8; block_size as usize];
        self.read_block(block, &mut block_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        buf[..n].copy_from_slice(&block_buf[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for StoreDisk<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.len() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    /// 1-based store index.
    pub index: usize,
    pub header: StoreHeader,
    pub write_descriptor_count: usize,
    pub mapped_blocks: u64,
    pub total_blocks: u64,
    pub disk_size: u64,
    pub data_offset: u64,
    pub data_len: u64,
    pub partitions: Option<Vec<Partition>>,
}

/// Inspection summary of a container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub format: Option<FormatVersion>,
    pub block_size: u32,
    pub security: SecurityHeader,
    pub image_header: ImageHeader,
    pub hash_table_entries: usize,
    pub manifest: Manifest,
    pub device_targets: Vec<DeviceTargetInfo>,
    pub stores: Vec<StoreInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffu::structs::DiskLocation;
    use crate::ffu::writer::{write_ffu, FfuOptions, StoreInput};
    use crate::partition::gpt::tests::make_gpt_buffer;
    use crate::sign::UnsignedCatalog;
    use std::io::Cursor;

    const BS: u32 = 4096;

    fn source_disk() -> Vec<u8> {
        let mut data = make_gpt_buffer(512, 16, 64 * 512, &[("A", 8, 23), ("B", 24, 55)]);
        for (i, b) in data[8 * 512..24 * 512].iter_mut().enumerate() {
            *b = (i % 251) as u8 + 1;
        }
        // last block of B carries data, so B's middle blocks form a blank run
        data[55 * 512] = 0x77;
        data[63 * 512] = 0xEE;
        data
    }

    fn build(format: FormatVersion, fixed: bool) -> (Vec<u8>, Vec<u8>) {
        let disk = source_disk();
        let opts = FfuOptions {
            format,
            block_size: BS,
            compression: format
                .is_compressed()
                .then_some(CompressionAlgorithm::Lznt1),
            ..Default::default()
        };
        (write_container(disk.clone(), &opts, fixed), disk)
    }

    fn write_container(disk: Vec<u8>, opts: &FfuOptions, fixed: bool) -> Vec<u8> {
        let mut stores = [StoreInput {
            source: Cursor::new(disk),
            device_path: "VenHw(1)".into(),
            fixed_size: fixed,
            max_blank_blocks: 1,
            excluded_partitions: vec![],
        }];
        let mut out = Vec::new();
        write_ffu(
            &mut stores,
            opts,
            &NativeCodec,
            &UnsignedCatalog,
            &mut out,
            &mut |_, _| {},
            &|| false,
        )
        .unwrap();
        out
    }

    fn read_disk(container: Vec<u8>) -> Vec<u8> {
        let mut image = FfuImage::open(Cursor::new(container)).unwrap();
        let mut disk = image.store_disk(0).unwrap();
        let mut out = Vec::new();
        disk.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_parse_headers() {
        let (container, _) = build(FormatVersion::V1, true);
        let image = FfuImage::open(Cursor::new(container)).unwrap();
        assert_eq!(image.block_size(), BS);
        assert_eq!(image.format(), Some(FormatVersion::V1));
        assert_eq!(image.stores.len(), 1);
        assert!(image.manifest_text.starts_with("[FullFlash]"));
        assert!(image.catalog.is_empty());
        assert_eq!(image.stores[0].write_descriptors.len(), 7);
    }

    #[test]
    fn test_virtual_disk_round_trip() {
        let (container, source) = build(FormatVersion::V1, false);
        let disk = read_disk(container);
        // highest FromStart block is 6, so the disk spans 6 + 0 + 2 blocks
        assert_eq!(disk.len(), source.len());
        assert_eq!(disk, source_with_rebuilt_gpt(&source));
    }

    #[test]
    fn test_compressed_round_trip() {
        let (container, source) = build(FormatVersion::V1Compressed, false);
        assert_eq!(read_disk(container), source_with_rebuilt_gpt(&source));
    }

    /// Pseudo-random bytes that LZNT1 cannot shrink.
    fn noise(buf: &mut [u8], mut seed: u32) {
        for b in buf.iter_mut() {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            *b = (seed >> 16) as u8;
        }
    }

    #[test]
    fn test_incompressible_blocks_are_stored_raw() {
        let mut disk = source_disk();
        noise(&mut disk[8 * 512..24 * 512], 7);
        let opts = FfuOptions {
            format: FormatVersion::V1Compressed,
            block_size: BS,
            compression: Some(CompressionAlgorithm::Lznt1),
            ..Default::default()
        };
        let container = write_container(disk.clone(), &opts, false);

        let mut image = FfuImage::open(Cursor::new(container)).unwrap();
        let sizes: Vec<u32> = image.stores[0]
            .write_descriptors
            .iter()
            .map(|wd| wd.stored_data_size.unwrap())
            .collect();
        // blocks 1 and 2 hold partition A
        assert_eq!(sizes.iter().filter(|&&s| s == BS).count(), 2);
        assert!(sizes.iter().any(|&s| s < BS));

        crate::ffu::verify::verify(&mut image, &mut |_, _| {}, &|| false).unwrap();
        let mut out = Vec::new();
        image.store_disk(0).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, source_with_rebuilt_gpt(&disk));
    }

    #[test]
    fn test_device_targets_round_trip() {
        let targets = vec![
            DeviceTargetInfo {
                manufacturer: "Contoso".into(),
                family: "Phone".into(),
                product_name: "Lumia X".into(),
                product_version: "1.0".into(),
                sku_number: "SKU-1".into(),
                baseboard_manufacturer: "Contoso".into(),
                baseboard_product: "BB-7".into(),
            },
            DeviceTargetInfo {
                manufacturer: "Fabrikam".into(),
                product_name: "Tablet".into(),
                ..Default::default()
            },
        ];
        let opts = FfuOptions {
            format: FormatVersion::V1,
            block_size: BS,
            device_targets: targets.clone(),
            ..Default::default()
        };
        let disk = source_disk();
        let container = write_container(disk.clone(), &opts, false);

        let mut image = FfuImage::open(Cursor::new(container)).unwrap();
        assert_eq!(image.image_header.size(), 28);
        assert_eq!(image.image_header.device_target_info_count, Some(2));
        assert_eq!(image.device_targets, targets);
        assert!(image.manifest_text.starts_with("[FullFlash]"));

        crate::ffu::verify::verify(&mut image, &mut |_, _| {}, &|| false).unwrap();
        let mut out = Vec::new();
        image.store_disk(0).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, source_with_rebuilt_gpt(&disk));
    }

    #[test]
    fn test_fixed_store_ends_with_gpt() {
        let (container, source) = build(FormatVersion::V2, true);
        let disk = read_disk(container);
        let bs = BS as usize;
        assert_eq!(disk.len(), source.len());
        assert_eq!(&disk[disk.len() - bs..], &disk[..bs]);
        assert_ne!(&disk[disk.len() - bs..], &source[source.len() - bs..]);
    }

    fn source_with_rebuilt_gpt(source: &[u8]) -> Vec<u8> {
        let mut expected = source.to_vec();
        let gpt = crate::partition::gpt::Gpt::parse(&expected[..BS as usize], 512).unwrap();
        gpt.rebuild(&mut expected[..BS as usize]).unwrap();
        expected
    }

    #[test]
    fn test_unaligned_reads_and_seek() {
        let (container, source) = build(FormatVersion::V1, false);
        let expected = source_with_rebuilt_gpt(&source);
        let mut image = FfuImage::open(Cursor::new(container)).unwrap();
        let mut disk = image.store_disk(0).unwrap();

        for &(offset, len) in &[(4000u64, 200usize), (8191, 3), (12_000, 9000), (0, 1)] {
            disk.seek(SeekFrom::Start(offset)).unwrap();
            let mut buf = vec![0u8; len];
            disk.read_exact(&mut buf).unwrap();
            assert_eq!(&buf[..], &expected[offset as usize..offset as usize + len]);
        }
        assert_eq!(disk.seek(SeekFrom::End(0)).unwrap(), expected.len() as u64);
        let mut buf = [0u8; 4];
        assert_eq!(disk.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_elided_blocks_read_as_zero() {
        let (container, _) = build(FormatVersion::V1, false);
        let mut image = FfuImage::open(Cursor::new(container)).unwrap();
        let mut disk = image.store_disk(0).unwrap();
        // B spans blocks 3..=6; budget 1 keeps block 3 of the blank run
        assert!(disk.is_mapped(3));
        assert!(!disk.is_mapped(4));
        assert!(!disk.is_mapped(5));
        assert!(disk.is_mapped(6));
        let mut buf = vec![0xFFu8; BS as usize];
        assert!(!disk.read_block(5, &mut buf).unwrap());
        assert!(buf.iter().all(|&b| b == 0));
    }

    fn store_with(descriptors: Vec<WriteDescriptor>) -> Store {
        let mut store = Store {
            header: StoreHeader {
                update_type: 0,
                minor_version: 0,
                full_flash_minor_version: 0,
                platform_ids: vec![],
                block_size: BS,
                write_descriptor_count: descriptors.len() as u32,
                write_descriptor_length: 0,
                validate_descriptor_count: 0,
                validate_descriptor_length: 0,
                initial_table_index: 0,
                initial_table_count: 0,
                flash_only_table_index: 0,
                flash_only_table_count: 0,
                final_table_index: 0,
                final_table_count: 0,
                extension: StoreExtension::V1,
            },
            validation_descriptors: vec![],
            write_descriptors: descriptors,
            data_offset: 0,
            data_len: 0,
            total_blocks: 0,
            descriptor_offsets: vec![],
            block_map: BlockMap::default(),
        };
        store.build_block_map().unwrap();
        store
    }

    #[test]
    fn test_block_map_from_end_resolution() {
        let store = store_with(vec![
            WriteDescriptor::single(DiskLocation::from_start(9)),
            WriteDescriptor {
                block_count: 2,
                locations: vec![DiskLocation::from_end(1)],
                stored_data_size: None,
            },
        ]);
        // max from start 9, max from end 1 + 2 - 1 = 2
        assert_eq!(store.total_blocks, 13);
        // from end 1 with 2 blocks covers [13 - 1 - 2, 13 - 1)
        assert_eq!(store.block_map.get(10), Some(BlockRef { descriptor: 1, block: 0 }));
        assert_eq!(store.block_map.get(11), Some(BlockRef { descriptor: 1, block: 1 }));
        assert_eq!(store.block_map.get(12), None);
        assert_eq!(store.mapped_blocks(), 3);
    }

    #[test]
    fn test_block_map_later_descriptor_wins() {
        let store = store_with(vec![
            WriteDescriptor {
                block_count: 1,
                locations: vec![DiskLocation::from_start(0), DiskLocation::from_end(0)],
                stored_data_size: None,
            },
            WriteDescriptor::single(DiskLocation::from_start(0)),
            WriteDescriptor::single(DiskLocation::from_start(3)),
        ]);
        assert_eq!(store.total_blocks, 5);
        assert_eq!(store.block_map.get(0).unwrap().descriptor, 1);
        assert_eq!(store.block_map.get(4).unwrap().descriptor, 0);
        assert_eq!(store.block_map.get(3).unwrap().descriptor, 2);
        assert_eq!(store.mapped_blocks(), 3);
    }

    #[test]
    fn test_block_map_without_from_end() {
        let store = store_with(vec![WriteDescriptor::single(DiskLocation::from_start(6))]);
        assert_eq!(store.total_blocks, 7);
    }

    #[test]
    fn test_block_map_splits_overlapped_extents() {
        let mut map = BlockMap::default();
        map.insert(0, 10, 0);
        map.insert(4, 2, 1);
        map.insert(8, 4, 2);
        assert_eq!(map.get(3), Some(BlockRef { descriptor: 0, block: 3 }));
        assert_eq!(map.get(5), Some(BlockRef { descriptor: 1, block: 1 }));
        assert_eq!(map.get(6), Some(BlockRef { descriptor: 0, block: 6 }));
        assert_eq!(map.get(9), Some(BlockRef { descriptor: 2, block: 1 }));
        assert_eq!(map.get(12), None);
        assert_eq!(map.mapped_blocks(), 12);

        map.insert(2, 8, 3);
        assert_eq!(map.get(1), Some(BlockRef { descriptor: 0, block: 1 }));
        assert_eq!(map.get(9), Some(BlockRef { descriptor: 3, block: 7 }));
        assert_eq!(map.get(10), Some(BlockRef { descriptor: 2, block: 2 }));
        assert_eq!(map.mapped_blocks(), 12);
    }

    /// Offset of the `block_count` field of the first write descriptor.
    fn first_block_count_offset(container: &[u8]) -> usize {
        let image = FfuImage::open(Cursor::new(container.to_vec())).unwrap();
        2 * BS as usize + image.stores[0].header.encoded_len() + 4
    }

    #[test]
    fn test_oversized_block_count_is_rejected() {
        for format in [FormatVersion::V1, FormatVersion::V1Compressed] {
            let (mut container, _) = build(format, true);
            let at = first_block_count_offset(&container);
            container[at..at + 4].copy_from_slice(&30_000_000u32.to_le_bytes());
            assert!(matches!(
                FfuImage::open(Cursor::new(container)),
                Err(FfuError::MalformedRecord(_))
            ));
        }
    }

    #[test]
    fn test_descriptor_wider_than_device_is_rejected() {
        let mut store = store_with(vec![WriteDescriptor::single(DiskLocation::from_start(1))]);
        store.write_descriptors.push(WriteDescriptor {
            block_count: 2,
            locations: vec![DiskLocation::from_start(0), DiskLocation::from_start(0)],
            stored_data_size: None,
        });
        assert!(matches!(
            store.build_block_map(),
            Err(FfuError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_bad_security_signature() {
        let (mut container, _) = build(FormatVersion::V1, true);
        container[4] = b'X';
        assert!(matches!(
            FfuImage::open(Cursor::new(container)),
            Err(FfuError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_unsupported_store_version() {
        let (mut container, _) = build(FormatVersion::V1, true);
        // store header sits in the third block; bump its major version to 3
        let at = 2 * BS as usize + 4;
        container[at..at + 2].copy_from_slice(&3u16.to_le_bytes());
        assert!(matches!(
            FfuImage::open(Cursor::new(container)),
            Err(FfuError::UnsupportedStoreFormat {
                major: 3,
                full_flash_major: 2
            })
        ));
    }

    #[test]
    fn test_truncated_container() {
        let (container, _) = build(FormatVersion::V1, true);
        let cut = container[..container.len() - 100].to_vec();
        assert!(matches!(
            FfuImage::open(Cursor::new(cut)),
            Err(FfuError::MalformedRecord(_))
        ));
        let tiny = container[..20].to_vec();
        assert!(matches!(
            FfuImage::open(Cursor::new(tiny)),
            Err(FfuError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_info_lists_partitions() {
        let (container, _) = build(FormatVersion::V2, true);
        let mut image = FfuImage::open(Cursor::new(container)).unwrap();
        let info = image.info().unwrap();
        assert_eq!(info.stores.len(), 1);
        let parts = info.stores[0].partitions.as_ref().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "A");
        assert_eq!(info.manifest.get("FullFlash", "Version"), Some("2.0"));
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"format\":\"v2\""));
    }
}
