//! Fixed-layout records of the FFU container.
//!
//! Every record is packed (no implicit padding) and little-endian. Character
//! fields have a fixed width and are NUL padded: ASCII in the headers,
//! UTF-16LE for the V2 device path.

use std::io::{Read, Write};
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{truncated, FfuError};

pub const SECURITY_SIGNATURE: &[u8; 12] = b"SignedImage ";
pub const IMAGE_SIGNATURE: &[u8; 12] = b"ImageFlash  ";

/// CALG_SHA_256
pub const SHA256_ALGORITHM_ID: u32 = 0x0000_800C;

pub const SECURITY_HEADER_SIZE: u32 = 0x20;
pub const IMAGE_HEADER_SIZE: u32 = 24;
pub const IMAGE_HEADER_V2_SIZE: u32 = 28;
pub const STORE_HEADER_SIZE: usize = 0xF8;
pub const PLATFORM_IDS_SIZE: usize = 192;

const DISK_BEGIN: u32 = 0;
const DISK_END: u32 = 2;

fn read_signature(r: &mut impl Read, expected: &[u8; 12], what: &str) -> Result<(), FfuError> {
    let mut sig = [0u8; 12];
    r.read_exact(&mut sig).map_err(truncated(what))?;
    if &sig != expected {
        return Err(FfuError::MalformedRecord(format!(
            "invalid {what} signature: expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&sig)
        )));
    }
    Ok(())
}

/// Decode a fixed-width ASCII field, stopping at the first NUL.
pub(crate) fn decode_fixed_ascii(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_fixed_ascii(
    w: &mut impl Write,
    value: &str,
    width: usize,
    what: &str,
) -> Result<(), FfuError> {
    if !value.is_ascii() {
        return Err(FfuError::MalformedRecord(format!("{what} must be ASCII")));
    }
    if value.len() > width {
        return Err(FfuError::MalformedRecord(format!(
            "{what} is {} bytes, field holds {width}",
            value.len()
        )));
    }
    w.write_all(value.as_bytes())?;
    w.write_all(&vec![0u8; width - value.len()])?;
    Ok(())
}

fn require_len(buf: &[u8], needed: usize, what: &str) -> Result<(), FfuError> {
    if buf.len() < needed {
        return Err(FfuError::MalformedRecord(format!(
            "{what} needs {needed} bytes, buffer holds {}",
            buf.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Security header
// ---------------------------------------------------------------------------

/// Leading record of every container; describes the catalog and hash table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityHeader {
    pub chunk_size_kb: u32,
    pub hash_algorithm: u32,
    pub catalog_size: u32,
    pub hash_table_size: u32,
}

impl SecurityHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, FfuError> {
        require_len(buf, SECURITY_HEADER_SIZE as usize, "security header")?;
        let mut r = buf;
        Self::read_from(&mut r)
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, FfuError> {
        let what = "security header";
        let size = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        if size != SECURITY_HEADER_SIZE {
            return Err(FfuError::MalformedRecord(format!(
                "security header size is {size:#x}, expected {SECURITY_HEADER_SIZE:#x}"
            )));
        }
        read_signature(r, SECURITY_SIGNATURE, what)?;
        Ok(Self {
            chunk_size_kb: r.read_u32::<LittleEndian>().map_err(truncated(what))?,
            hash_algorithm: r.read_u32::<LittleEndian>().map_err(truncated(what))?,
            catalog_size: r.read_u32::<LittleEndian>().map_err(truncated(what))?,
            hash_table_size: r.read_u32::<LittleEndian>().map_err(truncated(what))?,
        })
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), FfuError> {
        w.write_u32::<LittleEndian>(SECURITY_HEADER_SIZE)?;
        w.write_all(SECURITY_SIGNATURE)?;
        w.write_u32::<LittleEndian>(self.chunk_size_kb)?;
        w.write_u32::<LittleEndian>(self.hash_algorithm)?;
        w.write_u32::<LittleEndian>(self.catalog_size)?;
        w.write_u32::<LittleEndian>(self.hash_table_size)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Image header
// ---------------------------------------------------------------------------

/// Image header. The 28-byte form carries a device target record count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    pub manifest_length: u32,
    pub chunk_size_kb: u32,
    pub device_target_info_count: Option<u32>,
}

impl ImageHeader {
    pub fn size(&self) -> u32 {
        if self.device_target_info_count.is_some() {
            IMAGE_HEADER_V2_SIZE
        } else {
            IMAGE_HEADER_SIZE
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FfuError> {
        require_len(buf, IMAGE_HEADER_SIZE as usize, "image header")?;
        let mut r = buf;
        Self::read_from(&mut r)
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, FfuError> {
        let what = "image header";
        let size = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        if size != IMAGE_HEADER_SIZE && size != IMAGE_HEADER_V2_SIZE {
            return Err(FfuError::MalformedRecord(format!(
                "image header size is {size}, expected {IMAGE_HEADER_SIZE} or {IMAGE_HEADER_V2_SIZE}"
            )));
        }
        read_signature(r, IMAGE_SIGNATURE, what)?;
        let manifest_length = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        let chunk_size_kb = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        let device_target_info_count = if size == IMAGE_HEADER_V2_SIZE {
            Some(r.read_u32::<LittleEndian>().map_err(truncated(what))?)
        } else {
            None
        };
        Ok(Self {
            manifest_length,
            chunk_size_kb,
            device_target_info_count,
        })
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), FfuError> {
        w.write_u32::<LittleEndian>(self.size())?;
        w.write_all(IMAGE_SIGNATURE)?;
        w.write_u32::<LittleEndian>(self.manifest_length)?;
        w.write_u32::<LittleEndian>(self.chunk_size_kb)?;
        if let Some(count) = self.device_target_info_count {
            w.write_u32::<LittleEndian>(count)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device target info
// ---------------------------------------------------------------------------

/// Hardware identity a container is targeted at.
///
/// On disk: seven u32 lengths, then the seven ASCII strings in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTargetInfo {
    pub manufacturer: String,
    pub family: String,
    pub product_name: String,
    pub product_version: String,
    pub sku_number: String,
    pub baseboard_manufacturer: String,
    pub baseboard_product: String,
}

impl DeviceTargetInfo {
    fn fields(&self) -> [&str; 7] {
        [
            &self.manufacturer,
            &self.family,
            &self.product_name,
            &self.product_version,
            &self.sku_number,
            &self.baseboard_manufacturer,
            &self.baseboard_product,
        ]
    }

    pub fn encoded_len(&self) -> usize {
        7 * 4 + self.fields().iter().map(|f| f.len()).sum::<usize>()
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, FfuError> {
        let what = "device target info";
        let mut lengths = [0u32; 7];
        for len in lengths.iter_mut() {
            *len = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        }
        let mut values: Vec<String> = Vec::with_capacity(7);
        for len in lengths {
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf).map_err(truncated(what))?;
            values.push(decode_fixed_ascii(&buf));
        }
        let mut it = values.into_iter();
        let mut next = || it.next().unwrap_or_default();
        Ok(Self {
            manufacturer: next(),
            family: next(),
            product_name: next(),
            product_version: next(),
            sku_number: next(),
            baseboard_manufacturer: next(),
            baseboard_product: next(),
        })
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), FfuError> {
        let fields = self.fields();
        for field in fields {
            if !field.is_ascii() {
                return Err(FfuError::MalformedRecord(
                    "device target info fields must be ASCII".into(),
                ));
            }
            w.write_u32::<LittleEndian>(field.len() as u32)?;
        }
        for field in fields {
            w.write_all(field.as_bytes())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store header
// ---------------------------------------------------------------------------

/// Store format, selected by `(MajorVersion, FullFlashMajorVersion)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatVersion {
    V1,
    V1Compressed,
    V2,
}

impl FormatVersion {
    pub fn from_versions(major: u16, full_flash_major: u16) -> Result<Self, FfuError> {
        match (major, full_flash_major) {
            (1, 2) => Ok(FormatVersion::V1),
            (1, 3) => Ok(FormatVersion::V1Compressed),
            (2, 2) => Ok(FormatVersion::V2),
            _ => Err(FfuError::UnsupportedStoreFormat {
                major,
                full_flash_major,
            }),
        }
    }

    pub fn major_version(self) -> u16 {
        match self {
            FormatVersion::V1 | FormatVersion::V1Compressed => 1,
            FormatVersion::V2 => 2,
        }
    }

    pub fn full_flash_major_version(self) -> u16 {
        match self {
            FormatVersion::V1 | FormatVersion::V2 => 2,
            FormatVersion::V1Compressed => 3,
        }
    }

    pub fn is_compressed(self) -> bool {
        self == FormatVersion::V1Compressed
    }

    /// Version string used in the manifest's `[FullFlash]` section.
    pub fn manifest_version(self) -> &'static str {
        match self {
            FormatVersion::V1 | FormatVersion::V1Compressed => "1.0",
            FormatVersion::V2 => "2.0",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormatVersion::V1 => "v1",
            FormatVersion::V1Compressed => "v1-compressed",
            FormatVersion::V2 => "v2",
        }
    }
}

impl FromStr for FormatVersion {
    type Err = FfuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(FormatVersion::V1),
            "v1-compressed" | "v1c" => Ok(FormatVersion::V1Compressed),
            "v2" | "2" => Ok(FormatVersion::V2),
            other => Err(FfuError::InvalidConfig(format!(
                "unknown format version: {other}"
            ))),
        }
    }
}

/// Version-dependent tail of a store header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "format", rename_all = "kebab-case")]
pub enum StoreExtension {
    V1,
    V1Compressed {
        compression_algorithm: u32,
    },
    V2 {
        number_of_stores: u16,
        store_index: u16,
        store_payload_size: u64,
        device_path: String,
    },
}

impl StoreExtension {
    pub fn format(&self) -> FormatVersion {
        match self {
            StoreExtension::V1 => FormatVersion::V1,
            StoreExtension::V1Compressed { .. } => FormatVersion::V1Compressed,
            StoreExtension::V2 { .. } => FormatVersion::V2,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            StoreExtension::V1 => 0,
            StoreExtension::V1Compressed { .. } => 4,
            StoreExtension::V2 { device_path, .. } => {
                2 + 2 + 8 + 2 + device_path.encode_utf16().count() * 2
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreHeader {
    pub update_type: u32,
    pub minor_version: u16,
    pub full_flash_minor_version: u16,
    pub platform_ids: Vec<String>,
    pub block_size: u32,
    pub write_descriptor_count: u32,
    pub write_descriptor_length: u32,
    pub validate_descriptor_count: u32,
    pub validate_descriptor_length: u32,
    pub initial_table_index: u32,
    pub initial_table_count: u32,
    pub flash_only_table_index: u32,
    pub flash_only_table_count: u32,
    pub final_table_index: u32,
    pub final_table_count: u32,
    pub extension: StoreExtension,
}

impl StoreHeader {
    pub fn format(&self) -> FormatVersion {
        self.extension.format()
    }

    pub fn encoded_len(&self) -> usize {
        STORE_HEADER_SIZE + self.extension.encoded_len()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FfuError> {
        require_len(buf, STORE_HEADER_SIZE, "store header")?;
        let mut r = buf;
        Self::read_from(&mut r)
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, FfuError> {
        let what = "store header";
        let update_type = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        let major = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
        let minor_version = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
        let full_flash_major = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
        let full_flash_minor_version = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
        let format = FormatVersion::from_versions(major, full_flash_major)?;

        let mut ids = [0u8; PLATFORM_IDS_SIZE];
        r.read_exact(&mut ids).map_err(truncated(what))?;
        let platform_ids = ids
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();

        let mut fields = [0u32; 11];
        for field in fields.iter_mut() {
            *field = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        }

        let extension = match format {
            FormatVersion::V1 => StoreExtension::V1,
            FormatVersion::V1Compressed => StoreExtension::V1Compressed {
                compression_algorithm: r.read_u32::<LittleEndian>().map_err(truncated(what))?,
            },
            FormatVersion::V2 => {
                let number_of_stores = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
                let store_index = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
                let store_payload_size = r.read_u64::<LittleEndian>().map_err(truncated(what))?;
                let path_len = r.read_u16::<LittleEndian>().map_err(truncated(what))?;
                let mut units = Vec::with_capacity(path_len as usize);
                for _ in 0..path_len {
                    units.push(r.read_u16::<LittleEndian>().map_err(truncated(what))?);
                }
                let device_path = String::from_utf16(&units).map_err(|_| {
                    FfuError::MalformedRecord("store device path is not valid UTF-16".into())
                })?;
                StoreExtension::V2 {
                    number_of_stores,
                    store_index,
                    store_payload_size,
                    device_path,
                }
            }
        };

        Ok(Self {
            update_type,
            minor_version,
            full_flash_minor_version,
            platform_ids,
            block_size: fields[0],
            write_descriptor_count: fields[1],
            write_descriptor_length: fields[2],
            validate_descriptor_count: fields[3],
            validate_descriptor_length: fields[4],
            initial_table_index: fields[5],
            initial_table_count: fields[6],
            flash_only_table_index: fields[7],
            flash_only_table_count: fields[8],
            final_table_index: fields[9],
            final_table_count: fields[10],
            extension,
        })
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), FfuError> {
        let format = self.format();
        w.write_u32::<LittleEndian>(self.update_type)?;
        w.write_u16::<LittleEndian>(format.major_version())?;
        w.write_u16::<LittleEndian>(self.minor_version)?;
        w.write_u16::<LittleEndian>(format.full_flash_major_version())?;
        w.write_u16::<LittleEndian>(self.full_flash_minor_version)?;
        write_fixed_ascii(w, &self.platform_ids.join("\0"), PLATFORM_IDS_SIZE, "platform id list")?;

        for field in [
            self.block_size,
            self.write_descriptor_count,
            self.write_descriptor_length,
            self.validate_descriptor_count,
            self.validate_descriptor_length,
            self.initial_table_index,
            self.initial_table_count,
            self.flash_only_table_index,
            self.flash_only_table_count,
            self.final_table_index,
            self.final_table_count,
        ] {
            w.write_u32::<LittleEndian>(field)?;
        }

        match &self.extension {
            StoreExtension::V1 => {}
            StoreExtension::V1Compressed {
                compression_algorithm,
            } => w.write_u32::<LittleEndian>(*compression_algorithm)?,
            StoreExtension::V2 {
                number_of_stores,
                store_index,
                store_payload_size,
                device_path,
            } => {
                let units: Vec<u16> = device_path.encode_utf16().collect();
                let path_len = u16::try_from(units.len()).map_err(|_| {
                    FfuError::MalformedRecord("store device path is too long".into())
                })?;
                w.write_u16::<LittleEndian>(*number_of_stores)?;
                w.write_u16::<LittleEndian>(*store_index)?;
                w.write_u64::<LittleEndian>(*store_payload_size)?;
                w.write_u16::<LittleEndian>(path_len)?;
                for unit in units {
                    w.write_u16::<LittleEndian>(unit)?;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiskAccessMethod {
    /// Block index counted from the first block of the device.
    FromStart,
    /// Block index counted backward from the last block of the device.
    FromEnd,
}

impl DiskAccessMethod {
    pub fn to_raw(self) -> u32 {
        match self {
            DiskAccessMethod::FromStart => DISK_BEGIN,
            DiskAccessMethod::FromEnd => DISK_END,
        }
    }

    pub fn from_raw(raw: u32) -> Result<Self, FfuError> {
        match raw {
            DISK_BEGIN => Ok(DiskAccessMethod::FromStart),
            DISK_END => Ok(DiskAccessMethod::FromEnd),
            other => Err(FfuError::MalformedRecord(format!(
                "unknown disk access method {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskLocation {
    pub access_method: DiskAccessMethod,
    pub block_index: u32,
}

impl DiskLocation {
    pub fn from_start(block_index: u32) -> Self {
        Self {
            access_method: DiskAccessMethod::FromStart,
            block_index,
        }
    }

    pub fn from_end(block_index: u32) -> Self {
        Self {
            access_method: DiskAccessMethod::FromEnd,
            block_index,
        }
    }
}

/// Maps one run of payload blocks onto one or more device locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteDescriptor {
    pub block_count: u32,
    pub locations: Vec<DiskLocation>,
    /// Bytes stored in the container; only present in compressed stores.
    pub stored_data_size: Option<u32>,
}

impl WriteDescriptor {
    pub fn single(location: DiskLocation) -> Self {
        Self {
            block_count: 1,
            locations: vec![location],
            stored_data_size: None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let data_size = if self.stored_data_size.is_some() { 4 } else { 0 };
        8 + data_size + self.locations.len() * 8
    }

    pub fn read_from(r: &mut impl Read, compressed: bool) -> Result<Self, FfuError> {
        let what = "write descriptor";
        let location_count = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        let block_count = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        let stored_data_size = if compressed {
            Some(r.read_u32::<LittleEndian>().map_err(truncated(what))?)
        } else {
            None
        };
        let mut locations = Vec::with_capacity(location_count.min(64) as usize);
        for _ in 0..location_count {
            let method = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
            let block_index = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
            locations.push(DiskLocation {
                access_method: DiskAccessMethod::from_raw(method)?,
                block_index,
            });
        }
        Ok(Self {
            block_count,
            locations,
            stored_data_size,
        })
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), FfuError> {
        w.write_u32::<LittleEndian>(self.locations.len() as u32)?;
        w.write_u32::<LittleEndian>(self.block_count)?;
        if let Some(size) = self.stored_data_size {
            w.write_u32::<LittleEndian>(size)?;
        }
        for loc in &self.locations {
            w.write_u32::<LittleEndian>(loc.access_method.to_raw())?;
            w.write_u32::<LittleEndian>(loc.block_index)?;
        }
        Ok(())
    }
}

/// Sector comparison record. Generated containers carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationDescriptor {
    pub sector_index: u32,
    pub sector_offset: u32,
    pub bytes: Vec<u8>,
}

impl ValidationDescriptor {
    pub fn encoded_len(&self) -> usize {
        12 + self.bytes.len()
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, FfuError> {
        let what = "validation descriptor";
        let sector_index = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        let sector_offset = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        let byte_count = r.read_u32::<LittleEndian>().map_err(truncated(what))?;
        let mut bytes = vec![0u8; byte_count as usize];
        r.read_exact(&mut bytes).map_err(truncated(what))?;
        Ok(Self {
            sector_index,
            sector_offset,
            bytes,
        })
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), FfuError> {
        w.write_u32::<LittleEndian>(self.sector_index)?;
        w.write_u32::<LittleEndian>(self.sector_offset)?;
        w.write_u32::<LittleEndian>(self.bytes.len() as u32)?;
        w.write_all(&self.bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample_store_header(extension: StoreExtension) -> StoreHeader {
        StoreHeader {
            update_type: 0,
            minor_version: 0,
            full_flash_minor_version: 0,
            platform_ids: vec!["Qualcomm.MSM8994.P6211".into(), "Contoso.Phone".into()],
            block_size: 0x20000,
            write_descriptor_count: 3,
            write_descriptor_length: 56,
            validate_descriptor_count: 0,
            validate_descriptor_length: 0,
            initial_table_index: 0,
            initial_table_count: 0,
            flash_only_table_index: 0,
            flash_only_table_count: 1,
            final_table_index: 2,
            final_table_count: 1,
            extension,
        }
    }

    #[test]
    fn test_security_header_layout() {
        let header = SecurityHeader {
            chunk_size_kb: 128,
            hash_algorithm: SHA256_ALGORITHM_ID,
            catalog_size: 0,
            hash_table_size: 64,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();

        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[0..4], &0x20u32.to_le_bytes());
        assert_eq!(&buf[4..16], b"SignedImage ");
        assert_eq!(&buf[20..24], &0x800Cu32.to_le_bytes());
        assert_eq!(SecurityHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_security_header_bad_signature() {
        let mut buf = vec![0u8; 32];
        buf[0..4].copy_from_slice(&0x20u32.to_le_bytes());
        buf[4..16].copy_from_slice(b"SignedImagX ");
        let err = SecurityHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, FfuError::MalformedRecord(_)));
    }

    #[test]
    fn test_security_header_truncated() {
        let err = SecurityHeader::decode(&[0x20, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);
    }

    #[test]
    fn test_image_header_sizes() {
        let v1 = ImageHeader {
            manifest_length: 100,
            chunk_size_kb: 4,
            device_target_info_count: None,
        };
        let mut buf = Vec::new();
        v1.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[4..16], b"ImageFlash  ");

        let v2 = ImageHeader {
            device_target_info_count: Some(2),
            ..v1
        };
        let mut buf = Vec::new();
        v2.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 28);
        assert_eq!(ImageHeader::decode(&buf).unwrap(), v2);
    }

    #[test]
    fn test_image_header_rejects_odd_size() {
        let mut buf = vec![0u8; 32];
        buf[0..4].copy_from_slice(&32u32.to_le_bytes());
        buf[4..16].copy_from_slice(IMAGE_SIGNATURE);
        assert!(matches!(
            ImageHeader::decode(&buf),
            Err(FfuError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_store_header_v1_is_0xf8_bytes() {
        let header = sample_store_header(StoreExtension::V1);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), STORE_HEADER_SIZE);
        assert_eq!(header.encoded_len(), STORE_HEADER_SIZE);
        // Major 1, FullFlashMajor 2
        assert_eq!(&buf[4..6], &1u16.to_le_bytes());
        assert_eq!(&buf[8..10], &2u16.to_le_bytes());
        // Platform IDs are NUL separated in a 192 byte field
        assert_eq!(&buf[12..34], b"Qualcomm.MSM8994.P6211");
        assert_eq!(buf[34], 0);
        // Block size follows the platform id field
        assert_eq!(&buf[204..208], &0x20000u32.to_le_bytes());

        let decoded = StoreHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.platform_ids.len(), 2);
    }

    #[test]
    fn test_store_header_v1_compressed_extension() {
        let header = sample_store_header(StoreExtension::V1Compressed {
            compression_algorithm: 2,
        });
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), STORE_HEADER_SIZE + 4);
        assert_eq!(&buf[8..10], &3u16.to_le_bytes());
        assert_eq!(StoreHeader::decode(&buf).unwrap().format(), FormatVersion::V1Compressed);
    }

    #[test]
    fn test_store_header_v2_device_path_utf16() {
        let header = sample_store_header(StoreExtension::V2 {
            number_of_stores: 2,
            store_index: 1,
            store_payload_size: 0x40000,
            device_path: "VenHw(860845C1-BE09-4355-8BC1-30D64FF8E63A)".into(),
        });
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), header.encoded_len());

        let path_len = u16::from_le_bytes([buf[0xF8 + 12], buf[0xF8 + 13]]);
        assert_eq!(path_len, 43);
        // UTF-16LE, no terminating NUL
        assert_eq!(&buf[0xF8 + 14..0xF8 + 18], &[b'V', 0, b'e', 0]);
        assert_eq!(buf.len(), 0xF8 + 14 + 43 * 2);

        assert_eq!(StoreHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_store_header_unsupported_version_pair() {
        let mut buf = Vec::new();
        sample_store_header(StoreExtension::V1)
            .write_to(&mut buf)
            .unwrap();
        buf[4..6].copy_from_slice(&2u16.to_le_bytes());
        buf[8..10].copy_from_slice(&3u16.to_le_bytes());
        let err = StoreHeader::decode(&buf).unwrap_err();
        assert!(matches!(
            err,
            FfuError::UnsupportedStoreFormat {
                major: 2,
                full_flash_major: 3
            }
        ));
    }

    #[test]
    fn test_platform_ids_too_long() {
        let mut header = sample_store_header(StoreExtension::V1);
        header.platform_ids = vec!["x".repeat(200)];
        let mut buf = Vec::new();
        assert!(header.write_to(&mut buf).is_err());
    }

    #[test]
    fn test_fixed_ascii_stops_at_nul() {
        assert_eq!(decode_fixed_ascii(b"abc\0def"), "abc");
        assert_eq!(decode_fixed_ascii(b"abcdef"), "abcdef");
        assert_eq!(decode_fixed_ascii(b"\0\0"), "");
    }

    #[test]
    fn test_write_descriptor_wire_form() {
        let wd = WriteDescriptor {
            block_count: 1,
            locations: vec![DiskLocation::from_start(0), DiskLocation::from_end(0)],
            stored_data_size: None,
        };
        let mut buf = Vec::new();
        wd.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), wd.encoded_len());
        assert_eq!(
            buf,
            [2u32, 1, 0, 0, 2, 0]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect::<Vec<u8>>()
        );
        let mut r = &buf[..];
        assert_eq!(WriteDescriptor::read_from(&mut r, false).unwrap(), wd);
    }

    #[test]
    fn test_write_descriptor_compressed_carries_data_size() {
        let wd = WriteDescriptor {
            block_count: 1,
            locations: vec![DiskLocation::from_start(42)],
            stored_data_size: Some(913),
        };
        let mut buf = Vec::new();
        wd.write_to(&mut buf).unwrap();
        assert_eq!(&buf[8..12], &913u32.to_le_bytes());
        let mut r = &buf[..];
        assert_eq!(WriteDescriptor::read_from(&mut r, true).unwrap(), wd);
    }

    #[test]
    fn test_write_descriptor_unknown_access_method() {
        let buf: Vec<u8> = [1u32, 1, 1, 5].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut r = &buf[..];
        assert!(WriteDescriptor::read_from(&mut r, false).is_err());
    }

    #[test]
    fn test_device_target_info_layout() {
        let info = DeviceTargetInfo {
            manufacturer: "Contoso".into(),
            family: "Phones".into(),
            product_name: "P1".into(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        info.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), info.encoded_len());
        assert_eq!(&buf[0..4], &7u32.to_le_bytes());
        assert_eq!(&buf[28..35], b"Contoso");
        let mut r = &buf[..];
        assert_eq!(DeviceTargetInfo::read_from(&mut r).unwrap(), info);
    }

    #[test]
    fn test_format_version_parse() {
        assert_eq!("v1".parse::<FormatVersion>().unwrap(), FormatVersion::V1);
        assert_eq!(
            "V1-Compressed".parse::<FormatVersion>().unwrap(),
            FormatVersion::V1Compressed
        );
        assert!("v3".parse::<FormatVersion>().is_err());
    }
}
