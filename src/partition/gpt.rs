use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::error::FfuError;

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_HEADER_MIN_SIZE: usize = 92;
const ENTRY_MIN_SIZE: usize = 128;
const ENTRY_NAME_OFFSET: usize = 56;
const ENTRY_NAME_UNITS: usize = 36;

/// A 128-bit GUID stored as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Format as standard GUID string (mixed-endian per UEFI spec).
    pub fn to_string_formatted(&self) -> String {
        let d = &self.0;
        format!(
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            d[3], d[2], d[1], d[0], // time_low (LE)
            d[5], d[4],             // time_mid (LE)
            d[7], d[6],             // time_hi (LE)
            d[8], d[9],             // clock_seq (BE)
            d[10], d[11], d[12], d[13], d[14], d[15] // node (BE)
        )
    }

    /// Look up a well-known partition type name from GUID.
    pub fn partition_type_name(&self) -> &'static str {
        match self.to_string_formatted().as_str() {
            "00000000-0000-0000-0000-000000000000" => "Unused",
            "C12A7328-F81F-11D2-BA4B-00A0C93EC93B" => "EFI System",
            "E3C9E316-0B5C-4DB8-817D-F92DF00215AE" => "Microsoft Reserved",
            "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7" => "Microsoft Basic Data",
            "DE94BBA4-06D1-4D40-A16A-BFD50179D6AC" => "Windows Recovery",
            "0FC63DAF-8483-4772-8E79-3D69D8477DE4" => "Linux Filesystem",
            _ => "Unknown",
        }
    }
}

impl Serialize for Guid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string_formatted())
    }
}

fn read_guid(buf: &[u8]) -> Guid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[..16]);
    Guid(bytes)
}

/// GPT header fields, read from the sector carrying the `EFI PART` signature.
#[derive(Debug, Clone, Serialize)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub partition_entry_lba: u64,
    pub max_partition_count: u32,
    pub partition_entry_size: u32,
    pub partition_array_crc32: u32,
}

impl GptHeader {
    /// Locate the signature at a sector boundary of `buf` and decode the header.
    /// Returns the byte offset of the header along with it.
    pub fn locate(buf: &[u8], sector_size: u32) -> Result<(usize, Self), FfuError> {
        let step = sector_size.max(1) as usize;
        let offset = (0..buf.len())
            .step_by(step)
            .find(|&off| buf[off..].starts_with(GPT_SIGNATURE))
            .ok_or_else(|| {
                FfuError::InvalidGpt(format!(
                    "signature \"EFI PART\" not found in the first {} bytes",
                    buf.len()
                ))
            })?;

        if buf.len() < offset + GPT_HEADER_MIN_SIZE {
            return Err(FfuError::InvalidGpt("GPT header is truncated".into()));
        }
        let h = &buf[offset..];
        let header = GptHeader {
            revision: LittleEndian::read_u32(&h[8..12]),
            header_size: LittleEndian::read_u32(&h[12..16]),
            header_crc32: LittleEndian::read_u32(&h[16..20]),
            my_lba: LittleEndian::read_u64(&h[24..32]),
            alternate_lba: LittleEndian::read_u64(&h[32..40]),
            first_usable_lba: LittleEndian::read_u64(&h[40..48]),
            last_usable_lba: LittleEndian::read_u64(&h[48..56]),
            disk_guid: read_guid(&h[56..72]),
            partition_entry_lba: LittleEndian::read_u64(&h[72..80]),
            max_partition_count: LittleEndian::read_u32(&h[80..84]),
            partition_entry_size: LittleEndian::read_u32(&h[84..88]),
            partition_array_crc32: LittleEndian::read_u32(&h[88..92]),
        };

        if (header.partition_entry_size as usize) < ENTRY_MIN_SIZE {
            return Err(FfuError::InvalidGpt(format!(
                "partition entry size {} is smaller than {ENTRY_MIN_SIZE}",
                header.partition_entry_size
            )));
        }
        header.table_end(sector_size)?;
        Ok((offset, header))
    }

    pub fn table_size(&self) -> u64 {
        self.max_partition_count as u64 * self.partition_entry_size as u64
    }

    /// Byte offset one past the partition entry array.
    pub fn table_end(&self, sector_size: u32) -> Result<u64, FfuError> {
        self.partition_entry_lba
            .checked_mul(sector_size as u64)
            .and_then(|offset| offset.checked_add(self.table_size()))
            .ok_or_else(|| {
                FfuError::InvalidGpt(format!(
                    "partition entry LBA {} is out of range",
                    self.partition_entry_lba
                ))
            })
    }
}

/// A single populated GPT partition entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub name: String,
    pub first_sector: u64,
    pub last_sector: u64,
    pub type_guid: Guid,
    pub partition_guid: Guid,
    pub attributes: u64,
}

impl Partition {
    pub fn size_in_sectors(&self) -> u64 {
        self.last_sector
            .saturating_sub(self.first_sector)
            .saturating_add(1)
    }

    /// Byte offset one past the last sector, or `None` if it overflows.
    pub fn end_offset(&self, sector_size: u32) -> Option<u64> {
        self.last_sector
            .checked_add(1)?
            .checked_mul(sector_size as u64)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_guid.partition_type_name()
    }

    fn parse_entry(data: &[u8]) -> Self {
        Partition {
            type_guid: read_guid(&data[0..16]),
            partition_guid: read_guid(&data[16..32]),
            first_sector: LittleEndian::read_u64(&data[32..40]),
            last_sector: LittleEndian::read_u64(&data[40..48]),
            attributes: LittleEndian::read_u64(&data[48..56]),
            name: parse_utf16le_name(&data[ENTRY_NAME_OFFSET..ENTRY_NAME_OFFSET + ENTRY_NAME_UNITS * 2]),
        }
    }

    fn write_entry(&self, data: &mut [u8]) -> Result<(), FfuError> {
        let units: Vec<u16> = self.name.encode_utf16().collect();
        if units.len() > ENTRY_NAME_UNITS {
            return Err(FfuError::InvalidGpt(format!(
                "partition name {:?} exceeds {ENTRY_NAME_UNITS} UTF-16 units",
                self.name
            )));
        }
        data[..ENTRY_MIN_SIZE].fill(0);
        data[0..16].copy_from_slice(&self.type_guid.0);
        data[16..32].copy_from_slice(&self.partition_guid.0);
        LittleEndian::write_u64(&mut data[32..40], self.first_sector);
        LittleEndian::write_u64(&mut data[40..48], self.last_sector);
        LittleEndian::write_u64(&mut data[48..56], self.attributes);
        for (i, unit) in units.iter().enumerate() {
            let off = ENTRY_NAME_OFFSET + i * 2;
            LittleEndian::write_u16(&mut data[off..off + 2], *unit);
        }
        Ok(())
    }
}

/// Parsed GPT (GUID Partition Table) held in a raw sector buffer that
/// starts at LBA 0.
#[derive(Debug, Clone, Serialize)]
pub struct Gpt {
    pub sector_size: u32,
    pub header_offset: usize,
    pub header: GptHeader,
    pub partitions: Vec<Partition>,
}

impl Gpt {
    /// Parse a GPT from a buffer that begins at the first sector of the disk.
    ///
    /// Entries are read in slot order until the first entry with an empty name.
    pub fn parse(buf: &[u8], sector_size: u32) -> Result<Self, FfuError> {
        let (header_offset, header) = GptHeader::locate(buf, sector_size)?;

        let gpt = Self {
            sector_size,
            header_offset,
            header,
            partitions: Vec::new(),
        };
        let table_end = gpt.header.table_end(sector_size)?;
        if (buf.len() as u64) < table_end {
            return Err(FfuError::InvalidGpt(format!(
                "partition table ends at byte {table_end}, buffer holds {}",
                buf.len()
            )));
        }

        let table_offset = gpt.table_offset() as usize;
        let entry_size = gpt.header.partition_entry_size as usize;
        let mut partitions = Vec::new();
        for slot in 0..gpt.header.max_partition_count as usize {
            let start = table_offset + slot * entry_size;
            let entry = Partition::parse_entry(&buf[start..start + entry_size]);
            if entry.name.is_empty() {
                break;
            }
            if entry.last_sector < entry.first_sector || entry.end_offset(sector_size).is_none() {
                return Err(FfuError::InvalidGpt(format!(
                    "partition {} has an invalid sector range {}..={}",
                    entry.name, entry.first_sector, entry.last_sector
                )));
            }
            partitions.push(entry);
        }

        Ok(Self { partitions, ..gpt })
    }

    /// Byte offset of the partition entry array.
    pub fn table_offset(&self) -> u64 {
        self.header
            .partition_entry_lba
            .saturating_mul(self.sector_size as u64)
    }

    pub fn table_size(&self) -> u64 {
        self.header.table_size()
    }

    /// Bytes from the start of the disk through the end of the entry array.
    pub fn required_size(&self) -> u64 {
        self.table_offset().saturating_add(self.table_size())
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.partition(name).is_some()
    }

    /// Partitions ordered by first sector.
    pub fn sorted_partitions(&self) -> Vec<&Partition> {
        let mut sorted: Vec<&Partition> = self.partitions.iter().collect();
        sorted.sort_by_key(|p| p.first_sector);
        sorted
    }

    /// Write the partition list back into `buf` and recompute both CRC32 fields.
    ///
    /// Slots past the parsed partitions are left untouched.
    pub fn rebuild(&self, buf: &mut [u8]) -> Result<(), FfuError> {
        let table_offset = self.table_offset() as usize;
        let table_end = self.required_size() as usize;
        if buf.len() < table_end {
            return Err(FfuError::InvalidGpt(format!(
                "partition table ends at byte {table_end}, buffer holds {}",
                buf.len()
            )));
        }
        if self.partitions.len() > self.header.max_partition_count as usize {
            return Err(FfuError::InvalidGpt(format!(
                "{} partitions do not fit in {} slots",
                self.partitions.len(),
                self.header.max_partition_count
            )));
        }

        let entry_size = self.header.partition_entry_size as usize;
        for (slot, partition) in self.partitions.iter().enumerate() {
            let start = table_offset + slot * entry_size;
            partition.write_entry(&mut buf[start..start + entry_size])?;
        }

        let table_crc = crc32fast::hash(&buf[table_offset..table_end]);
        let h = self.header_offset;
        LittleEndian::write_u32(&mut buf[h + 88..h + 92], table_crc);

        let header_size = self.header_len(buf.len());
        buf[h + 16..h + 20].fill(0);
        let header_crc = crc32fast::hash(&buf[h..h + header_size]);
        LittleEndian::write_u32(&mut buf[h + 16..h + 20], header_crc);
        Ok(())
    }

    /// Check both CRC32 fields against the contents of `buf`.
    pub fn checksums_valid(&self, buf: &[u8]) -> bool {
        let table_offset = self.table_offset() as usize;
        let table_end = self.required_size() as usize;
        if buf.len() < table_end {
            return false;
        }
        let h = self.header_offset;
        let header_size = self.header_len(buf.len());
        let mut header = buf[h..h + header_size].to_vec();
        let stored_header_crc = LittleEndian::read_u32(&header[16..20]);
        header[16..20].fill(0);

        crc32fast::hash(&buf[table_offset..table_end]) == LittleEndian::read_u32(&buf[h + 88..h + 92])
            && crc32fast::hash(&header) == stored_header_crc
    }

    fn header_len(&self, buf_len: usize) -> usize {
        let declared = self.header.header_size as usize;
        declared
            .max(GPT_HEADER_MIN_SIZE)
            .min(self.sector_size as usize)
            .min(buf_len - self.header_offset)
    }
}

fn parse_utf16le_name(bytes: &[u8]) -> String {
    let u16s: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0)
        .collect();
    String::from_utf16_lossy(&u16s)
}
