pub mod manifest;
pub mod payload;
pub mod reader;
pub mod structs;
pub mod verify;
pub mod writer;

use std::io::{self, Write};

use sha2::{Digest, Sha256};

pub use payload::{BlockPayload, BlockSource};
pub use reader::{ContainerInfo, FfuImage, StoreDisk};
pub use structs::FormatVersion;
pub use writer::{FfuOptions, FfuSummary, StoreInput};

/// SHA-256 digest of one block.
pub type BlockHash = [u8; 32];

/// Round `value` up to the next multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Zero-fill from `position` up to the next multiple of `alignment`.
/// Returns the number of padding bytes written.
pub(crate) fn write_padding(w: &mut impl Write, position: u64, alignment: u64) -> io::Result<u64> {
    let pad = align_up(position, alignment) - position;
    if pad > 0 {
        w.write_all(&vec![0u8; pad as usize])?;
    }
    Ok(pad)
}

pub(crate) fn hash_block(data: &[u8]) -> BlockHash {
    Sha256::digest(data).into()
}

/// Hash of an all-zero block of `block_size` bytes.
pub(crate) fn empty_block_hash(block_size: u32) -> BlockHash {
    hash_block(&vec![0u8; block_size as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_write_padding() {
        let mut out = Vec::new();
        assert_eq!(write_padding(&mut out, 100, 512).unwrap(), 412);
        assert_eq!(out.len(), 412);
        assert!(out.iter().all(|&b| b == 0));

        let mut out = Vec::new();
        assert_eq!(write_padding(&mut out, 1024, 512).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_empty_block_hash() {
        // SHA-256 of 4096 zero bytes
        assert_eq!(
            crate::error::hex(&empty_block_hash(4096)),
            "ad7facb2586fc6e966c004d7d1d16b024f5805ff7cb47c7a85dabd8b48892ca7"
        );
    }
}
