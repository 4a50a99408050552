use std::fmt;

use thiserror::Error;

/// Region of a container covered by the hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashRegion {
    /// Block-size chunks of the image header and store header sections.
    Header,
    /// Logical blocks carried by write descriptors.
    BlockData,
}

impl fmt::Display for HashRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashRegion::Header => write!(f, "header"),
            HashRegion::BlockData => write!(f, "block data"),
        }
    }
}

/// Coarse classification of an [`FfuError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Structural,
    Alignment,
    AddressSpace,
    Integrity,
    Collaborator,
    Io,
    Config,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum FfuError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Invalid GPT: {0}")]
    InvalidGpt(String),

    #[error("Unsupported store format: major version {major}, full flash major version {full_flash_major}")]
    UnsupportedStoreFormat { major: u16, full_flash_major: u16 },

    #[error("Alignment error: {0}")]
    Alignment(String),

    #[error("Block index {block_index} exceeds the 32-bit address space of the format")]
    AddressSpace { block_index: u64 },

    #[error("Hash mismatch in {region} block {block_index}: expected {expected}, got {actual}")]
    HashMismatch {
        region: HashRegion,
        block_index: u64,
        expected: String,
        actual: String,
    },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Catalog signing failed: {0}")]
    Signing(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl FfuError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FfuError::Io(_) => ErrorKind::Io,
            FfuError::MalformedRecord(_)
            | FfuError::InvalidGpt(_)
            | FfuError::UnsupportedStoreFormat { .. } => ErrorKind::Structural,
            FfuError::Alignment(_) => ErrorKind::Alignment,
            FfuError::AddressSpace { .. } => ErrorKind::AddressSpace,
            FfuError::HashMismatch { .. } => ErrorKind::Integrity,
            FfuError::Compression(_) | FfuError::Signing(_) => ErrorKind::Collaborator,
            FfuError::InvalidConfig(_) => ErrorKind::Config,
            FfuError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Map a failed record read: running out of bytes means the record is truncated.
pub(crate) fn truncated(what: &str) -> impl FnOnce(std::io::Error) -> FfuError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FfuError::MalformedRecord(format!("truncated {what}"))
        } else {
            FfuError::Io(e)
        }
    }
}

/// Lower-case hex rendering of a digest.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_truncated_maps_eof_to_malformed() {
        let err = truncated("store header")(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, FfuError::MalformedRecord(ref m) if m == "truncated store header"));
        assert_eq!(err.kind(), ErrorKind::Structural);

        let err = truncated("store header")(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_hash_mismatch_message() {
        let err = FfuError::HashMismatch {
            region: HashRegion::BlockData,
            block_index: 7,
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(
            err.to_string(),
            "Hash mismatch in block data block 7: expected aa, got bb"
        );
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
