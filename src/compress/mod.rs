pub mod lznt1;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FfuError;

/// Block compression algorithms a compressed store can declare.
///
/// The numeric ids are the ones stored in the store header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionAlgorithm {
    Lznt1,
    Xpress,
    XpressHuff,
}

impl CompressionAlgorithm {
    pub fn id(self) -> u32 {
        match self {
            CompressionAlgorithm::Lznt1 => 2,
            CompressionAlgorithm::Xpress => 3,
            CompressionAlgorithm::XpressHuff => 4,
        }
    }

    pub fn from_id(id: u32) -> Result<Self, FfuError> {
        match id {
            2 => Ok(CompressionAlgorithm::Lznt1),
            3 => Ok(CompressionAlgorithm::Xpress),
            4 => Ok(CompressionAlgorithm::XpressHuff),
            other => Err(FfuError::Compression(format!(
                "unknown compression algorithm id {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::Lznt1 => "lznt1",
            CompressionAlgorithm::Xpress => "xpress",
            CompressionAlgorithm::XpressHuff => "xpress-huff",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = FfuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lznt1" => Ok(CompressionAlgorithm::Lznt1),
            "xpress" => Ok(CompressionAlgorithm::Xpress),
            "xpress-huff" | "xpress_huff" => Ok(CompressionAlgorithm::XpressHuff),
            other => Err(FfuError::InvalidConfig(format!(
                "unknown compression algorithm '{other}'"
            ))),
        }
    }
}

/// Compresses and decompresses store blocks.
pub trait BlockCodec {
    fn compress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, FfuError>;

    /// Decompress `data`, which must expand to exactly `expected_size` bytes.
    fn decompress(
        &self,
        algorithm: CompressionAlgorithm,
        data: &[u8],
        expected_size: usize,
    ) -> Result<Vec<u8>, FfuError>;
}

/// Pure-Rust codec. Only LZNT1 is implemented.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCodec;

impl BlockCodec for NativeCodec {
    fn compress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, FfuError> {
        match algorithm {
            CompressionAlgorithm::Lznt1 => Ok(lznt1::compress(data)),
            other => Err(unsupported(other)),
        }
    }

    fn decompress(
        &self,
        algorithm: CompressionAlgorithm,
        data: &[u8],
        expected_size: usize,
    ) -> Result<Vec<u8>, FfuError> {
        let out = match algorithm {
            CompressionAlgorithm::Lznt1 => lznt1::decompress(data, expected_size)?,
            other => return Err(unsupported(other)),
        };
        if out.len() != expected_size {
            return Err(FfuError::Compression(format!(
                "{algorithm} data expanded to {} bytes, expected {expected_size}",
                out.len()
            )));
        }
        Ok(out)
    }
}

fn unsupported(algorithm: CompressionAlgorithm) -> FfuError {
    FfuError::Compression(format!(
        "{algorithm} is not supported by the native codec"
    ))
}
