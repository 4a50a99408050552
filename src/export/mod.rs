pub mod raw;
pub mod vhd;
pub mod zstd;

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::FfuError;

pub(crate) const CHUNK_SIZE: usize = 256 * 1024; // 256 KB I/O buffer

/// Output format for a store's virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportFormat {
    /// Flat image; all-zero chunks become holes.
    #[default]
    Raw,
    /// Flat image followed by a fixed VHD footer.
    Vhd,
    /// zstd stream of the flat image.
    Zstd,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Raw => "img",
            ExportFormat::Vhd => "vhd",
            ExportFormat::Zstd => "zst",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportFormat::Raw => "raw",
            ExportFormat::Vhd => "vhd",
            ExportFormat::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

impl FromStr for ExportFormat {
    type Err = FfuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "img" => Ok(ExportFormat::Raw),
            "vhd" => Ok(ExportFormat::Vhd),
            "zstd" | "zst" => Ok(ExportFormat::Zstd),
            other => Err(FfuError::InvalidConfig(format!(
                "unknown export format: {other}"
            ))),
        }
    }
}

/// Stream `reader` (a store's virtual disk) to `output` in `format`.
///
/// `progress_cb` receives (bytes read, `total`). Returns the number of disk
/// bytes exported.
pub fn export_disk(
    reader: &mut impl Read,
    total: u64,
    output: &Path,
    format: ExportFormat,
    progress_cb: &mut impl FnMut(u64, u64),
    cancel_check: &impl Fn() -> bool,
) -> Result<u64> {
    let mut progress = |done: u64| progress_cb(done, total);
    match format {
        ExportFormat::Raw => raw::write_sparse(reader, output, &mut progress, cancel_check),
        ExportFormat::Vhd => vhd::write_vhd(reader, output, &mut progress, cancel_check),
        ExportFormat::Zstd => zstd::write_zstd(reader, output, &mut progress, cancel_check),
    }
}

pub(crate) fn is_all_zeros(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}
