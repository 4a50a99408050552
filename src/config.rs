//! Generation defaults loaded from config.json

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::compress::CompressionAlgorithm;
use crate::error::FfuError;
use crate::ffu::structs::DeviceTargetInfo;
use crate::ffu::{FfuOptions, FormatVersion};
use crate::sign::ExternalSigner;

/// Device-specific partitions left out of generated images by default.
pub const DEFAULT_EXCLUDED_PARTITIONS: &[&str] = &[
    "DPP",
    "MODEM_FSG",
    "MODEM_FS1",
    "MODEM_FS2",
    "MODEM_FSC",
    "DDR",
    "SEC",
    "APDP",
    "MSADP",
    "DPO",
    "SSD",
    "DBI",
    "UEFI_BS_NV",
    "UEFI_NV",
    "UEFI_RT_NV",
    "UEFI_RT_NV_RPMB",
    "BOOTMODE",
    "LIMITS",
    "BACKUP_BS_NV",
    "BACKUP_UEFI_BS_NV",
    "BACKUP_UEFI_RT_NV",
    "BACKUP_UEFI_RT_NV_RPMB",
    "MODEM_FSG_OEM_1",
    "MODEM_FSG_OEM_2",
];

fn default_excluded() -> Vec<String> {
    DEFAULT_EXCLUDED_PARTITIONS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FfuConfig {
    pub block_size: u32,
    pub sector_size: u32,
    pub max_blank_blocks: u32,
    pub format: FormatVersion,
    pub compression: Option<CompressionAlgorithm>,
    pub platform_ids: Vec<String>,
    pub excluded_partitions: Vec<String>,
    pub os_version: String,
    pub description: String,
    pub device_targets: Vec<DeviceTargetInfo>,
    pub signing: Option<ExternalSigner>,
}

impl Default for FfuConfig {
    fn default() -> Self {
        Self {
            block_size: 0x20000,
            sector_size: 512,
            max_blank_blocks: 100,
            format: FormatVersion::V1,
            compression: None,
            platform_ids: Vec::new(),
            excluded_partitions: default_excluded(),
            os_version: String::new(),
            description: String::new(),
            device_targets: Vec::new(),
            signing: None,
        }
    }
}

impl FfuConfig {
    pub fn user_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rusty-ffu"))
    }

    pub fn user_config_path() -> Option<PathBuf> {
        Self::user_config_dir().map(|dir| dir.join("config.json"))
    }

    /// Load from the user config directory, the current directory or the
    /// executable's directory, in that order; defaults if none parses.
    pub fn load() -> Self {
        let mut candidates = Vec::new();
        if let Some(user) = Self::user_config_path() {
            candidates.push(user);
        }
        candidates.push(PathBuf::from("config.json"));
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            candidates.push(exe_dir.join("config.json"));
        }

        for path in candidates {
            if !path.is_file() {
                continue;
            }
            match Self::load_from_path(&path) {
                Ok(config) => {
                    debug!("Loaded configuration from {}", path.display());
                    return config;
                }
                Err(e) => debug!("Ignoring {}: {e:#}", path.display()),
            }
        }
        Self::default()
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: FfuConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Check the container rules for a single-store run.
    pub fn validate(&self) -> Result<(), FfuError> {
        self.ffu_options().validate(1)
    }

    /// Container options for this configuration.
    pub fn ffu_options(&self) -> FfuOptions {
        FfuOptions {
            format: self.format,
            block_size: self.block_size,
            sector_size: self.sector_size,
            platform_ids: self.platform_ids.clone(),
            compression: self.compression,
            os_version: self.os_version.clone(),
            description: self.description.clone(),
            device_targets: self.device_targets.clone(),
        }
    }
}

/// Read partition names from a text file: one per line, `#` starts a comment.
pub fn load_exclusion_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read exclusion list {}", path.display()))?;
    Ok(parse_exclusion_list(&content))
}

pub fn parse_exclusion_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
