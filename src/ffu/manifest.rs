//! The INI-style manifest stored after the image header.

use std::fmt::Write as _;

use serde::Serialize;

use crate::error::FfuError;
use crate::partition::gpt::Partition;

/// Values for the `[FullFlash]` section.
#[derive(Debug, Clone, Default)]
pub struct FullFlashParams {
    /// Manifest version, `1.0` for V1 containers and `2.0` for V2.
    pub version: String,
    pub os_version: String,
    pub description: String,
    pub antitheft_version: String,
    pub platform_ids: Vec<String>,
}

/// Values for one `[Store]` section and the `[Partition]` sections after it.
#[derive(Debug, Clone, Default)]
pub struct StoreParams {
    pub store_index: u16,
    pub device_path: String,
    pub sector_size: u32,
    /// Sectors the target device must have at least.
    pub min_sector_count: u64,
    pub is_main_os_store: bool,
    pub partitions: Vec<Partition>,
    /// Partitions left out of the store's payloads.
    pub skipped_partitions: Vec<String>,
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "True"
    } else {
        "False"
    }
}

/// Render the manifest text.
pub fn build_manifest(full_flash: &FullFlashParams, stores: &[StoreParams]) -> String {
    let mut out = String::new();
    out.push_str("[FullFlash]\r\n");
    let _ = write!(out, "Version = {}\r\n", full_flash.version);
    let _ = write!(out, "OSVersion = {}\r\n", full_flash.os_version);
    if !full_flash.description.is_empty() {
        let _ = write!(out, "Description = {}\r\n", full_flash.description);
    }
    if !full_flash.antitheft_version.is_empty() {
        let _ = write!(out, "AntiTheftVersion = {}\r\n", full_flash.antitheft_version);
    }
    for (i, id) in full_flash.platform_ids.iter().enumerate() {
        let _ = write!(out, "DevicePlatformId{i} = {id}\r\n");
    }

    for store in stores {
        out.push_str("\r\n[Store]\r\n");
        let _ = write!(out, "StoreIndex = {}\r\n", store.store_index);
        if !store.device_path.is_empty() {
            let _ = write!(out, "DevicePath = {}\r\n", store.device_path);
        }
        let _ = write!(out, "SectorSize = {}\r\n", store.sector_size);
        let _ = write!(out, "MinSectorCount = {}\r\n", store.min_sector_count);
        let _ = write!(out, "IsMainOSStore = {}\r\n", bool_str(store.is_main_os_store));

        for p in &store.partitions {
            let required = !store
                .skipped_partitions
                .iter()
                .any(|s| s.eq_ignore_ascii_case(&p.name));
            out.push_str("\r\n[Partition]\r\n");
            let _ = write!(out, "Name = {}\r\n", p.name);
            let _ = write!(out, "Type = {{{}}}\r\n", p.type_guid.to_string_formatted());
            let _ = write!(out, "Id = {{{}}}\r\n", p.partition_guid.to_string_formatted());
            let _ = write!(out, "FirstSector = {}\r\n", p.first_sector);
            let _ = write!(out, "TotalSectors = {}\r\n", p.size_in_sectors());
            let _ = write!(out, "Attributes = 0x{:016X}\r\n", p.attributes);
            let _ = write!(out, "RequiredToFlash = {}\r\n", bool_str(required));
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl ManifestSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed manifest: sections in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub sections: Vec<ManifestSection>,
}

impl Manifest {
    /// Parse manifest text. Blank lines and `;`/`#` comments are skipped;
    /// a key outside any section is a malformed record.
    pub fn parse(text: &str) -> Result<Self, FfuError> {
        let mut sections: Vec<ManifestSection> = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim().trim_end_matches('\0');
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.push(ManifestSection {
                    name: name.trim().to_string(),
                    entries: Vec::new(),
                });
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                FfuError::MalformedRecord(format!(
                    "manifest line {}: expected `key = value`, got {line:?}",
                    lineno + 1
                ))
            })?;
            let section = sections.last_mut().ok_or_else(|| {
                FfuError::MalformedRecord(format!(
                    "manifest line {}: entry outside of a section",
                    lineno + 1
                ))
            })?;
            section
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(Self { sections })
    }

    /// Value of `key` in the first section called `section`.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(section))
            .and_then(|s| s.get(key))
    }

    pub fn sections_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a ManifestSection> + 'a {
        self.sections
            .iter()
            .filter(move |s| s.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::gpt::tests::ms_basic_data_guid;
    use crate::partition::gpt::Guid;

    fn partition(name: &str, first: u64, last: u64) -> Partition {
        Partition {
            name: name.into(),
            first_sector: first,
            last_sector: last,
            type_guid: ms_basic_data_guid(),
            partition_guid: Guid::default(),
            attributes: 0,
        }
    }

    fn sample() -> String {
        let ff = FullFlashParams {
            version: "2.0".into(),
            os_version: "10.0.22621.1".into(),
            platform_ids: vec!["Contoso.Phone.1".into(), "Contoso.Phone.2".into()],
            ..Default::default()
        };
        let store = StoreParams {
            store_index: 1,
            device_path: "VenHw(860845C1-BE09-4355-8BC1-30D64FF8E63A)".into(),
            sector_size: 512,
            min_sector_count: 6664,
            is_main_os_store: true,
            partitions: vec![partition("EFIESP", 8, 2055), partition("DPP", 2056, 2063)],
            skipped_partitions: vec!["dpp".into()],
        };
        build_manifest(&ff, &[store])
    }

    #[test]
    fn test_build_manifest_sections() {
        let text = sample();
        assert!(text.starts_with("[FullFlash]\r\nVersion = 2.0\r\n"));
        assert!(text.contains("DevicePlatformId1 = Contoso.Phone.2\r\n"));
        assert!(text.contains("Type = {EBD0A0A2-B9E5-4433-87C0-68B6B72699C7}\r\n"));
        assert!(text.is_ascii());
    }

    #[test]
    fn test_parse_built_manifest() {
        let manifest = Manifest::parse(&sample()).unwrap();
        assert_eq!(manifest.get("FullFlash", "OSVersion"), Some("10.0.22621.1"));
        assert_eq!(manifest.get("store", "MinSectorCount"), Some("6664"));

        let parts: Vec<_> = manifest.sections_named("Partition").collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].get("TotalSectors"), Some("2048"));
        assert_eq!(parts[0].get("RequiredToFlash"), Some("True"));
        assert_eq!(parts[1].get("RequiredToFlash"), Some("False"));
    }

    #[test]
    fn test_parse_comments_and_padding() {
        let manifest = Manifest::parse("; header\n[A]\nkey=value\n\n# note\n[B]\nx = 1\0\0").unwrap();
        assert_eq!(manifest.sections.len(), 2);
        assert_eq!(manifest.get("A", "KEY"), Some("value"));
        assert_eq!(manifest.get("B", "x"), Some("1"));
        assert_eq!(manifest.get("C", "x"), None);
    }

    #[test]
    fn test_parse_rejects_orphan_entry() {
        assert!(matches!(
            Manifest::parse("key = value\n[A]\n"),
            Err(FfuError::MalformedRecord(_))
        ));
        assert!(matches!(
            Manifest::parse("[A]\nnot an entry\n"),
            Err(FfuError::MalformedRecord(_))
        ));
    }
}
