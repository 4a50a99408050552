//! Catalog signing for the container's hash table.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::FfuError;

static SIGN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Produces the catalog stored between the security header and the hash table.
pub trait CatalogSigner {
    fn sign_catalog(&self, hash_table: &[u8]) -> Result<Vec<u8>, FfuError>;
}

/// Leaves the container unsigned: the catalog is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsignedCatalog;

impl CatalogSigner for UnsignedCatalog {
    fn sign_catalog(&self, _hash_table: &[u8]) -> Result<Vec<u8>, FfuError> {
        Ok(Vec::new())
    }
}

/// Runs an external tool that reads the hash table from `{input}` and
/// writes the signed catalog to `{output}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSigner {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ExternalSigner {
    fn temp_path(seq: u64, name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            ".rusty-ffu-{}-{seq}-{name}",
            std::process::id()
        ))
    }

    fn expand_args(&self, input: &Path, output: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect()
    }

    fn run(&self, input: &Path, output: &Path) -> Result<Vec<u8>, FfuError> {
        let args = self.expand_args(input, output);
        debug!("Running catalog signer: {} {}", self.program, args.join(" "));
        let result = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| FfuError::Signing(format!("failed to run {}: {e}", self.program)))?;

        for line in String::from_utf8_lossy(&result.stderr).lines() {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                debug!("{}: {trimmed}", self.program);
            }
        }
        if !result.status.success() {
            return Err(FfuError::Signing(format!(
                "{} exited with {}",
                self.program, result.status
            )));
        }
        fs::read(output).map_err(|e| {
            FfuError::Signing(format!(
                "{} did not produce {}: {e}",
                self.program,
                output.display()
            ))
        })
    }
}

impl CatalogSigner for ExternalSigner {
    fn sign_catalog(&self, hash_table: &[u8]) -> Result<Vec<u8>, FfuError> {
        let seq = SIGN_SEQ.fetch_add(1, Ordering::Relaxed);
        let input = Self::temp_path(seq, "hashtable.bin");
        let output = Self::temp_path(seq, "catalog.cat");
        fs::write(&input, hash_table)?;
        let result = self.run(&input, &output);
        let _ = fs::remove_file(&input);
        let _ = fs::remove_file(&output);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_catalog_is_empty() {
        assert!(UnsignedCatalog.sign_catalog(&[1, 2, 3]).unwrap().is_empty());
    }

    #[test]
    fn test_expand_args() {
        let signer = ExternalSigner {
            program: "signtool".into(),
            args: vec!["--in={input}".into(), "{output}".into(), "-v".into()],
        };
        let args = signer.expand_args(Path::new("/tmp/a.bin"), Path::new("/tmp/b.cat"));
        assert_eq!(args, vec!["--in=/tmp/a.bin", "/tmp/b.cat", "-v"]);
    }

    #[test]
    fn test_missing_program_is_signing_error() {
        let signer = ExternalSigner {
            program: "rusty-ffu-no-such-signer".into(),
            args: vec![],
        };
        let err = signer.sign_catalog(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, FfuError::Signing(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_signer_copies_table() {
        let signer = ExternalSigner {
            program: "cp".into(),
            args: vec!["{input}".into(), "{output}".into()],
        };
        let table = vec![0xABu8; 64];
        assert_eq!(signer.sign_catalog(&table).unwrap(), table);
    }
}
