//! Fetch manifests.
//!
//! A manifest records one fetch/import operation: the version, a
//! timestamp, and every file's size and sha256. It is written once per
//! operation and never mutated afterwards; a re-fetch of a different
//! version supersedes it with a fresh manifest. The verification engine
//! and the boot-config generator both read it.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::fsutil;

/// File name of the manifest inside an asset directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// One file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

/// Record of one fetch/import operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub timestamp: String,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(version: &str) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("unknown-time"));
        Self {
            version: version.to_string(),
            timestamp,
            files: Vec::new(),
        }
    }

    /// Record a file. Names must be unique within one manifest.
    pub fn record(&mut self, name: &str, size: u64, sha256: &str) -> Result<()> {
        if !fsutil::is_hex_64(sha256) {
            bail!("invalid sha256 for '{name}': {sha256}");
        }
        if self.entry(name).is_some() {
            bail!("duplicate manifest entry '{name}'");
        }
        self.files.push(ManifestEntry {
            name: name.to_string(),
            size,
            sha256: sha256.to_string(),
        });
        Ok(())
    }

    pub fn entry(&self, name: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Write as pretty JSON via temp file + atomic rename.
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let tmp = parent.join(fsutil::tmp_name(".manifest"));
        fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write manifest temp {}", tmp.display()))?;
        fsutil::atomic_move(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse manifest {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SHA_A: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");

        let mut m = Manifest::new("2024.1");
        m.record("vmlinuz", 5, SHA_A).unwrap();
        m.write(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.version, "2024.1");
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.entry("vmlinuz").unwrap().sha256, SHA_A);
        assert!(loaded.entry("initrd.img").is_none());
    }

    #[test]
    fn rejects_bad_digest_and_duplicates() {
        let mut m = Manifest::new("v");
        assert!(m.record("a", 1, "nothex").is_err());
        m.record("a", 1, SHA_A).unwrap();
        assert!(m.record("a", 1, SHA_A).is_err());
    }

    #[test]
    fn write_replaces_previous_manifest_as_a_unit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");

        let mut first = Manifest::new("v1");
        first.record("a", 1, SHA_A).unwrap();
        first.write(&path).unwrap();

        let second = Manifest::new("v2");
        second.write(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.version, "v2");
        assert!(loaded.files.is_empty());
    }
}
