//! Firmware bundles
//!
//! A bundle is a decompressed, read-only set of named payload files. Entries
//! are always visited in the container's own order; the config path relies on
//! that order and never sorts.

use std::io::{Cursor, Read};

use tracing::{debug, trace};
use zip::ZipArchive;

use crate::error::{Result, UpdateError};

/// One file in a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveEntry<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Read access to a decompressed firmware bundle
pub trait FirmwareArchive {
    /// Entries in container order; each call starts from the beginning
    fn entries(&self) -> Box<dyn Iterator<Item = ArchiveEntry<'_>> + '_>;

    /// First entry called `name`
    fn lookup(&self, name: &str) -> Option<&[u8]> {
        self.entries().find(|e| e.name == name).map(|e| e.data)
    }
}

/// In-memory firmware bundle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareBundle {
    files: Vec<(String, Vec<u8>)>,
}

impl FirmwareBundle {
    /// Decode a zip container
    ///
    /// Directory entries are skipped and files are keyed by their basename,
    /// so `images/mcfg.A2.mbn` is visible as `mcfg.A2.mbn`.
    pub fn from_zip(bytes: &[u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| UpdateError::Validation(format!("failed to decode firmware archive: {e}")))?;

        let mut files = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut file = archive.by_index(index).map_err(|e| {
                UpdateError::Validation(format!("failed to read archive entry {index}: {e}"))
            })?;
            if file.is_dir() {
                continue;
            }
            let name = basename(file.name()).to_string();
            if name.is_empty() {
                continue;
            }
            let mut data = Vec::new();
            file.read_to_end(&mut data).map_err(|e| {
                UpdateError::Validation(format!("failed to decompress {name}: {e}"))
            })?;
            trace!("archive entry {} ({} bytes)", name, data.len());
            files.push((name, data));
        }
        debug!("decoded firmware archive with {} files", files.len());
        Ok(Self { files })
    }

    /// Build a bundle from already-decompressed `(name, bytes)` pairs, keeping their order
    pub fn from_entries<I, N, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: Into<Vec<u8>>,
    {
        Self {
            files: entries
                .into_iter()
                .map(|(name, data)| (name.into(), data.into()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.files.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl FirmwareArchive for FirmwareBundle {
    fn entries(&self) -> Box<dyn Iterator<Item = ArchiveEntry<'_>> + '_> {
        Box::new(self.files.iter().map(|(name, data)| ArchiveEntry {
            name: name.as_str(),
            data: data.as_slice(),
        }))
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether `name` is a configuration payload (`mcfg.<token>.mbn`)
pub fn is_config_payload(name: &str) -> bool {
    name.strip_prefix("mcfg.")
        .and_then(|rest| rest.strip_suffix(".mbn"))
        .is_some_and(|token| !token.is_empty())
}

/// Configuration payloads of `archive`, in archive order
pub fn config_payloads(archive: &dyn FirmwareArchive) -> impl Iterator<Item = ArchiveEntry<'_>> {
    archive.entries().filter(|e| is_config_payload(e.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    fn zip_bytes(files: &[(&str, &[u8])]) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        zip.add_directory("images/", options)?;
        for (name, data) in files {
            zip.start_file(*name, options)?;
            zip.write_all(data)?;
        }
        Ok(zip.finish()?.into_inner())
    }

    #[test]
    fn test_config_payload_pattern() {
        assert!(is_config_payload("mcfg.A2.018.mbn"));
        assert!(is_config_payload("mcfg.B1.mbn"));
        assert!(!is_config_payload("readme.txt"));
        assert!(!is_config_payload("mcfg.mbn"));
        assert!(!is_config_payload("mcfg..mbn"));
        assert!(!is_config_payload("xmcfg.A.mbn"));
        assert!(!is_config_payload("mcfg.A.mbn.bak"));
    }

    #[test]
    fn test_from_zip_keeps_order_and_basenames() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let bytes = zip_bytes(&[
            ("images/mcfg.Z.mbn", b"zz"),
            ("readme.txt", b"hello"),
            ("images/mcfg.A.mbn", b"aa"),
        ])?;
        let bundle = FirmwareBundle::from_zip(&bytes)?;
        assert_eq!(bundle.names(), vec!["mcfg.Z.mbn", "readme.txt", "mcfg.A.mbn"]);
        assert_eq!(bundle.lookup("readme.txt"), Some(b"hello".as_slice()));

        let selected: Vec<&str> = config_payloads(&bundle).map(|e| e.name).collect();
        assert_eq!(selected, vec!["mcfg.Z.mbn", "mcfg.A.mbn"]);
        Ok(())
    }

    #[test]
    fn test_from_zip_rejects_garbage() {
        let result = FirmwareBundle::from_zip(b"definitely not a zip");
        assert!(matches!(result, Err(UpdateError::Validation(_))));
    }

    #[test]
    fn test_entries_restart() {
        let bundle = FirmwareBundle::from_entries([("a", b"1".to_vec()), ("b", b"2".to_vec())]);
        assert_eq!(bundle.entries().count(), 2);
        assert_eq!(bundle.entries().next().map(|e| e.name), Some("a"));
        assert!(bundle.lookup("c").is_none());
    }
}
