//! Flashing manifest parsing and validation
//!
//! Manifests are rawprogram-style XML documents: a single root element whose
//! children are flash actions (`program`, `erase`, `patch`, ...), each
//! described entirely by attributes. Actions are kept in document order;
//! later actions may depend on storage written by earlier ones, so the order
//! is never changed.
//!
//! Validation is all-or-nothing. A manifest either comes back with every
//! action checked against the bundle or not at all.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::archive::{ArchiveEntry, FirmwareArchive};
use crate::error::{Result, UpdateError};

/// What an action does to the target storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[default]
    Program,
    Erase,
    Patch,
    /// Any other element name, kept verbatim
    Other(String),
}

impl ActionKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "program" => ActionKind::Program,
            "erase" => ActionKind::Erase,
            "patch" => ActionKind::Patch,
            other => ActionKind::Other(other.to_string()),
        }
    }
}

/// One flash action, in manifest order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestAction {
    pub kind: ActionKind,
    pub label: Option<String>,
    /// Target storage (`physical_partition_number`)
    pub physical_partition: Option<u32>,
    /// Raw `start_sector`; may be an expression such as `NUM_DISK_SECTORS-33.`
    pub start_sector: Option<String>,
    pub sector_size: Option<u64>,
    pub num_sectors: Option<u64>,
    /// Payload file; `None` when the action writes nothing from the bundle.
    /// On `patch` actions this names the target (`DISK`), not a bundle file.
    pub filename: Option<String>,
    /// Expected SHA-256 of the payload, lowercase hex
    pub sha256: Option<String>,
}

impl ManifestAction {
    /// Bundle file this action writes, if any
    pub fn payload(&self) -> Option<&str> {
        match self.kind {
            ActionKind::Patch => None,
            _ => self.filename.as_deref(),
        }
    }

    /// Byte offset of the action, when the start sector is numeric
    pub fn offset_bytes(&self) -> Option<u64> {
        let start: u64 = self.start_sector.as_deref()?.trim().parse().ok()?;
        start.checked_mul(self.sector_size?)
    }

    /// Payload size implied by the sector fields
    pub fn declared_size(&self) -> Option<u64> {
        self.num_sectors?.checked_mul(self.sector_size?)
    }

    fn describe(&self) -> String {
        match (&self.label, &self.filename) {
            (Some(label), Some(file)) => format!("{label} ({file})"),
            (Some(label), None) => label.clone(),
            (None, Some(file)) => file.clone(),
            (None, None) => format!("{:?}", self.kind),
        }
    }
}

/// A manifest whose actions were all checked against a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedManifest {
    actions: Vec<ManifestAction>,
}

impl ValidatedManifest {
    pub fn actions(&self) -> &[ManifestAction] {
        &self.actions
    }

    pub fn into_actions(self) -> Vec<ManifestAction> {
        self.actions
    }

    /// Actions that carry a payload file, in order
    pub fn payload_actions(&self) -> impl Iterator<Item = &ManifestAction> {
        self.actions.iter().filter(|a| a.payload().is_some())
    }
}

/// Cross-checks manifests against firmware bundles
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestValidator;

impl ManifestValidator {
    /// Parse `manifest` and check every action against `archive`
    ///
    /// A referenced file that is missing, has the wrong size or the wrong
    /// checksum fails the whole manifest.
    pub fn validate(
        &self,
        manifest: &[u8],
        archive: &dyn FirmwareArchive,
    ) -> Result<ValidatedManifest> {
        let actions = parse_actions(manifest)?;
        if actions.is_empty() {
            return Err(UpdateError::Validation(
                "manifest does not contain any actions".to_string(),
            ));
        }

        for (index, action) in actions.iter().enumerate() {
            check_action(action, archive).map_err(|e| {
                e.context(format!("manifest action {index} {}", action.describe()))
            })?;
        }

        debug!("validated manifest with {} actions", actions.len());
        Ok(ValidatedManifest { actions })
    }
}

/// First entry named `<prefix>*<suffix>` in archive order
pub fn find_manifest<'a>(
    archive: &'a dyn FirmwareArchive,
    prefix: &str,
    suffix: &str,
) -> Option<ArchiveEntry<'a>> {
    archive.entries().find(|e| {
        e.name.len() >= prefix.len().saturating_add(suffix.len())
            && e.name.starts_with(prefix)
            && e.name.ends_with(suffix)
    })
}

fn check_action(action: &ManifestAction, archive: &dyn FirmwareArchive) -> Result<()> {
    let Some(filename) = action.payload() else {
        return Ok(());
    };
    let data = archive.lookup(filename).ok_or_else(|| {
        UpdateError::Validation(format!("{filename} not found in firmware archive"))
    })?;

    if let Some(expected) = action.declared_size() {
        let actual = u64::try_from(data.len()).unwrap_or(u64::MAX);
        if actual != expected {
            return Err(UpdateError::Validation(format!(
                "{filename} is {actual} bytes, manifest declares {expected}"
            )));
        }
    }

    if let Some(expected) = action.sha256.as_deref() {
        let actual = hex::encode(Sha256::digest(data));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(UpdateError::Validation(format!(
                "{filename} checksum {actual} does not match {expected}"
            )));
        }
    }

    trace!("{} matches manifest ({} bytes)", filename, data.len());
    Ok(())
}

fn parse_actions(manifest: &[u8]) -> Result<Vec<ManifestAction>> {
    let text = std::str::from_utf8(manifest)
        .map_err(|e| UpdateError::Validation(format!("manifest is not UTF-8: {e}")))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut actions = Vec::new();
    let mut depth = 0usize;
    let mut saw_root = false;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            UpdateError::Validation(format!(
                "malformed manifest at byte {}: {e}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(element) => {
                if depth == 1 {
                    actions.push(parse_action(&element)?);
                }
                saw_root = true;
                depth = depth.saturating_add(1);
            }
            Event::Empty(element) => {
                if depth == 1 {
                    actions.push(parse_action(&element)?);
                }
                saw_root = true;
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(UpdateError::Validation("manifest has no root element".to_string()));
    }
    if depth != 0 {
        return Err(UpdateError::Validation("manifest ends inside an element".to_string()));
    }
    Ok(actions)
}

fn parse_action(element: &BytesStart<'_>) -> Result<ManifestAction> {
    let tag = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut action = ManifestAction {
        kind: ActionKind::from_tag(&tag),
        ..ManifestAction::default()
    };

    for attr in element.attributes() {
        let attr = attr
            .map_err(|e| UpdateError::Validation(format!("bad attribute on <{tag}>: {e}")))?;
        let value = attr
            .unescape_value()
            .map_err(|e| UpdateError::Validation(format!("bad attribute on <{tag}>: {e}")))?;
        let value = value.trim();
        match attr.key.as_ref() {
            b"SECTOR_SIZE_IN_BYTES" => {
                action.sector_size = Some(parse_number(&tag, "SECTOR_SIZE_IN_BYTES", value)?);
            }
            b"num_partition_sectors" => {
                action.num_sectors = Some(parse_number(&tag, "num_partition_sectors", value)?);
            }
            b"physical_partition_number" => {
                let number = parse_number(&tag, "physical_partition_number", value)?;
                action.physical_partition = Some(u32::try_from(number).map_err(|e| {
                    UpdateError::Validation(format!(
                        "<{tag}> physical_partition_number {number}: {e}"
                    ))
                })?);
            }
            b"start_sector" if !value.is_empty() => action.start_sector = Some(value.to_string()),
            b"filename" if !value.is_empty() => action.filename = Some(value.to_string()),
            b"label" if !value.is_empty() => action.label = Some(value.to_string()),
            b"sha256" if !value.is_empty() => action.sha256 = Some(value.to_ascii_lowercase()),
            _ => {}
        }
    }

    if action.num_sectors.is_some() && action.sector_size.is_none() {
        return Err(UpdateError::Validation(format!(
            "<{tag}> has num_partition_sectors but no SECTOR_SIZE_IN_BYTES"
        )));
    }
    Ok(action)
}

fn parse_number(tag: &str, name: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|e| {
        UpdateError::Validation(format!("<{tag}> {name} is not a number: {value:?} ({e})"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FirmwareBundle;

    const MANIFEST: &str = r#"<?xml version="1.0" ?>
<data>
  <!-- partition table first -->
  <program SECTOR_SIZE_IN_BYTES="4096" filename="gpt_main0.bin" label="PrimaryGPT"
           num_partition_sectors="1" physical_partition_number="0" start_sector="0"/>
  <erase SECTOR_SIZE_IN_BYTES="4096" label="modemst1" num_partition_sectors="2"
         physical_partition_number="0" start_sector="6"/>
  <program SECTOR_SIZE_IN_BYTES="4096" filename="" label="cache"
           num_partition_sectors="8" physical_partition_number="0" start_sector="10"/>
  <program SECTOR_SIZE_IN_BYTES="4096" filename="modem.img" label="modem"
           num_partition_sectors="2" physical_partition_number="0" start_sector="40"/>
  <patch SECTOR_SIZE_IN_BYTES="4096" filename="DISK" start_sector="NUM_DISK_SECTORS-5."/>
</data>
"#;

    fn bundle() -> FirmwareBundle {
        FirmwareBundle::from_entries([
            ("gpt_main0.bin", vec![0u8; 4096]),
            ("modem.img", vec![1u8; 8192]),
        ])
    }

    #[test]
    fn test_actions_in_document_order() -> Result<()> {
        let manifest = ManifestValidator.validate(MANIFEST.as_bytes(), &bundle())?;
        let kinds: Vec<ActionKind> = manifest.actions().iter().map(|a| a.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                ActionKind::Program,
                ActionKind::Erase,
                ActionKind::Program,
                ActionKind::Program,
                ActionKind::Patch,
            ]
        );
        let files: Vec<&str> = manifest
            .payload_actions()
            .filter_map(|a| a.filename.as_deref())
            .collect();
        assert_eq!(files, vec!["gpt_main0.bin", "modem.img"]);
        Ok(())
    }

    #[test]
    fn test_patch_target_is_not_a_payload() -> Result<()> {
        let xml = r#"<data>
  <program SECTOR_SIZE_IN_BYTES="512" filename="sbl1.mbn" num_partition_sectors="1"/>
  <patch SECTOR_SIZE_IN_BYTES="512" byte_offset="72" filename="DISK" physical_partition_number="0"
         size_in_bytes="8" start_sector="NUM_DISK_SECTORS-1." value="NUM_DISK_SECTORS-34."/>
  <patch SECTOR_SIZE_IN_BYTES="512" filename="gpt_main0.bin" start_sector="1"/>
</data>"#;
        // neither DISK nor the patched image ships in the bundle
        let bundle = FirmwareBundle::from_entries([("sbl1.mbn", vec![0u8; 512])]);

        let manifest = ManifestValidator.validate(xml.as_bytes(), &bundle)?;

        assert_eq!(manifest.actions().len(), 3);
        let patch = manifest.actions().get(1);
        assert_eq!(patch.and_then(|a| a.filename.as_deref()), Some("DISK"));
        assert_eq!(patch.and_then(ManifestAction::payload), None);
        let files: Vec<&str> = manifest.payload_actions().filter_map(ManifestAction::payload).collect();
        assert_eq!(files, vec!["sbl1.mbn"]);
        Ok(())
    }

    #[test]
    fn test_offsets() -> Result<()> {
        let manifest = ManifestValidator.validate(MANIFEST.as_bytes(), &bundle())?;
        let actions = manifest.actions();
        assert_eq!(actions.get(3).and_then(ManifestAction::offset_bytes), Some(40 * 4096));
        assert_eq!(actions.get(3).and_then(ManifestAction::declared_size), Some(8192));
        assert_eq!(actions.get(4).and_then(ManifestAction::offset_bytes), None);
        assert_eq!(
            actions.get(4).and_then(|a| a.start_sector.as_deref()),
            Some("NUM_DISK_SECTORS-5.")
        );
        Ok(())
    }

    #[test]
    fn test_size_mismatch_fails_whole_manifest() {
        let bundle = FirmwareBundle::from_entries([
            ("gpt_main0.bin", vec![0u8; 4096]),
            ("modem.img", vec![1u8; 8191]),
        ]);
        let err = ManifestValidator.validate(MANIFEST.as_bytes(), &bundle).err();
        assert!(matches!(err.as_ref().map(UpdateError::kind), Some(crate::error::ErrorKind::Validation)));
        assert!(err.is_some_and(|e| e.to_string().contains("modem.img is 8191 bytes")));
    }

    #[test]
    fn test_sectors_without_sector_size() {
        let xml = r#"<data><program filename="a.bin" num_partition_sectors="1"/></data>"#;
        let bundle = FirmwareBundle::from_entries([("a.bin", vec![0u8; 512])]);
        assert!(matches!(
            ManifestValidator.validate(xml.as_bytes(), &bundle),
            Err(UpdateError::Validation(_))
        ));
    }

    #[test]
    fn test_non_numeric_sector_size() {
        let xml = r#"<data><program SECTOR_SIZE_IN_BYTES="big" filename="a.bin"/></data>"#;
        let bundle = FirmwareBundle::from_entries([("a.bin", vec![0u8; 512])]);
        assert!(matches!(
            ManifestValidator.validate(xml.as_bytes(), &bundle),
            Err(UpdateError::Validation(_))
        ));
    }

    #[test]
    fn test_sha256_checked() -> Result<()> {
        let digest = hex::encode(Sha256::digest(b"payload"));
        let xml = format!(r#"<data><program filename="a.bin" sha256="{}"/></data>"#, digest.to_uppercase());
        let good = FirmwareBundle::from_entries([("a.bin", b"payload".to_vec())]);
        ManifestValidator.validate(xml.as_bytes(), &good)?;

        let bad = FirmwareBundle::from_entries([("a.bin", b"tampered".to_vec())]);
        assert!(matches!(
            ManifestValidator.validate(xml.as_bytes(), &bad).map_err(|e| e.kind()),
            Err(crate::error::ErrorKind::Validation)
        ));
        Ok(())
    }

    #[test]
    fn test_malformed_and_empty_manifests() {
        let bundle = FirmwareBundle::default();
        for xml in ["<data><program filename=\"a\"></data>", "<data>", "", "<data></data>", "<data/>"] {
            assert!(
                matches!(
                    ManifestValidator.validate(xml.as_bytes(), &bundle),
                    Err(UpdateError::Validation(_))
                ),
                "{xml:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_find_manifest_first_match() {
        let bundle = FirmwareBundle::from_entries([
            ("readme.txt", b"x".to_vec()),
            ("rawprogram_unsparse0.xml", b"<data/>".to_vec()),
            ("rawprogram1.xml", b"<data/>".to_vec()),
            ("patch0.xml", b"<data/>".to_vec()),
        ]);
        let found = find_manifest(&bundle, "rawprogram", ".xml").map(|e| e.name);
        assert_eq!(found, Some("rawprogram_unsparse0.xml"));
        assert!(find_manifest(&bundle, "firehose", ".xml").is_none());
    }
}
