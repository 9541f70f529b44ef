//! Integration tests for rawprogram manifest validation

use anyhow::Result;
use mm_firmware_update::prelude::*;
use mm_firmware_update::{ActionKind, find_manifest};
use sha2::{Digest, Sha256};

fn bundle(files: &[(&str, &[u8])]) -> FirmwareBundle {
    FirmwareBundle::from_entries(files.iter().map(|(name, data)| (*name, data.to_vec())))
}

fn program(filename: &str, sectors: u64) -> String {
    format!(
        r#"<program SECTOR_SIZE_IN_BYTES="4096" filename="{filename}" label="{filename}" num_partition_sectors="{sectors}" physical_partition_number="0" start_sector="0"/>"#
    )
}

#[test]
fn test_actions_keep_document_order() -> Result<()> {
    let manifest = format!(
        "<data>{}{}{}</data>",
        program("C.bin", 1),
        program("A.bin", 1),
        program("B.bin", 1)
    );
    let page = vec![0u8; 4096];
    let archive = bundle(&[("A.bin", &page), ("B.bin", &page), ("C.bin", &page)]);

    let validated = ManifestValidator.validate(manifest.as_bytes(), &archive)?;
    let files: Vec<_> = validated
        .payload_actions()
        .filter_map(|a| a.filename.as_deref())
        .collect();

    assert_eq!(files, vec!["C.bin", "A.bin", "B.bin"]);
    Ok(())
}

#[test]
fn test_one_missing_file_rejects_whole_manifest() -> Result<()> {
    let manifest = format!(
        "<data>{}{}{}</data>",
        program("A.bin", 1),
        program("B.bin", 1),
        program("C.bin", 1)
    );
    let page = vec![0u8; 4096];
    let archive = bundle(&[("A.bin", &page), ("C.bin", &page)]);

    let Err(err) = ManifestValidator.validate(manifest.as_bytes(), &archive) else {
        anyhow::bail!("manifest should have been rejected");
    };

    assert_eq!(err.kind(), ErrorKind::Validation);
    let message = err.to_string();
    assert!(message.contains("manifest action 1"), "{message}");
    assert!(message.contains("B.bin not found"), "{message}");
    Ok(())
}

#[test]
fn test_realistic_manifest_with_checksums() -> Result<()> {
    let sbl = vec![0x11u8; 8192];
    let tz = vec![0x22u8; 4096];
    let sbl_hash = hex::encode(Sha256::digest(&sbl));
    let tz_hash = hex::encode(Sha256::digest(&tz)).to_ascii_uppercase();
    let manifest = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<!-- generated by the factory tool -->
<data>
  <program SECTOR_SIZE_IN_BYTES="4096" file_sector_offset="0" filename="sbl1.mbn"
           label="sbl" num_partition_sectors="2" physical_partition_number="0"
           sha256="{sbl_hash}" start_sector="256"/>
  <program SECTOR_SIZE_IN_BYTES="4096" filename="tz.mbn" label="tz"
           num_partition_sectors="1" physical_partition_number="0"
           sha256="{tz_hash}" start_sector="258"/>
  <erase SECTOR_SIZE_IN_BYTES="4096" label="efs2" num_partition_sectors="16"
         physical_partition_number="0" start_sector="512"/>
  <program SECTOR_SIZE_IN_BYTES="4096" filename="" label="cache"
           num_partition_sectors="64" physical_partition_number="0" start_sector="1024"/>
</data>
"#
    );
    let archive = bundle(&[("sbl1.mbn", &sbl), ("tz.mbn", &tz)]);

    let validated = ManifestValidator.validate(manifest.as_bytes(), &archive)?;

    let actions = validated.actions();
    assert_eq!(actions.len(), 4);
    let kinds: Vec<_> = actions.iter().map(|a| a.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            ActionKind::Program,
            ActionKind::Program,
            ActionKind::Erase,
            ActionKind::Program
        ]
    );
    let first = actions.first().ok_or_else(|| anyhow::anyhow!("no actions"))?;
    assert_eq!(first.label.as_deref(), Some("sbl"));
    assert_eq!(first.declared_size(), Some(8192));
    assert_eq!(first.offset_bytes(), Some(256 * 4096));
    assert_eq!(validated.payload_actions().count(), 2);
    Ok(())
}

#[test]
fn test_checksum_mismatch_is_rejected() -> Result<()> {
    let image = vec![0x33u8; 4096];
    let manifest = format!(
        r#"<data><program SECTOR_SIZE_IN_BYTES="4096" filename="apps.mbn" num_partition_sectors="1" sha256="{}"/></data>"#,
        "0".repeat(64)
    );
    let archive = bundle(&[("apps.mbn", &image)]);

    let Err(err) = ManifestValidator.validate(manifest.as_bytes(), &archive) else {
        anyhow::bail!("checksum mismatch should have been rejected");
    };
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("apps.mbn checksum"));
    Ok(())
}

#[test]
fn test_erase_only_manifest_is_valid() -> Result<()> {
    let manifest = r#"<data>
        <erase SECTOR_SIZE_IN_BYTES="4096" label="efs1" num_partition_sectors="8" start_sector="0"/>
        <erase SECTOR_SIZE_IN_BYTES="4096" label="efs2" num_partition_sectors="8" start_sector="8"/>
    </data>"#;
    let archive = bundle(&[]);

    let validated = ManifestValidator.validate(manifest.as_bytes(), &archive)?;

    assert_eq!(validated.actions().len(), 2);
    assert_eq!(validated.payload_actions().count(), 0);
    Ok(())
}

#[test]
fn test_empty_and_malformed_manifests() {
    let archive = bundle(&[]);
    for manifest in ["<data></data>", "<data/>", "", "<data><program", "not xml at all"] {
        let result = ManifestValidator.validate(manifest.as_bytes(), &archive);
        assert!(
            matches!(&result, Err(e) if e.kind() == ErrorKind::Validation),
            "{manifest:?} gave {result:?}"
        );
    }
}

#[test]
fn test_find_manifest_uses_prefix_and_suffix() {
    let archive = bundle(&[
        ("patch0.xml", b"<data/>"),
        ("rawprogram_unsparse.xml.bak", b""),
        ("rawprogram_unsparse.xml", b"<data/>"),
        ("rawprogram1.xml", b"<data/>"),
    ]);

    let found = find_manifest(&archive, "rawprogram", ".xml").map(|e| e.name);
    assert_eq!(found, Some("rawprogram_unsparse.xml"));
    assert!(find_manifest(&archive, "contents", ".xml").is_none());
}
