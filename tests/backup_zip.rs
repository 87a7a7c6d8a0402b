#[path = "../src/backup.rs"]
mod backup;

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn fake_sqlite(payload: &[u8]) -> Vec<u8> {
    let mut bytes = b"SQLite format 3\0".to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("attendd-backup-src");
    let workspace2 = temp_dir("attendd-backup-dst");
    let out_dir = temp_dir("attendd-backup-out");

    let bytes = fake_sqlite(b"attendance-test-payload");
    std::fs::write(workspace.join("attendance.sqlite3"), &bytes).expect("write source db");

    let bundle_path = out_dir.join("workspace.attendd.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT);
    assert_eq!(export.entry_count, 2);
    assert_eq!(export.db_sha256.len(), 64);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"].as_str(), Some(backup::BUNDLE_FORMAT));
    assert_eq!(manifest["dbSha256"].as_str(), Some(export.db_sha256.as_str()));
    archive
        .by_name("db/attendance.sqlite3")
        .expect("database entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT);
    assert_eq!(import.db_sha256, export.db_sha256);

    let restored = std::fs::read(workspace2.join("attendance.sqlite3")).expect("read restored db");
    assert_eq!(restored, bytes);
    assert!(!workspace2.join("attendance.sqlite3.importing").exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn raw_sqlite_import_is_supported() {
    let out_dir = temp_dir("attendd-backup-raw");
    let workspace = temp_dir("attendd-backup-raw-dst");

    let raw_file = out_dir.join("copy.sqlite3");
    let bytes = fake_sqlite(b"raw-copy");
    std::fs::write(&raw_file, &bytes).expect("write raw sqlite file");

    let import = backup::import_workspace_bundle(&raw_file, &workspace).expect("import raw sqlite");
    assert_eq!(import.bundle_format_detected, backup::RAW_SQLITE_FORMAT);

    let restored = std::fs::read(workspace.join("attendance.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unrecognised_input_leaves_workspace_untouched() {
    let out_dir = temp_dir("attendd-backup-junk");
    let workspace = temp_dir("attendd-backup-junk-dst");
    let existing = fake_sqlite(b"keep-me");
    std::fs::write(workspace.join("attendance.sqlite3"), &existing).expect("write existing db");

    let junk = out_dir.join("notes.txt");
    std::fs::write(&junk, b"definitely not a database").expect("write junk");
    assert!(backup::import_workspace_bundle(&junk, &workspace).is_err());

    let still = std::fs::read(workspace.join("attendance.sqlite3")).expect("read existing db");
    assert_eq!(still, existing);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tampered_bundle_fails_checksum() {
    let out_dir = temp_dir("attendd-backup-tamper");
    let workspace = temp_dir("attendd-backup-tamper-dst");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(
            serde_json::json!({
                "format": backup::BUNDLE_FORMAT,
                "dbSha256": "00".repeat(32)
            })
            .to_string()
            .as_bytes(),
        )
        .expect("write manifest");
        zip.start_file("db/attendance.sqlite3", opts).expect("db entry");
        zip.write_all(&fake_sqlite(b"edited")).expect("write db");
        zip.finish().expect("finish zip");
    }

    let e = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("checksum mismatch must fail");
    assert!(e.to_string().contains("checksum"), "{}", e);
    assert!(!workspace.join("attendance.sqlite3").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
