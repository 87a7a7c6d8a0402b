mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn restore_replaces_workspace_and_survives_bad_input() {
    let workspace = temp_dir("attendd-backup-ipc");
    let bundle = workspace.join("exports").join("snapshot.zip");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "code": "HIST1", "title": "World History" }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(exported["bundleFormat"].as_str(), Some("attendd-workspace-v1"));
    assert_eq!(exported["entryCount"].as_u64(), Some(2));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "courses.create",
        json!({ "code": "HIST2", "title": "Asian History" }),
    );

    let restored = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        restored["bundleFormatDetected"].as_str(),
        Some("attendd-workspace-v1")
    );
    assert_eq!(restored["dbSha256"], exported["dbSha256"]);
    let courses = request_ok(&mut stdin, &mut reader, "6", "courses.list", json!({}));
    assert_eq!(courses["courses"].as_array().map(|a| a.len()), Some(1));

    let garbage = workspace.join("not-a-backup.bin");
    std::fs::write(&garbage, b"definitely not a bundle").expect("write garbage");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "7",
            "backup.importWorkspaceBundle",
            json!({ "inPath": garbage.to_string_lossy() }),
        ),
        "io_failed"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "backup.importWorkspaceBundle",
            json!({ "inPath": workspace.join("missing.zip").to_string_lossy() }),
        ),
        "not_found"
    );

    // The previous workspace is still open after a failed restore.
    let courses = request_ok(&mut stdin, &mut reader, "9", "courses.list", json!({}));
    assert_eq!(courses["courses"][0]["code"].as_str(), Some("HIST1"));

    let _ = std::fs::remove_dir_all(workspace);
}
