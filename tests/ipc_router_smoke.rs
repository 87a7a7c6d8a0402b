mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{request, request_err, request_ok, spawn_sidecar, str_field, temp_dir};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("attendd-router-smoke");
    let bundle_out = workspace.join("smoke-backup.zip");
    let csv_out = workspace.join("smoke-records.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health["workspacePath"].is_null());

    assert_eq!(
        request_err(&mut stdin, &mut reader, "2", "courses.list", json!({})),
        "no_workspace"
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "courses.create",
        json!({ "code": "IT101", "title": "Intro to Computing", "units": 3 }),
    );
    let course_id = str_field(&course, "courseId");
    let room = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "rooms.create",
        json!({ "roomNumber": "R-201", "roomType": "Lecture", "capacity": 40 }),
    );
    let room_id = str_field(&room, "roomId");
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sections.create",
        json!({ "name": "2A", "program": "BSIT", "yearLevel": 2, "courseId": course_id }),
    );
    let section_id = str_field(&section, "sectionId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({
            "id": "2024-0001",
            "name": "Ana Reyes",
            "email": "ana@school.example",
            "yearLevel": 2,
            "sectionId": section_id
        }),
    );
    assert_eq!(student["student"]["courseId"].as_str(), Some(course_id.as_str()));

    let _ = request_ok(&mut stdin, &mut reader, "9", "students.list", json!({}));
    let found = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.search",
        json!({ "sectionId": section_id, "query": "ana" }),
    );
    assert_eq!(found["students"].as_array().map(|a| a.len()), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "schedules.create",
        json!({
            "courseId": course_id,
            "sectionId": section_id,
            "roomId": room_id,
            "dayOfWeek": "M",
            "startTime": "08:00",
            "endTime": "09:30",
            "semester": "First",
            "schoolYear": "2026"
        }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "12", "schedules.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "schedules.month",
        json!({ "month": "2026-10" }),
    );

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "sessions.create",
        json!({ "sectionId": section_id }),
    );
    let session_id = str_field(&session, "sessionId");
    let _ = request_ok(&mut stdin, &mut reader, "15", "sessions.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "sessions.open",
        json!({ "sessionId": session_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "attendance.checkIn",
        json!({ "sessionId": session_id, "studentId": "2024-0001" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "sessions.roster",
        json!({ "sessionId": session_id }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "19", "attendance.records", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "attendance.exportCsv",
        json!({ "outPath": csv_out.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "students.importPreview",
        json!({ "text": "name,email,section\nBen Cruz,ben@school.example,BSIT-2A\n" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "22", "sessions.expireStale", json!({}));
    let stats = request_ok(&mut stdin, &mut reader, "23", "dashboard.stats", json!({}));
    assert_eq!(stats["students"].as_i64(), Some(1));
    assert_eq!(stats["activeSessions"].as_i64(), Some(1));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    assert!(bundle_out.is_file());
    assert!(csv_out.is_file());

    assert_eq!(
        request_err(&mut stdin, &mut reader, "25", "grades.list", json!({})),
        "not_implemented"
    );

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json frame");
    let frame: serde_json::Value = serde_json::from_str(line.trim()).expect("frame json");
    assert_eq!(frame["error"]["code"].as_str(), Some("bad_json"));

    // The loop keeps serving after a malformed line.
    let again = request(&mut stdin, &mut reader, "26", "health", json!({}));
    assert_eq!(again["ok"].as_bool(), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
