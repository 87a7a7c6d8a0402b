mod test_support;

use chrono::{Duration, NaiveDate, Utc};
use serde_json::json;
use test_support::{request_ok, spawn_sidecar, str_field, temp_dir};

const CSV_HEADER: &str = "timestamp,student_id,student_name,section,course,status,verification_method";

#[test]
fn csv_export_quotes_names_and_honors_filters() {
    let workspace = temp_dir("attendd-export-csv");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "code": "IT101", "title": "Intro to Computing" }),
    );
    let course_id = str_field(&course, "courseId");
    let section_a = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sections.create",
        json!({ "name": "2A", "program": "BSIT", "yearLevel": 2, "courseId": course_id }),
    );
    let section_a = str_field(&section_a, "sectionId");
    let section_b = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sections.create",
        json!({ "name": "2B", "program": "BSIT", "yearLevel": 2, "courseId": course_id }),
    );
    let section_b = str_field(&section_b, "sectionId");
    for (id, student, name, section) in [
        ("5", "S1", "Santos, Mia", &section_a),
        ("6", "S2", "Ben Cruz", &section_a),
        ("7", "S3", "Lia Tan", &section_b),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "students.create",
            json!({
                "id": student,
                "name": name,
                "email": format!("{}@school.example", student.to_lowercase()),
                "yearLevel": 2,
                "sectionId": section
            }),
        );
    }

    let session_a = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "sessions.create",
        json!({ "sectionId": section_a }),
    );
    let session_a = str_field(&session_a, "sessionId");
    let session_b = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sessions.create",
        json!({ "sectionId": section_b }),
    );
    let session_b = str_field(&session_b, "sessionId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.checkIn",
        json!({ "sessionId": session_a, "studentId": "S1" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.mark",
        json!({ "sessionId": session_a, "studentId": "S2", "status": "absent" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.mark",
        json!({ "sessionId": session_b, "studentId": "S3", "status": "late" }),
    );

    let section_csv = workspace.join("exports").join("2a.csv");
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.exportCsv",
        json!({ "outPath": section_csv.to_string_lossy(), "sectionId": section_a }),
    );
    assert_eq!(exported["rowsExported"].as_u64(), Some(2));
    let text = std::fs::read_to_string(&section_csv).expect("read section csv");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], CSV_HEADER);
    assert!(
        lines
            .iter()
            .any(|l| l.ends_with(",S1,\"Santos, Mia\",2A,IT101,present,qr")),
        "{}",
        text
    );
    assert!(
        lines
            .iter()
            .any(|l| l.ends_with(",S2,Ben Cruz,2A,IT101,absent,manual")),
        "{}",
        text
    );
    assert!(!text.contains("Lia Tan"));

    let all_csv = workspace.join("exports").join("all.csv");
    let all = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.exportCsv",
        json!({ "outPath": all_csv.to_string_lossy() }),
    );
    assert_eq!(all["rowsExported"].as_u64(), Some(3));
    assert_eq!(all["date"], exported["date"]);
    let text = std::fs::read_to_string(&all_csv).expect("read full csv");
    assert!(text.contains(",S3,Lia Tan,2B,IT101,late,manual"), "{}", text);

    let empty_csv = workspace.join("exports").join("empty.csv");
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "attendance.exportCsv",
        json!({ "outPath": empty_csv.to_string_lossy(), "date": "2001-01-01" }),
    );
    assert_eq!(empty["rowsExported"].as_u64(), Some(0));
    assert_eq!(empty["date"].as_str(), Some("2001-01-01"));
    assert_eq!(
        std::fs::read_to_string(&empty_csv).expect("read empty csv"),
        format!("{}\n", CSV_HEADER)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

fn local_today(offset_minutes: i64) -> NaiveDate {
    (Utc::now() + Duration::minutes(offset_minutes)).date_naive()
}

fn window_start(date: NaiveDate, offset_minutes: i64) -> String {
    let midnight = date.and_hms_opt(0, 0, 0).expect("midnight");
    (midnight - Duration::minutes(offset_minutes))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

#[test]
fn utc_offset_moves_session_date_and_record_window() {
    let workspace = temp_dir("attendd-utc-offset");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "sections.create",
        json!({ "name": "1A", "program": "BSED", "yearLevel": 1 }),
    );
    let section_id = str_field(&section, "sectionId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "id": "T1", "name": "Tala Ramos", "email": "tala@school.example", "yearLevel": 1, "sectionId": section_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "attendance", "patch": { "utcOffsetMinutes": 840 } }),
    );

    let expected = local_today(840);
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sessions.create",
        json!({ "sectionId": section_id }),
    );
    let session_id = str_field(&created, "sessionId");
    let session_date = created["session"]["date"].as_str().unwrap_or_default().to_string();
    assert_eq!(session_date, expected.format("%Y-%m-%d").to_string());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.mark",
        json!({ "sessionId": session_id, "studentId": "T1", "status": "present" }),
    );

    let today = request_ok(&mut stdin, &mut reader, "7", "attendance.records", json!({}));
    assert_eq!(today["date"].as_str(), Some(session_date.as_str()));
    assert_eq!(
        today["from"].as_str().map(str::to_string),
        Some(window_start(expected, 840))
    );
    assert!(today["from"].as_str().is_some_and(|s| s.ends_with("T10:00:00Z")));
    assert_eq!(today["records"].as_array().map(|a| a.len()), Some(1));

    let next_day = (expected + Duration::days(1)).format("%Y-%m-%d").to_string();
    let tomorrow = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.records",
        json!({ "date": next_day }),
    );
    assert_eq!(tomorrow["records"].as_array().map(|a| a.len()), Some(0));

    // The same record lands on the local day west of UTC too.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "setup.update",
        json!({ "section": "attendance", "patch": { "utcOffsetMinutes": -720 } }),
    );
    let west = local_today(-720);
    let today = request_ok(&mut stdin, &mut reader, "10", "attendance.records", json!({}));
    assert_eq!(
        today["date"].as_str().map(str::to_string),
        Some(west.format("%Y-%m-%d").to_string())
    );
    assert!(today["from"].as_str().is_some_and(|s| s.ends_with("T12:00:00Z")));
    assert_eq!(today["records"].as_array().map(|a| a.len()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}
