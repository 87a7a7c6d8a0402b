mod test_support;

use serde_json::json;
use test_support::{request, request_err, request_ok, spawn_sidecar, str_field, temp_dir};

#[test]
fn qr_check_in_flow_and_duplicate_rejection() {
    let workspace = temp_dir("attendd-session-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "attendance", "patch": { "checkInBaseUrl": "https://att.example/" } }),
    );
    assert_eq!(
        setup["attendance"]["checkInBaseUrl"].as_str(),
        Some("https://att.example")
    );

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "code": "IT210", "title": "Web Systems" }),
    );
    let course_id = str_field(&course, "courseId");
    let section_a = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sections.create",
        json!({ "name": "2A", "program": "BSIT", "yearLevel": 2, "courseId": course_id }),
    );
    let section_a = str_field(&section_a, "sectionId");
    let section_b = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sections.create",
        json!({ "name": "2B", "program": "BSIT", "yearLevel": 2, "courseId": course_id }),
    );
    let section_b = str_field(&section_b, "sectionId");
    for (id, student, section) in [
        ("6", "S1", &section_a),
        ("7", "S2", &section_a),
        ("8", "S3", &section_b),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "students.create",
            json!({
                "id": student,
                "name": format!("Student {}", student),
                "email": format!("{}@school.example", student.to_lowercase()),
                "yearLevel": 2,
                "sectionId": section
            }),
        );
    }

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sessions.create",
        json!({ "sectionId": section_a, "ttlMinutes": 30, "instructorId": "inst-7" }),
    );
    let session_id = str_field(&created, "sessionId");
    assert_eq!(
        created["checkInUrl"].as_str().map(str::to_string),
        Some(format!("https://att.example/attendance/2A/{}", session_id))
    );
    assert_eq!(created["session"]["status"].as_str(), Some("active"));
    assert_eq!(created["session"]["courseId"].as_str(), Some(course_id.as_str()));
    let remaining = created["session"]["secondsRemaining"].as_i64().expect("remaining");
    assert!(remaining > 25 * 60 && remaining <= 30 * 60, "{}", remaining);

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "10",
            "sessions.open",
            json!({ "sessionId": session_id, "sectionName": "2B" }),
        ),
        "section_mismatch"
    );
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "sessions.open",
        json!({ "sessionId": session_id, "sectionName": "2a" }),
    );
    assert_eq!(opened["course"]["code"].as_str(), Some("IT210"));
    assert_eq!(opened["section"]["program"].as_str(), Some("BSIT"));
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "12",
            "sessions.open",
            json!({ "sessionId": "missing" }),
        ),
        "not_found"
    );

    let checked = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.checkIn",
        json!({
            "sessionId": session_id,
            "studentId": "S1",
            "sectionName": "2A",
            "latitude": 14.5995,
            "longitude": 120.9842,
            "deviceUserAgent": "test-agent"
        }),
    );
    assert_eq!(checked["status"].as_str(), Some("present"));
    let record_id = str_field(&checked, "recordId");

    let dup = request(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.checkIn",
        json!({ "sessionId": session_id, "studentId": "S1" }),
    );
    assert_eq!(dup["error"]["code"].as_str(), Some("already_checked_in"));
    assert_eq!(
        dup["error"]["details"]["recordId"].as_str(),
        Some(record_id.as_str())
    );

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "15",
            "attendance.checkIn",
            json!({ "sessionId": session_id, "studentId": "S3" }),
        ),
        "not_enrolled"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "16",
            "attendance.checkIn",
            json!({ "sessionId": session_id, "studentId": "S9" }),
        ),
        "not_found"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "17",
            "attendance.checkIn",
            json!({ "sessionId": session_id, "studentId": "S2", "latitude": 123.0 }),
        ),
        "bad_params"
    );

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "sessions.roster",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(roster["students"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(roster["counts"]["present"].as_u64(), Some(1));
    assert_eq!(roster["counts"]["unmarked"].as_u64(), Some(1));

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "attendance.mark",
        json!({ "sessionId": session_id, "studentId": "S2", "status": "Absent" }),
    );
    assert_eq!(marked["created"].as_bool(), Some(true));
    let overridden = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "attendance.mark",
        json!({ "sessionId": session_id, "studentId": "S1", "status": "late" }),
    );
    assert_eq!(overridden["created"].as_bool(), Some(false));
    assert_eq!(overridden["recordId"].as_str(), Some(record_id.as_str()));
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "21",
            "attendance.mark",
            json!({ "sessionId": session_id, "studentId": "S2", "status": "tardy" }),
        ),
        "bad_params"
    );

    let records = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "attendance.records",
        json!({ "sectionId": section_a }),
    );
    assert_eq!(records["records"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(records["counts"]["late"].as_u64(), Some(1));
    assert_eq!(records["counts"]["absent"].as_u64(), Some(1));
    let late_only = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "attendance.records",
        json!({ "status": "late" }),
    );
    assert_eq!(late_only["records"][0]["studentId"].as_str(), Some("S1"));
    assert_eq!(
        late_only["records"][0]["verificationMethod"].as_str(),
        Some("manual")
    );
    let other_day = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "attendance.records",
        json!({ "date": "2001-01-01" }),
    );
    assert_eq!(other_day["records"].as_array().map(|a| a.len()), Some(0));

    let closed = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "sessions.close",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(closed["alreadyExpired"].as_bool(), Some(false));
    assert_eq!(closed["session"]["status"].as_str(), Some("expired"));
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "26",
            "attendance.checkIn",
            json!({ "sessionId": session_id, "studentId": "S2" }),
        ),
        "session_expired"
    );
    let closed_again = request_ok(
        &mut stdin,
        &mut reader,
        "27",
        "sessions.close",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(closed_again["alreadyExpired"].as_bool(), Some(true));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "28",
        "attendance.deleteRecord",
        json!({ "recordId": record_id }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "29",
            "attendance.deleteRecord",
            json!({ "recordId": record_id }),
        ),
        "not_found"
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn past_deadline_sessions_expire_on_access() {
    let workspace = temp_dir("attendd-session-expiry");
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
        json!({ "name": "1C", "program": "BSCS" }),
    );
    let section_id = str_field(&section, "sectionId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "id": "X1", "name": "Dan Lim", "email": "dan@school.example", "yearLevel": 1, "sectionId": section_id }),
    );

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "4",
            "sessions.create",
            json!({ "sectionId": section_id, "ttlMinutes": 10, "expiresAt": "2020-01-01T00:00:00Z" }),
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "5",
            "sessions.create",
            json!({ "sectionId": section_id, "ttlMinutes": 0 }),
        ),
        "bad_params"
    );

    let stale = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "sessions.create",
        json!({ "sectionId": section_id, "expiresAt": "2020-01-01 00:00:00" }),
    );
    let stale_id = str_field(&stale, "sessionId");
    assert_eq!(stale["session"]["expiresAt"].as_str(), Some("2020-01-01T00:00:00Z"));
    assert_eq!(stale["session"]["status"].as_str(), Some("expired"));
    assert_eq!(stale["session"]["secondsRemaining"].as_i64(), Some(0));

    let active = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sessions.list",
        json!({ "status": "active" }),
    );
    // Listing sweeps first, so the stale row is no longer active.
    assert_eq!(active["sessions"].as_array().map(|a| a.len()), Some(0));

    let expired = request(
        &mut stdin,
        &mut reader,
        "8",
        "sessions.open",
        json!({ "sessionId": stale_id }),
    );
    assert_eq!(expired["error"]["code"].as_str(), Some("session_expired"));
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "9",
            "attendance.checkIn",
            json!({ "sessionId": stale_id, "studentId": "X1" }),
        ),
        "session_expired"
    );

    // Instructors can still fix up an expired session.
    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.mark",
        json!({ "sessionId": stale_id, "studentId": "X1", "status": "excused" }),
    );
    assert_eq!(marked["status"].as_str(), Some("excused"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "sessions.list",
        json!({ "sectionId": section_id, "status": "expired" }),
    );
    assert_eq!(listed["sessions"][0]["recordCount"].as_i64(), Some(1));

    let swept = request_ok(&mut stdin, &mut reader, "12", "sessions.expireStale", json!({}));
    assert_eq!(swept["expired"].as_u64(), Some(0));

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "13",
            "sessions.list",
            json!({ "status": "paused" }),
        ),
        "bad_params"
    );

    let _ = std::fs::remove_dir_all(workspace);
}
