use crate::ipc::handlers::sessions::{self, SessionRecord, ENROLLED_SQL};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    get_optional_f64, get_optional_str, get_required_str, now_utc, require_db, respond,
    write_text_file, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::csv_quote;
use crate::session::{
    classify_check_in, day_window_utc, format_ts, local_date, parse_date, AttendanceStatus,
    VerificationMethod,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

struct EnrolledStudent {
    id: String,
    name: String,
}

/// The student must exist and be enrolled in the session's section.
fn require_enrolled(
    conn: &Connection,
    session: &SessionRecord,
    student_id: &str,
) -> Result<EnrolledStudent, HandlerErr> {
    let name: String = conn
        .query_row("SELECT name FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("student"))?;
    let enrolled = conn
        .query_row(
            &format!("SELECT 1 FROM students st WHERE {} AND st.id = ?3", ENROLLED_SQL),
            (&session.section_id, &session.course_id, student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .is_some();
    if !enrolled {
        return Err(
            HandlerErr::new("not_enrolled", "student is not enrolled in this section")
                .with_details(json!({
                    "studentId": student_id,
                    "sectionId": session.section_id
                })),
        );
    }
    Ok(EnrolledStudent {
        id: student_id.to_string(),
        name,
    })
}

struct ExistingRecord {
    id: String,
    status: String,
    timestamp: String,
}

fn find_record(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
) -> Result<Option<ExistingRecord>, HandlerErr> {
    conn.query_row(
        "SELECT id, status, timestamp FROM attendance_records WHERE session_id = ? AND student_id = ?",
        (session_id, student_id),
        |r| {
            Ok(ExistingRecord {
                id: r.get(0)?,
                status: r.get(1)?,
                timestamp: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn already_checked_in(rec: &ExistingRecord) -> HandlerErr {
    HandlerErr::new("already_checked_in", "attendance already recorded for this session")
        .with_details(json!({
            "recordId": rec.id,
            "status": rec.status,
            "timestamp": rec.timestamp
        }))
}

fn coordinate(params: &Value, key: &str, limit: f64) -> Result<Option<f64>, HandlerErr> {
    match get_optional_f64(params, key)? {
        Some(v) if !(-limit..=limit).contains(&v) => Err(HandlerErr::bad_params(format!(
            "{} must be in -{}..={}",
            key, limit, limit
        ))),
        other => Ok(other),
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn check_in(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let session_id = get_required_str(&req.params, "sessionId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let section_name = get_optional_str(&req.params, "sectionName")?;
    let latitude = coordinate(&req.params, "latitude", 90.0)?;
    let longitude = coordinate(&req.params, "longitude", 180.0)?;
    let user_agent = get_optional_str(&req.params, "deviceUserAgent")?;
    let device_ip = get_optional_str(&req.params, "deviceIp")?;

    let now = now_utc();
    let session = sessions::require_open_session(conn, &session_id, section_name.as_deref(), now)
        .map_err(|e| {
            tracing::warn!(session_id = %session_id, code = e.code, "check-in rejected");
            e
        })?;
    let student = require_enrolled(conn, &session, &student_id).map_err(|e| {
        tracing::warn!(session_id = %session_id, student_id = %student_id, code = e.code, "check-in rejected");
        e
    })?;
    if let Some(existing) = find_record(conn, &session.id, &student.id)? {
        tracing::warn!(session_id = %session_id, student_id = %student_id, "duplicate check-in");
        return Err(already_checked_in(&existing));
    }

    let late_after = setup::attendance_settings(conn)?.late_after_minutes;
    let status = classify_check_in(session.created()?, now, late_after);
    let record_id = Uuid::new_v4().to_string();
    let timestamp = format_ts(now);
    let inserted = conn.execute(
        "INSERT INTO attendance_records(
           id, session_id, student_id, status, verification_method, timestamp,
           latitude, longitude, device_user_agent, device_ip_address
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &record_id,
            &session.id,
            &student.id,
            status.as_str(),
            VerificationMethod::Qr.as_str(),
            &timestamp,
            latitude,
            longitude,
            &user_agent,
            &device_ip,
        ),
    );
    if let Err(e) = inserted {
        // A concurrent scan can win between the lookup and the insert.
        if is_unique_violation(&e) {
            if let Some(existing) = find_record(conn, &session.id, &student.id)? {
                return Err(already_checked_in(&existing));
            }
        }
        tracing::warn!(session_id = %session_id, "check-in insert failed: {e}");
        return Err(
            HandlerErr::db("db_insert_failed", e)
                .with_details(json!({ "table": "attendance_records" })),
        );
    }

    tracing::info!(
        session_id = %session.id,
        student_id = %student.id,
        status = status.as_str(),
        "student checked in"
    );
    Ok(json!({
        "recordId": record_id,
        "status": status.as_str(),
        "timestamp": timestamp,
        "studentName": student.name,
        "sessionId": session.id
    }))
}

/// Instructor override. Works on expired sessions too.
fn mark(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let session_id = get_required_str(&req.params, "sessionId")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let status = AttendanceStatus::parse(&get_required_str(&req.params, "status")?)?;

    let session = sessions::load_session(conn, &session_id)?;
    let student = require_enrolled(conn, &session, &student_id)?;
    let existing = find_record(conn, &session.id, &student.id)?;

    let record_id = match &existing {
        Some(rec) => {
            conn.execute(
                "UPDATE attendance_records SET status = ?, verification_method = ? WHERE id = ?",
                (status.as_str(), VerificationMethod::Manual.as_str(), &rec.id),
            )
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
            rec.id.clone()
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO attendance_records(id, session_id, student_id, status, verification_method, timestamp)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    &session.id,
                    &student.id,
                    status.as_str(),
                    VerificationMethod::Manual.as_str(),
                    format_ts(now_utc()),
                ),
            )
            .map_err(|e| {
                HandlerErr::db("db_insert_failed", e)
                    .with_details(json!({ "table": "attendance_records" }))
            })?;
            id
        }
    };
    tracing::info!(
        session_id = %session.id,
        student_id = %student.id,
        status = status.as_str(),
        "attendance marked manually"
    );
    Ok(json!({
        "ok": true,
        "recordId": record_id,
        "status": status.as_str(),
        "created": existing.is_none()
    }))
}

struct RecordFilter {
    date: String,
    start: String,
    end: String,
    section_id: Option<String>,
    status: Option<AttendanceStatus>,
}

impl RecordFilter {
    /// `date` defaults to today in the configured offset.
    fn from_params(conn: &Connection, params: &Value) -> Result<Self, HandlerErr> {
        let offset = setup::attendance_settings(conn)?.utc_offset_minutes;
        let date = match get_optional_str(params, "date")? {
            Some(raw) => parse_date(&raw)?,
            None => local_date(now_utc(), offset)?,
        };
        let (start, end) = day_window_utc(date, offset)?;
        Ok(Self {
            date: date.format("%Y-%m-%d").to_string(),
            start: format_ts(start),
            end: format_ts(end),
            section_id: get_optional_str(params, "sectionId")?,
            status: get_optional_str(params, "status")?
                .map(|s| AttendanceStatus::parse(&s))
                .transpose()?,
        })
    }
}

struct RecordRow {
    id: String,
    session_id: String,
    student_id: String,
    student_name: Option<String>,
    section_id: String,
    section_name: Option<String>,
    course_code: Option<String>,
    status: String,
    verification_method: String,
    timestamp: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl RecordRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "sessionId": self.session_id,
            "studentId": self.student_id,
            "studentName": self.student_name,
            "sectionId": self.section_id,
            "sectionName": self.section_name,
            "courseCode": self.course_code,
            "status": self.status,
            "verificationMethod": self.verification_method,
            "timestamp": self.timestamp,
            "latitude": self.latitude,
            "longitude": self.longitude
        })
    }
}

fn query_records(conn: &Connection, filter: &RecordFilter) -> Result<Vec<RecordRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT ar.id, ar.session_id, ar.student_id, st.name, a.section_id, s.name, c.code,
                    ar.status, ar.verification_method, ar.timestamp, ar.latitude, ar.longitude
             FROM attendance_records ar
             JOIN attendance_sessions a ON a.id = ar.session_id
             LEFT JOIN students st ON st.id = ar.student_id
             LEFT JOIN sections s ON s.id = a.section_id
             LEFT JOIN courses c ON c.id = a.course_id
             WHERE ar.timestamp >= ?1 AND ar.timestamp < ?2
               AND (?3 IS NULL OR a.section_id = ?3)
               AND (?4 IS NULL OR ar.status = ?4)
             ORDER BY ar.timestamp, st.name COLLATE NOCASE",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map(
        (
            &filter.start,
            &filter.end,
            &filter.section_id,
            filter.status.map(|s| s.as_str()),
        ),
        |r| {
            Ok(RecordRow {
                id: r.get(0)?,
                session_id: r.get(1)?,
                student_id: r.get(2)?,
                student_name: r.get(3)?,
                section_id: r.get(4)?,
                section_name: r.get(5)?,
                course_code: r.get(6)?,
                status: r.get(7)?,
                verification_method: r.get(8)?,
                timestamp: r.get(9)?,
                latitude: r.get(10)?,
                longitude: r.get(11)?,
            })
        },
    )
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

fn records(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let filter = RecordFilter::from_params(conn, &req.params)?;
    let rows = query_records(conn, &filter)?;

    let mut counts = serde_json::Map::new();
    for status in AttendanceStatus::ALL {
        let n = rows.iter().filter(|r| r.status == status.as_str()).count();
        counts.insert(status.as_str().to_string(), json!(n));
    }
    let records: Vec<Value> = rows.iter().map(RecordRow::to_json).collect();
    Ok(json!({
        "date": filter.date,
        "from": filter.start,
        "to": filter.end,
        "counts": counts,
        "records": records
    }))
}

fn delete_record(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let record_id = get_required_str(&req.params, "recordId")?;
    let changed = conn
        .execute("DELETE FROM attendance_records WHERE id = ?", [&record_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("attendance record"));
    }
    tracing::info!(record_id = %record_id, "attendance record deleted");
    Ok(json!({ "ok": true }))
}

fn export_csv(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let out_path = get_required_str(&req.params, "outPath")?;
    let filter = RecordFilter::from_params(conn, &req.params)?;
    let rows = query_records(conn, &filter)?;

    let mut out =
        String::from("timestamp,student_id,student_name,section,course,status,verification_method\n");
    for r in &rows {
        let fields = [
            r.timestamp.as_str(),
            r.student_id.as_str(),
            r.student_name.as_deref().unwrap_or(""),
            r.section_name.as_deref().unwrap_or(""),
            r.course_code.as_deref().unwrap_or(""),
            r.status.as_str(),
            r.verification_method.as_str(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_quote(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    write_text_file(&out_path, &out)?;
    Ok(json!({
        "ok": true,
        "path": out_path,
        "date": filter.date,
        "rowsExported": rows.len()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.checkIn" => check_in(state, req),
        "attendance.mark" => mark(state, req),
        "attendance.records" => records(state, req),
        "attendance.deleteRecord" => delete_record(state, req),
        "attendance.exportCsv" => export_csv(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
