use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    count, get_optional_i64, get_optional_str, get_patch, get_required_str, now_ts, require_db,
    respond, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{is_valid_email, MAX_YEAR_LEVEL, MIN_YEAR_LEVEL};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

const SEARCH_LIMIT: usize = 50;

#[derive(Debug, Clone)]
struct StudentRecord {
    id: String,
    name: String,
    email: String,
    year_level: i64,
    section_id: Option<String>,
    course_id: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

impl StudentRecord {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            email: r.get(2)?,
            year_level: r.get(3)?,
            section_id: r.get(4)?,
            course_id: r.get(5)?,
            created_at: r.get(6)?,
            updated_at: r.get(7)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "email": self.email,
            "yearLevel": self.year_level,
            "sectionId": self.section_id,
            "courseId": self.course_id,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at
        })
    }
}

fn load_student(conn: &Connection, student_id: &str) -> Result<StudentRecord, HandlerErr> {
    conn.query_row(
        "SELECT id, name, email, year_level, section_id, course_id, created_at, updated_at
         FROM students WHERE id = ?",
        [student_id],
        StudentRecord::from_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("student"))
}

fn attendance_count(conn: &Connection, student_id: &str) -> Result<i64, HandlerErr> {
    count(
        conn,
        "SELECT COUNT(*) FROM attendance_records WHERE student_id = ?",
        student_id,
    )
}

/// Case-insensitive substring match. SQLite `LIKE` only folds ASCII, so
/// names such as "PEÑA" are matched here instead.
fn contains_folded(haystack: &str, needle_folded: &str) -> bool {
    haystack.to_lowercase().contains(needle_folded)
}

/// Only keys present in `fields` are touched. The email is checked on create
/// and whenever it is edited; rows imported without one stay editable.
fn apply_fields(
    conn: &Connection,
    fields: &Value,
    rec: &mut StudentRecord,
    creating: bool,
) -> Result<(), HandlerErr> {
    if fields.get("name").is_some() {
        rec.name = get_optional_str(fields, "name")?.unwrap_or_default();
    }
    if fields.get("email").is_some() {
        rec.email = get_optional_str(fields, "email")?.unwrap_or_default();
    }
    if fields.get("yearLevel").is_some() {
        rec.year_level = get_optional_i64(fields, "yearLevel")?.unwrap_or(0);
    }
    if fields.get("sectionId").is_some() {
        rec.section_id = get_optional_str(fields, "sectionId")?;
    }
    if fields.get("courseId").is_some() {
        rec.course_id = get_optional_str(fields, "courseId")?;
    }

    if rec.name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    if (creating || fields.get("email").is_some()) && !is_valid_email(&rec.email) {
        return Err(HandlerErr::bad_params("email must look like local@domain"));
    }
    if !(MIN_YEAR_LEVEL..=MAX_YEAR_LEVEL).contains(&rec.year_level) {
        return Err(HandlerErr::bad_params(format!(
            "yearLevel must be in {}..={}",
            MIN_YEAR_LEVEL, MAX_YEAR_LEVEL
        )));
    }
    if let Some(section_id) = rec.section_id.as_deref() {
        if !row_exists(conn, "sections", section_id)? {
            return Err(HandlerErr::not_found("section"));
        }
    }
    if let Some(course_id) = rec.course_id.as_deref() {
        if !row_exists(conn, "courses", course_id)? {
            return Err(HandlerErr::not_found("course"));
        }
    }
    Ok(())
}

fn students_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let section_id = get_optional_str(&req.params, "sectionId")?;
    let course_id = get_optional_str(&req.params, "courseId")?;
    let year_level = get_optional_i64(&req.params, "yearLevel")?;
    let search = get_optional_str(&req.params, "search")?.map(|q| q.to_lowercase());

    let mut stmt = conn
        .prepare(
            "SELECT st.id, st.name, st.email, st.year_level, st.section_id, st.course_id,
                    st.created_at, st.updated_at,
                    s.name, s.program, c.code, c.title
             FROM students st
             LEFT JOIN sections s ON s.id = st.section_id
             LEFT JOIN courses c ON c.id = st.course_id
             WHERE (?1 IS NULL OR st.section_id = ?1)
               AND (?2 IS NULL OR st.course_id = ?2)
               AND (?3 IS NULL OR st.year_level = ?3)
             ORDER BY st.name COLLATE NOCASE, st.id",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map((&section_id, &course_id, year_level), |r| {
            let rec = StudentRecord::from_row(r)?;
            let mut v = rec.to_json();
            v["sectionName"] = json!(r.get::<_, Option<String>>(8)?);
            v["program"] = json!(r.get::<_, Option<String>>(9)?);
            v["courseCode"] = json!(r.get::<_, Option<String>>(10)?);
            v["courseTitle"] = json!(r.get::<_, Option<String>>(11)?);
            Ok((rec, v))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let students: Vec<Value> = rows
        .into_iter()
        .filter(|(rec, _)| match search.as_deref() {
            Some(q) => contains_folded(&rec.name, q) || contains_folded(&rec.id, q),
            None => true,
        })
        .map(|(_, v)| v)
        .collect();
    Ok(json!({ "students": students }))
}

fn students_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let student = load_student(conn, &student_id)?;
    let records = attendance_count(conn, &student_id)?;
    let mut v = student.to_json();
    v["attendanceRecords"] = json!(records);
    Ok(json!({ "student": v }))
}

fn students_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = match get_optional_str(&req.params, "id")? {
        Some(id) => {
            if row_exists(conn, "students", &id)? {
                return Err(HandlerErr::new("duplicate", "student id already exists")
                    .with_details(json!({ "field": "id", "studentId": id })));
            }
            id
        }
        None => Uuid::new_v4().to_string(),
    };
    let now = now_ts();
    let mut rec = StudentRecord {
        id,
        name: String::new(),
        email: String::new(),
        year_level: 0,
        section_id: None,
        course_id: None,
        created_at: now.clone(),
        updated_at: Some(now),
    };
    apply_fields(conn, &req.params, &mut rec, true)?;

    // A student placed in a section inherits that section's course.
    if rec.course_id.is_none() {
        if let Some(section_id) = rec.section_id.as_deref() {
            rec.course_id = conn
                .query_row(
                    "SELECT course_id FROM sections WHERE id = ?",
                    [section_id],
                    |r| r.get(0),
                )
                .map_err(HandlerErr::query)?;
        }
    }

    conn.execute(
        "INSERT INTO students(id, name, email, year_level, section_id, course_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &rec.id,
            &rec.name,
            &rec.email,
            rec.year_level,
            &rec.section_id,
            &rec.course_id,
            &rec.created_at,
            &rec.updated_at,
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" }))
    })?;
    Ok(json!({ "studentId": rec.id, "student": rec.to_json() }))
}

fn students_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let patch = get_patch(&req.params)?;
    let before = load_student(conn, &student_id)?;
    let mut rec = before.clone();
    apply_fields(conn, patch, &mut rec, false)?;

    if rec.section_id != before.section_id || rec.course_id != before.course_id {
        let records = attendance_count(conn, &student_id)?;
        if records > 0 {
            return Err(HandlerErr::new(
                "has_attendance",
                "student has attendance records; section and course cannot change",
            )
            .with_details(json!({ "records": records })));
        }
    }

    rec.updated_at = Some(now_ts());
    conn.execute(
        "UPDATE students
         SET name = ?, email = ?, year_level = ?, section_id = ?, course_id = ?, updated_at = ?
         WHERE id = ?",
        (
            &rec.name,
            &rec.email,
            rec.year_level,
            &rec.section_id,
            &rec.course_id,
            &rec.updated_at,
            &rec.id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true, "student": rec.to_json() }))
}

fn students_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    load_student(conn, &student_id)?;
    let records = attendance_count(conn, &student_id)?;
    if records > 0 {
        return Err(
            HandlerErr::new("has_attendance", "student has attendance records")
                .with_details(json!({ "records": records })),
        );
    }
    conn.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    Ok(json!({ "ok": true }))
}

/// Name lookup behind the check-in page.
fn students_search(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let section_id = get_required_str(&req.params, "sectionId")?;
    let course_id = get_optional_str(&req.params, "courseId")?;
    let query = get_optional_str(&req.params, "query")?.unwrap_or_default();

    let settings = setup::attendance_settings(conn)?;
    if query.chars().count() < settings.min_search_chars {
        return Ok(json!({ "students": [] }));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name, year_level
             FROM students
             WHERE section_id = ?1
               AND (?2 IS NULL OR course_id = ?2)
             ORDER BY name COLLATE NOCASE, id",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map((&section_id, &course_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let folded = query.to_lowercase();
    let students: Vec<Value> = rows
        .into_iter()
        .filter(|(_, name, _)| contains_folded(name, &folded))
        .take(SEARCH_LIMIT)
        .map(|(id, name, year_level)| {
            json!({
                "id": id,
                "name": name,
                "yearLevel": year_level
            })
        })
        .collect();
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, req),
        "students.get" => students_get(state, req),
        "students.create" => students_create(state, req),
        "students.update" => students_update(state, req),
        "students.delete" => students_delete(state, req),
        "students.search" => students_search(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::contains_folded;

    #[test]
    fn folded_match_handles_non_ascii_names() {
        assert!(contains_folded("ÑOÑO PEÑA", "peña"));
        assert!(contains_folded("Ana Reyes", "rey"));
        assert!(contains_folded("50%_off", "%_"));
        assert!(!contains_folded("Ana Reyes", "cruz"));
    }
}
