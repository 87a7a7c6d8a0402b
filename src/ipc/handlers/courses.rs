use crate::ipc::helpers::{
    count, get_optional_i64, get_optional_str, get_patch, get_required_str, now_ts, require_db,
    respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct CourseRecord {
    id: String,
    code: String,
    title: String,
    description: Option<String>,
    units: i64,
    lecture_hours: i64,
    lab_hours: i64,
    instructor_id: Option<String>,
    created_at: String,
}

const COURSE_COLUMNS: &str =
    "id, code, title, description, units, lecture_hours, lab_hours, instructor_id, created_at";

impl CourseRecord {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            code: r.get(1)?,
            title: r.get(2)?,
            description: r.get(3)?,
            units: r.get(4)?,
            lecture_hours: r.get(5)?,
            lab_hours: r.get(6)?,
            instructor_id: r.get(7)?,
            created_at: r.get(8)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "code": self.code,
            "title": self.title,
            "description": self.description,
            "units": self.units,
            "lectureHours": self.lecture_hours,
            "labHours": self.lab_hours,
            "instructorId": self.instructor_id,
            "createdAt": self.created_at
        })
    }
}

fn load_course(conn: &Connection, course_id: &str) -> Result<CourseRecord, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM courses WHERE id = ?", COURSE_COLUMNS),
        [course_id],
        CourseRecord::from_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("course"))
}

fn non_negative(fields: &Value, key: &str) -> Result<i64, HandlerErr> {
    let n = get_optional_i64(fields, key)?.unwrap_or(0);
    if n < 0 {
        return Err(HandlerErr::bad_params(format!("{} must be >= 0", key)));
    }
    Ok(n)
}

/// Only keys present in `fields` are touched.
fn apply_fields(fields: &Value, rec: &mut CourseRecord) -> Result<(), HandlerErr> {
    if fields.get("code").is_some() {
        rec.code = get_optional_str(fields, "code")?.unwrap_or_default();
    }
    if fields.get("title").is_some() {
        rec.title = get_optional_str(fields, "title")?.unwrap_or_default();
    }
    if fields.get("description").is_some() {
        rec.description = get_optional_str(fields, "description")?;
    }
    if fields.get("units").is_some() {
        rec.units = non_negative(fields, "units")?;
    }
    if fields.get("lectureHours").is_some() {
        rec.lecture_hours = non_negative(fields, "lectureHours")?;
    }
    if fields.get("labHours").is_some() {
        rec.lab_hours = non_negative(fields, "labHours")?;
    }
    if fields.get("instructorId").is_some() {
        rec.instructor_id = get_optional_str(fields, "instructorId")?;
    }
    if rec.code.is_empty() {
        return Err(HandlerErr::bad_params("code must not be empty"));
    }
    if rec.title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    Ok(())
}

fn ensure_code_free(conn: &Connection, rec: &CourseRecord) -> Result<(), HandlerErr> {
    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM courses WHERE code = ? COLLATE NOCASE AND id <> ?",
            (&rec.code, &rec.id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    match taken {
        Some(other) => Err(HandlerErr::new("duplicate", "course code already exists")
            .with_details(json!({ "field": "code", "courseId": other }))),
        None => Ok(()),
    }
}

fn courses_list(state: &AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {},
               (SELECT COUNT(*) FROM sections s WHERE s.course_id = c.id),
               (SELECT COUNT(*) FROM students st WHERE st.course_id = c.id)
             FROM courses c
             ORDER BY c.code COLLATE NOCASE",
            COURSE_COLUMNS
                .split(", ")
                .map(|col| format!("c.{}", col))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .map_err(HandlerErr::query)?;
    let courses = stmt
        .query_map([], |r| {
            let mut v = CourseRecord::from_row(r)?.to_json();
            v["sectionCount"] = json!(r.get::<_, i64>(9)?);
            v["studentCount"] = json!(r.get::<_, i64>(10)?);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "courses": courses }))
}

fn courses_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    let course = load_course(conn, &course_id)?;
    Ok(json!({ "course": course.to_json() }))
}

fn courses_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut rec = CourseRecord {
        id: Uuid::new_v4().to_string(),
        code: String::new(),
        title: String::new(),
        description: None,
        units: 0,
        lecture_hours: 0,
        lab_hours: 0,
        instructor_id: None,
        created_at: now_ts(),
    };
    apply_fields(&req.params, &mut rec)?;
    ensure_code_free(conn, &rec)?;
    conn.execute(
        "INSERT INTO courses(id, code, title, description, units, lecture_hours, lab_hours, instructor_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &rec.id,
            &rec.code,
            &rec.title,
            &rec.description,
            rec.units,
            rec.lecture_hours,
            rec.lab_hours,
            &rec.instructor_id,
            &rec.created_at,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "courses" })))?;
    Ok(json!({ "courseId": rec.id, "course": rec.to_json() }))
}

fn courses_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    let patch = get_patch(&req.params)?;
    let mut rec = load_course(conn, &course_id)?;
    apply_fields(patch, &mut rec)?;
    ensure_code_free(conn, &rec)?;
    conn.execute(
        "UPDATE courses
         SET code = ?, title = ?, description = ?, units = ?, lecture_hours = ?, lab_hours = ?, instructor_id = ?
         WHERE id = ?",
        (
            &rec.code,
            &rec.title,
            &rec.description,
            rec.units,
            rec.lecture_hours,
            rec.lab_hours,
            &rec.instructor_id,
            &rec.id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true, "course": rec.to_json() }))
}

fn courses_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let course_id = get_required_str(&req.params, "courseId")?;
    load_course(conn, &course_id)?;

    let sections = count(conn, "SELECT COUNT(*) FROM sections WHERE course_id = ?", &course_id)?;
    let students = count(conn, "SELECT COUNT(*) FROM students WHERE course_id = ?", &course_id)?;
    let schedules = count(
        conn,
        "SELECT COUNT(*) FROM course_schedules WHERE course_id = ?",
        &course_id,
    )?;
    let sessions = count(
        conn,
        "SELECT COUNT(*) FROM attendance_sessions WHERE course_id = ?",
        &course_id,
    )?;
    if sections + students + schedules + sessions > 0 {
        return Err(HandlerErr::new("in_use", "course is still referenced").with_details(json!({
            "sections": sections,
            "students": students,
            "schedules": schedules,
            "sessions": sessions
        })));
    }

    conn.execute("DELETE FROM courses WHERE id = ?", [&course_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "courses.list" => courses_list(state, req),
        "courses.get" => courses_get(state, req),
        "courses.create" => courses_create(state, req),
        "courses.update" => courses_update(state, req),
        "courses.delete" => courses_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
