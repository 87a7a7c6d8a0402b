use crate::ipc::helpers::{
    count, get_optional_i64, get_optional_str, get_patch, get_required_str, now_ts, require_db,
    respond, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{MAX_YEAR_LEVEL, MIN_YEAR_LEVEL};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SectionRecord {
    id: String,
    name: String,
    program: String,
    year_level: i64,
    course_id: Option<String>,
    created_at: String,
}

impl SectionRecord {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            program: r.get(2)?,
            year_level: r.get(3)?,
            course_id: r.get(4)?,
            created_at: r.get(5)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "program": self.program,
            "yearLevel": self.year_level,
            "courseId": self.course_id,
            "createdAt": self.created_at
        })
    }
}

fn load_section(conn: &Connection, section_id: &str) -> Result<SectionRecord, HandlerErr> {
    conn.query_row(
        "SELECT id, name, program, year_level, course_id, created_at FROM sections WHERE id = ?",
        [section_id],
        SectionRecord::from_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("section"))
}

fn apply_fields(conn: &Connection, fields: &Value, rec: &mut SectionRecord) -> Result<(), HandlerErr> {
    if fields.get("name").is_some() {
        rec.name = get_optional_str(fields, "name")?.unwrap_or_default();
    }
    if fields.get("program").is_some() {
        rec.program = get_optional_str(fields, "program")?.unwrap_or_default();
    }
    if let Some(year) = get_optional_i64(fields, "yearLevel")? {
        if !(MIN_YEAR_LEVEL..=MAX_YEAR_LEVEL).contains(&year) {
            return Err(HandlerErr::bad_params(format!(
                "yearLevel must be in {}..={}",
                MIN_YEAR_LEVEL, MAX_YEAR_LEVEL
            )));
        }
        rec.year_level = year;
    }
    if fields.get("courseId").is_some() {
        rec.course_id = get_optional_str(fields, "courseId")?;
    }
    if rec.name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    if rec.program.is_empty() {
        return Err(HandlerErr::bad_params("program must not be empty"));
    }
    if let Some(course_id) = rec.course_id.as_deref() {
        if !row_exists(conn, "courses", course_id)? {
            return Err(HandlerErr::not_found("course"));
        }
    }
    Ok(())
}

fn sections_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let course_filter = get_optional_str(&req.params, "courseId")?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.program, s.year_level, s.course_id, s.created_at,
               c.code, c.title,
               (SELECT COUNT(*) FROM students st WHERE st.section_id = s.id)
             FROM sections s
             LEFT JOIN courses c ON c.id = s.course_id
             WHERE (?1 IS NULL OR s.course_id = ?1)
             ORDER BY s.program COLLATE NOCASE, s.year_level, s.name COLLATE NOCASE",
        )
        .map_err(HandlerErr::query)?;
    let sections = stmt
        .query_map([&course_filter], |r| {
            let mut v = SectionRecord::from_row(r)?.to_json();
            v["courseCode"] = json!(r.get::<_, Option<String>>(6)?);
            v["courseTitle"] = json!(r.get::<_, Option<String>>(7)?);
            v["studentCount"] = json!(r.get::<_, i64>(8)?);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "sections": sections }))
}

fn sections_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let section_id = get_required_str(&req.params, "sectionId")?;
    Ok(json!({ "section": load_section(conn, &section_id)?.to_json() }))
}

fn sections_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut rec = SectionRecord {
        id: Uuid::new_v4().to_string(),
        name: String::new(),
        program: String::new(),
        year_level: MIN_YEAR_LEVEL,
        course_id: None,
        created_at: now_ts(),
    };
    apply_fields(conn, &req.params, &mut rec)?;
    conn.execute(
        "INSERT INTO sections(id, name, program, year_level, course_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &rec.id,
            &rec.name,
            &rec.program,
            rec.year_level,
            &rec.course_id,
            &rec.created_at,
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "sections" }))
    })?;
    Ok(json!({ "sectionId": rec.id, "section": rec.to_json() }))
}

fn sections_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let section_id = get_required_str(&req.params, "sectionId")?;
    let patch = get_patch(&req.params)?;
    let mut rec = load_section(conn, &section_id)?;
    apply_fields(conn, patch, &mut rec)?;
    conn.execute(
        "UPDATE sections SET name = ?, program = ?, year_level = ?, course_id = ? WHERE id = ?",
        (
            &rec.name,
            &rec.program,
            rec.year_level,
            &rec.course_id,
            &rec.id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true, "section": rec.to_json() }))
}

fn sections_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let section_id = get_required_str(&req.params, "sectionId")?;
    load_section(conn, &section_id)?;

    let students = count(conn, "SELECT COUNT(*) FROM students WHERE section_id = ?", &section_id)?;
    let schedules = count(
        conn,
        "SELECT COUNT(*) FROM course_schedules WHERE section_id = ?",
        &section_id,
    )?;
    let sessions = count(
        conn,
        "SELECT COUNT(*) FROM attendance_sessions WHERE section_id = ?",
        &section_id,
    )?;
    if students + schedules + sessions > 0 {
        return Err(HandlerErr::new("in_use", "section is still referenced").with_details(json!({
            "students": students,
            "schedules": schedules,
            "sessions": sessions
        })));
    }

    conn.execute("DELETE FROM sections WHERE id = ?", [&section_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "sections.list" => sections_list(state, req),
        "sections.get" => sections_get(state, req),
        "sections.create" => sections_create(state, req),
        "sections.update" => sections_update(state, req),
        "sections.delete" => sections_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
