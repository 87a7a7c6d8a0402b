use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, now_ts, read_text_input, require_db, respond,
    write_text_file, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{
    csv_quote, parse_roster_rows, plan_import, CourseRef, ImportPlan, RowOutcome, SectionRef,
};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashSet;

const PREVIEW_ROW_LIMIT: usize = 250;

fn load_section_refs(conn: &Connection) -> Result<Vec<SectionRef>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, program, year_level, course_id FROM sections")
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(SectionRef {
                id: r.get(0)?,
                name: r.get(1)?,
                program: r.get(2)?,
                year_level: r.get(3)?,
                course_id: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(rows)
}

fn load_course_refs(conn: &Connection) -> Result<Vec<CourseRef>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, code FROM courses")
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(CourseRef {
                id: r.get(0)?,
                code: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(rows)
}

fn load_student_ids(conn: &Connection) -> Result<HashSet<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM students")
        .map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(ids)
}

struct PreparedImport {
    path: Option<String>,
    rows_total: usize,
    plan: ImportPlan,
}

fn prepare_import(conn: &Connection, req: &Request) -> Result<PreparedImport, HandlerErr> {
    let (text, path) = read_text_input(&req.params)?;
    let (rows, rows_total) = parse_roster_rows(&text)?;
    let opts = setup::import_options(conn)?;
    let plan = plan_import(
        &rows,
        &load_section_refs(conn)?,
        &load_course_refs(conn)?,
        &load_student_ids(conn)?,
        opts,
    );
    Ok(PreparedImport {
        path,
        rows_total,
        plan,
    })
}

/// Rows that were skipped, or imported with a caveat.
fn warnings(plan: &ImportPlan) -> Vec<Value> {
    plan.rows
        .iter()
        .filter_map(|r| {
            r.message.as_ref().map(|m| {
                json!({
                    "line": r.line_no,
                    "code": r.outcome.as_str(),
                    "message": m
                })
            })
        })
        .collect()
}

fn counts(plan: &ImportPlan) -> Value {
    json!({
        "new": plan.count(RowOutcome::New),
        "duplicateExisting": plan.count(RowOutcome::DuplicateExisting),
        "duplicateInFile": plan.count(RowOutcome::DuplicateInFile),
        "invalid": plan.count(RowOutcome::Invalid),
        "unknownSection": plan.count(RowOutcome::UnknownSection)
    })
}

fn import_preview(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let prepared = prepare_import(conn, req)?;
    let plan = &prepared.plan;
    let preview_rows: Vec<Value> = plan
        .rows
        .iter()
        .take(PREVIEW_ROW_LIMIT)
        .map(|r| {
            json!({
                "line": r.line_no,
                "id": r.id,
                "name": r.name,
                "email": r.email,
                "yearLevel": r.year_level,
                "sectionId": r.section_id,
                "courseId": r.course_id,
                "status": r.outcome.as_str(),
                "message": r.message
            })
        })
        .collect();
    let warnings = warnings(plan);
    Ok(json!({
        "ok": true,
        "path": prepared.path,
        "rowsTotal": prepared.rows_total,
        "rowsParsed": plan.rows.len(),
        "counts": counts(plan),
        "warningsCount": warnings.len(),
        "warnings": warnings,
        "previewRows": preview_rows
    }))
}

fn import_apply(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let prepared = prepare_import(conn, req)?;
    let plan = &prepared.plan;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let now = now_ts();
    let mut created = 0usize;
    for student in plan.to_create() {
        // Dropping `tx` on the error path rolls back.
        tx.execute(
            "INSERT INTO students(id, name, email, year_level, section_id, course_id, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &student.id,
                &student.name,
                &student.email,
                student.year_level,
                &student.section_id,
                &student.course_id,
                &now,
                &now,
            ),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e)
                .with_details(json!({ "table": "students", "line": student.line_no }))
        })?;
        created += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    let warnings = warnings(plan);
    let skipped = plan.rows.len() - created;
    tracing::info!(created, skipped, path = ?prepared.path, "roster import applied");
    Ok(json!({
        "ok": true,
        "path": prepared.path,
        "rowsTotal": prepared.rows_total,
        "created": created,
        "skipped": skipped,
        "counts": counts(plan),
        "warningsCount": warnings.len(),
        "warnings": warnings
    }))
}

fn export_csv(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let out_path = get_required_str(&req.params, "outPath")?;
    let section_id = get_optional_str(&req.params, "sectionId")?;

    let mut stmt = conn
        .prepare(
            "SELECT st.id, st.name, st.email, st.year_level, s.name, c.code
             FROM students st
             LEFT JOIN sections s ON s.id = st.section_id
             LEFT JOIN courses c ON c.id = st.course_id
             WHERE (?1 IS NULL OR st.section_id = ?1)
             ORDER BY st.name COLLATE NOCASE, st.id",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([&section_id], |r| {
            Ok([
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?.to_string(),
                r.get::<_, Option<String>>(4)?.unwrap_or_default(),
                r.get::<_, Option<String>>(5)?.unwrap_or_default(),
            ])
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut out = String::from("id,name,email,year_level,section,course\n");
    for fields in &rows {
        let line: Vec<String> = fields.iter().map(|f| csv_quote(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    write_text_file(&out_path, &out)?;
    Ok(json!({ "ok": true, "path": out_path, "rowsExported": rows.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.importPreview" => import_preview(state, req),
        "students.importApply" => import_apply(state, req),
        "students.exportCsv" => export_csv(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
