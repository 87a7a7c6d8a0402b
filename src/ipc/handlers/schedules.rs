use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_patch, get_required_str, now_ts, require_db, respond,
    row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{
    month_days, parse_month_key, parse_school_year, DayOfWeek, Semester, TimeRange,
};
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ScheduleRecord {
    id: String,
    course_id: String,
    section_id: String,
    room_id: String,
    day_of_week: String,
    start_time: String,
    end_time: String,
    is_lab: bool,
    semester: String,
    school_year: String,
    created_at: String,
}

const SCHEDULE_SELECT: &str = "SELECT cs.id, cs.course_id, cs.section_id, cs.room_id, cs.day_of_week,
        cs.start_time, cs.end_time, cs.is_lab, cs.semester, cs.school_year, cs.created_at,
        c.code, c.title, c.units, r.room_number, s.name
     FROM course_schedules cs
     LEFT JOIN courses c ON c.id = cs.course_id
     LEFT JOIN rooms r ON r.id = cs.room_id
     LEFT JOIN sections s ON s.id = cs.section_id";

impl ScheduleRecord {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            course_id: r.get(1)?,
            section_id: r.get(2)?,
            room_id: r.get(3)?,
            day_of_week: r.get(4)?,
            start_time: r.get(5)?,
            end_time: r.get(6)?,
            is_lab: r.get::<_, i64>(7)? != 0,
            semester: r.get(8)?,
            school_year: r.get(9)?,
            created_at: r.get(10)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "courseId": self.course_id,
            "sectionId": self.section_id,
            "roomId": self.room_id,
            "dayOfWeek": self.day_of_week,
            "startTime": self.start_time,
            "endTime": self.end_time,
            "durationMinutes": TimeRange::parse(&self.start_time, &self.end_time)
                .map(|r| r.duration_minutes())
                .ok(),
            "isLab": self.is_lab,
            "semester": self.semester,
            "schoolYear": self.school_year,
            "createdAt": self.created_at
        })
    }
}

/// A schedule joined with the names a timetable shows.
fn joined_json(r: &Row<'_>) -> rusqlite::Result<(ScheduleRecord, Value)> {
    let rec = ScheduleRecord::from_row(r)?;
    let mut v = rec.to_json();
    v["courseCode"] = json!(r.get::<_, Option<String>>(11)?);
    v["courseTitle"] = json!(r.get::<_, Option<String>>(12)?);
    v["units"] = json!(r.get::<_, Option<i64>>(13)?);
    v["roomNumber"] = json!(r.get::<_, Option<String>>(14)?);
    v["sectionName"] = json!(r.get::<_, Option<String>>(15)?);
    Ok((rec, v))
}

fn load_schedule(conn: &Connection, schedule_id: &str) -> Result<(ScheduleRecord, Value), HandlerErr> {
    conn.query_row(
        &format!("{} WHERE cs.id = ?", SCHEDULE_SELECT),
        [schedule_id],
        joined_json,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("schedule"))
}

fn apply_fields(fields: &Value, rec: &mut ScheduleRecord) -> Result<(), HandlerErr> {
    let text = |key: &str, slot: &mut String| -> Result<(), HandlerErr> {
        if fields.get(key).is_some() {
            *slot = get_optional_str(fields, key)?.unwrap_or_default();
        }
        Ok(())
    };
    text("courseId", &mut rec.course_id)?;
    text("sectionId", &mut rec.section_id)?;
    text("roomId", &mut rec.room_id)?;
    text("dayOfWeek", &mut rec.day_of_week)?;
    text("startTime", &mut rec.start_time)?;
    text("endTime", &mut rec.end_time)?;
    text("semester", &mut rec.semester)?;
    text("schoolYear", &mut rec.school_year)?;
    if let Some(is_lab) = get_optional_bool(fields, "isLab")? {
        rec.is_lab = is_lab;
    }
    Ok(())
}

/// Validates the record and rewrites day, times and semester into their
/// stored spelling.
fn normalize(conn: &Connection, rec: &mut ScheduleRecord) -> Result<TimeRange, HandlerErr> {
    for (key, value) in [
        ("courseId", &rec.course_id),
        ("sectionId", &rec.section_id),
        ("roomId", &rec.room_id),
    ] {
        if value.is_empty() {
            return Err(HandlerErr::bad_params(format!("missing {}", key)));
        }
    }
    let day = DayOfWeek::parse(&rec.day_of_week)?;
    let range = TimeRange::parse(&rec.start_time, &rec.end_time)?;
    let semester = Semester::parse(&rec.semester)?;
    rec.school_year = parse_school_year(&rec.school_year)?;
    rec.day_of_week = day.as_str().to_string();
    rec.start_time = range.start.to_string();
    rec.end_time = range.end.to_string();
    rec.semester = semester.as_str().to_string();

    for (table, what, id) in [
        ("courses", "course", &rec.course_id),
        ("sections", "section", &rec.section_id),
        ("rooms", "room", &rec.room_id),
    ] {
        if !row_exists(conn, table, id)? {
            return Err(HandlerErr::not_found(what));
        }
    }
    Ok(range)
}

/// Another slot in the same room, or for the same section, on the same day of
/// the same term may not overlap this one.
fn check_conflicts(conn: &Connection, rec: &ScheduleRecord, range: TimeRange) -> Result<(), HandlerErr> {
    for (column, kind, owner) in [
        ("room_id", "room", &rec.room_id),
        ("section_id", "section", &rec.section_id),
    ] {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, start_time, end_time FROM course_schedules
                 WHERE {} = ? AND day_of_week = ? AND semester = ? AND school_year = ? AND id <> ?",
                column
            ))
            .map_err(HandlerErr::query)?;
        let slots = stmt
            .query_map(
                (owner, &rec.day_of_week, &rec.semester, &rec.school_year, &rec.id),
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                },
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        for (other_id, start, end) in slots {
            let Ok(other) = TimeRange::parse(&start, &end) else {
                tracing::warn!(schedule_id = %other_id, "skipping schedule with unreadable times");
                continue;
            };
            if range.overlaps(&other) {
                return Err(HandlerErr::new(
                    "schedule_conflict",
                    format!("{} is already booked at that time", kind),
                )
                .with_details(json!({
                    "kind": kind,
                    "scheduleId": other_id,
                    "dayOfWeek": rec.day_of_week,
                    "startTime": start,
                    "endTime": end
                })));
            }
        }
    }
    Ok(())
}

struct ScheduleFilter {
    semester: Option<String>,
    school_year: Option<String>,
    section_id: Option<String>,
    room_id: Option<String>,
    day_of_week: Option<String>,
}

impl ScheduleFilter {
    fn from_params(params: &Value) -> Result<Self, HandlerErr> {
        Ok(Self {
            semester: get_optional_str(params, "semester")?
                .map(|s| Semester::parse(&s).map(|v| v.as_str().to_string()))
                .transpose()?,
            school_year: get_optional_str(params, "schoolYear")?
                .map(|s| parse_school_year(&s))
                .transpose()?,
            section_id: get_optional_str(params, "sectionId")?,
            room_id: get_optional_str(params, "roomId")?,
            day_of_week: get_optional_str(params, "dayOfWeek")?
                .map(|s| DayOfWeek::parse(&s).map(|d| d.as_str().to_string()))
                .transpose()?,
        })
    }
}

/// Matching slots ordered Monday first, then by start time.
fn query_schedules(
    conn: &Connection,
    filter: &ScheduleFilter,
) -> Result<Vec<(DayOfWeek, Value)>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "{}
             WHERE (?1 IS NULL OR cs.semester = ?1)
               AND (?2 IS NULL OR cs.school_year = ?2)
               AND (?3 IS NULL OR cs.section_id = ?3)
               AND (?4 IS NULL OR cs.room_id = ?4)
               AND (?5 IS NULL OR cs.day_of_week = ?5)",
            SCHEDULE_SELECT
        ))
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map(
            (
                &filter.semester,
                &filter.school_year,
                &filter.section_id,
                &filter.room_id,
                &filter.day_of_week,
            ),
            joined_json,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut out: Vec<(DayOfWeek, String, Value)> = rows
        .into_iter()
        .filter_map(|(rec, v)| match DayOfWeek::parse(&rec.day_of_week) {
            Ok(day) => Some((day, rec.start_time, v)),
            Err(_) => {
                tracing::warn!(schedule_id = %rec.id, "skipping schedule with unknown day");
                None
            }
        })
        .collect();
    out.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    Ok(out.into_iter().map(|(day, _, v)| (day, v)).collect())
}

fn schedules_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let filter = ScheduleFilter::from_params(&req.params)?;
    let schedules: Vec<Value> = query_schedules(conn, &filter)?
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    Ok(json!({ "schedules": schedules }))
}

fn schedules_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let schedule_id = get_required_str(&req.params, "scheduleId")?;
    let (_, v) = load_schedule(conn, &schedule_id)?;
    Ok(json!({ "schedule": v }))
}

fn schedules_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut rec = ScheduleRecord {
        id: Uuid::new_v4().to_string(),
        course_id: String::new(),
        section_id: String::new(),
        room_id: String::new(),
        day_of_week: String::new(),
        start_time: String::new(),
        end_time: String::new(),
        is_lab: false,
        semester: String::new(),
        school_year: String::new(),
        created_at: now_ts(),
    };
    apply_fields(&req.params, &mut rec)?;
    let range = normalize(conn, &mut rec)?;
    check_conflicts(conn, &rec, range)?;
    conn.execute(
        "INSERT INTO course_schedules(
           id, course_id, section_id, room_id, day_of_week, start_time, end_time,
           is_lab, semester, school_year, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &rec.id,
            &rec.course_id,
            &rec.section_id,
            &rec.room_id,
            &rec.day_of_week,
            &rec.start_time,
            &rec.end_time,
            rec.is_lab as i64,
            &rec.semester,
            &rec.school_year,
            &rec.created_at,
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "course_schedules" }))
    })?;
    Ok(json!({ "scheduleId": rec.id, "schedule": rec.to_json() }))
}

fn schedules_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let schedule_id = get_required_str(&req.params, "scheduleId")?;
    let patch = get_patch(&req.params)?;
    let (mut rec, _) = load_schedule(conn, &schedule_id)?;
    apply_fields(patch, &mut rec)?;
    let range = normalize(conn, &mut rec)?;
    check_conflicts(conn, &rec, range)?;
    conn.execute(
        "UPDATE course_schedules
         SET course_id = ?, section_id = ?, room_id = ?, day_of_week = ?, start_time = ?,
             end_time = ?, is_lab = ?, semester = ?, school_year = ?
         WHERE id = ?",
        (
            &rec.course_id,
            &rec.section_id,
            &rec.room_id,
            &rec.day_of_week,
            &rec.start_time,
            &rec.end_time,
            rec.is_lab as i64,
            &rec.semester,
            &rec.school_year,
            &rec.id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true, "schedule": rec.to_json() }))
}

fn schedules_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let schedule_id = get_required_str(&req.params, "scheduleId")?;
    let changed = conn
        .execute("DELETE FROM course_schedules WHERE id = ?", [&schedule_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("schedule"));
    }
    Ok(json!({ "ok": true }))
}

/// Weekly slots laid out over the dates of one month.
fn schedules_month(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let month = get_required_str(&req.params, "month")?;
    let (year, month_no) = parse_month_key(&month)?;
    let filter = ScheduleFilter {
        day_of_week: None,
        ..ScheduleFilter::from_params(&req.params)?
    };
    let slots = query_schedules(conn, &filter)?;

    let mut occurrences = 0usize;
    let days: Vec<Value> = month_days(year, month_no)
        .into_iter()
        .map(|date| {
            let day = DayOfWeek::from_weekday(date.weekday());
            let schedules: Vec<&Value> = slots
                .iter()
                .filter(|(d, _)| *d == day)
                .map(|(_, v)| v)
                .collect();
            occurrences += schedules.len();
            json!({
                "date": date.format("%Y-%m-%d").to_string(),
                "dayOfWeek": day.as_str(),
                "schedules": schedules
            })
        })
        .collect();
    Ok(json!({
        "month": format!("{:04}-{:02}", year, month_no),
        "occurrences": occurrences,
        "days": days
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "schedules.list" => schedules_list(state, req),
        "schedules.get" => schedules_get(state, req),
        "schedules.create" => schedules_create(state, req),
        "schedules.update" => schedules_update(state, req),
        "schedules.delete" => schedules_delete(state, req),
        "schedules.month" => schedules_month(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
