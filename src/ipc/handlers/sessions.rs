use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    get_optional_i64, get_optional_str, get_required_str, now_utc, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{
    check_in_url, effective_status, expiry_from_ttl, format_ts, local_date, needs_expiry_transition,
    parse_date, parse_ts, AttendanceStatus, SessionStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

/// Students enrolled in a session: same section, and same course whenever
/// both sides record one. `?1` is the section id, `?2` the course id.
pub const ENROLLED_SQL: &str = "st.section_id = ?1 AND (?2 IS NULL OR st.course_id IS NULL OR st.course_id = ?2)";

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub section_id: String,
    pub course_id: Option<String>,
    pub instructor_id: Option<String>,
    pub date: String,
    pub created_at: String,
    pub expires_at: String,
    pub status: SessionStatus,
    pub section_name: String,
    pub course_code: Option<String>,
}

const SESSION_SELECT: &str = "SELECT a.id, a.section_id, a.course_id, a.instructor_id, a.date,
        a.created_at, a.expires_at, a.status, s.name, c.code
     FROM attendance_sessions a
     JOIN sections s ON s.id = a.section_id
     LEFT JOIN courses c ON c.id = a.course_id";

impl SessionRecord {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            section_id: r.get(1)?,
            course_id: r.get(2)?,
            instructor_id: r.get(3)?,
            date: r.get(4)?,
            created_at: r.get(5)?,
            expires_at: r.get(6)?,
            status: SessionStatus::from_stored(r.get::<_, Option<String>>(7)?.as_deref()),
            section_name: r.get(8)?,
            course_code: r.get(9)?,
        })
    }

    pub fn created(&self) -> Result<DateTime<Utc>, HandlerErr> {
        Ok(parse_ts(&self.created_at)?)
    }

    pub fn expires(&self) -> Result<DateTime<Utc>, HandlerErr> {
        Ok(parse_ts(&self.expires_at)?)
    }

    /// Status as seen at `now`, whether or not the row has been swept yet.
    pub fn status_at(&self, now: DateTime<Utc>) -> SessionStatus {
        match parse_ts(&self.expires_at) {
            Ok(expires) => effective_status(self.status, expires, now),
            Err(_) => self.status,
        }
    }

    pub fn to_json(&self, now: DateTime<Utc>) -> Value {
        let status = self.status_at(now);
        let remaining = match (status, parse_ts(&self.expires_at)) {
            (SessionStatus::Active, Ok(e)) => (e - now).num_seconds().max(0),
            _ => 0,
        };
        json!({
            "id": self.id,
            "sectionId": self.section_id,
            "sectionName": self.section_name,
            "courseId": self.course_id,
            "courseCode": self.course_code,
            "instructorId": self.instructor_id,
            "date": self.date,
            "createdAt": self.created_at,
            "expiresAt": self.expires_at,
            "status": status.as_str(),
            "secondsRemaining": remaining
        })
    }
}

pub fn load_session(conn: &Connection, session_id: &str) -> Result<SessionRecord, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE a.id = ?", SESSION_SELECT),
        [session_id],
        SessionRecord::from_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("session"))
}

/// Flips every active session whose deadline has passed. Returns how many
/// rows changed.
pub fn expire_stale(conn: &Connection, now: DateTime<Utc>) -> Result<usize, HandlerErr> {
    let changed = conn
        .execute(
            "UPDATE attendance_sessions SET status = 'expired'
             WHERE (status IS NULL OR status <> 'expired') AND expires_at < ?",
            [format_ts(now)],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed > 0 {
        tracing::info!(expired = changed, "stale sessions expired");
    }
    Ok(changed)
}

fn mark_expired(conn: &Connection, session_id: &str) -> Result<(), HandlerErr> {
    conn.execute(
        "UPDATE attendance_sessions SET status = 'expired' WHERE id = ?",
        [session_id],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(())
}

fn expired_err(session: &SessionRecord) -> HandlerErr {
    HandlerErr::new("session_expired", "attendance session has expired").with_details(json!({
        "sessionId": session.id,
        "expiresAt": session.expires_at
    }))
}

/// Gate for the scan landing page and for QR check-in. A session found past
/// its deadline is expired on the spot.
pub fn require_open_session(
    conn: &Connection,
    session_id: &str,
    section_name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SessionRecord, HandlerErr> {
    let mut session = load_session(conn, session_id)?;
    let expires = session.expires()?;
    if needs_expiry_transition(session.status, expires, now) {
        mark_expired(conn, &session.id)?;
        session.status = SessionStatus::Expired;
        tracing::info!(session_id = %session.id, "session expired on access");
        return Err(expired_err(&session));
    }
    if effective_status(session.status, expires, now) == SessionStatus::Expired {
        return Err(expired_err(&session));
    }
    if let Some(name) = section_name {
        if !name.trim().eq_ignore_ascii_case(session.section_name.trim()) {
            return Err(
                HandlerErr::new("section_mismatch", "session belongs to a different section")
                    .with_details(json!({ "sessionId": session.id })),
            );
        }
    }
    Ok(session)
}

fn sessions_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let section_id = get_required_str(&req.params, "sectionId")?;
    let ttl_minutes = get_optional_i64(&req.params, "ttlMinutes")?;
    let expires_raw = get_optional_str(&req.params, "expiresAt")?;
    let instructor_id = get_optional_str(&req.params, "instructorId")?;
    if ttl_minutes.is_some() && expires_raw.is_some() {
        return Err(HandlerErr::bad_params("give ttlMinutes or expiresAt, not both"));
    }

    let (section_name, course_id): (String, Option<String>) = conn
        .query_row(
            "SELECT name, course_id FROM sections WHERE id = ?",
            [&section_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("section"))?;

    let settings = setup::attendance_settings(conn)?;
    let now = now_utc();
    let expires = match (ttl_minutes, expires_raw) {
        (_, Some(raw)) => parse_ts(&raw)?,
        (Some(ttl), None) => {
            if !(1..=1440).contains(&ttl) {
                return Err(HandlerErr::bad_params("ttlMinutes must be in 1..=1440"));
            }
            expiry_from_ttl(now, ttl)
        }
        (None, None) => expiry_from_ttl(now, settings.session_ttl_minutes),
    };
    let date = local_date(now, settings.utc_offset_minutes)?;

    let session_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_sessions(id, section_id, course_id, instructor_id, date, created_at, expires_at, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'active')",
        (
            &session_id,
            &section_id,
            &course_id,
            &instructor_id,
            date.format("%Y-%m-%d").to_string(),
            format_ts(now),
            format_ts(expires),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "attendance_sessions" }))
    })?;
    tracing::info!(
        session_id = %session_id,
        section = %section_name,
        expires_at = %format_ts(expires),
        "attendance session created"
    );

    let session = load_session(conn, &session_id)?;
    Ok(json!({
        "sessionId": session_id,
        "session": session.to_json(now),
        "checkInUrl": check_in_url(&settings.check_in_base_url, &section_name, &session_id)
    }))
}

fn sessions_open(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let session_id = get_required_str(&req.params, "sessionId")?;
    let section_name = get_optional_str(&req.params, "sectionName")?;
    let now = now_utc();
    let session = require_open_session(conn, &session_id, section_name.as_deref(), now)?;

    let section = conn
        .query_row(
            "SELECT id, name, program, year_level FROM sections WHERE id = ?",
            [&session.section_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "program": r.get::<_, String>(2)?,
                    "yearLevel": r.get::<_, i64>(3)?
                }))
            },
        )
        .map_err(HandlerErr::query)?;
    let course = match session.course_id.as_deref() {
        Some(course_id) => conn
            .query_row(
                "SELECT id, code, title FROM courses WHERE id = ?",
                [course_id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, String>(0)?,
                        "code": r.get::<_, String>(1)?,
                        "title": r.get::<_, String>(2)?
                    }))
                },
            )
            .optional()
            .map_err(HandlerErr::query)?,
        None => None,
    };
    Ok(json!({
        "session": session.to_json(now),
        "section": section,
        "course": course
    }))
}

fn sessions_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let section_id = get_optional_str(&req.params, "sectionId")?;
    let date = get_optional_str(&req.params, "date")?
        .map(|d| parse_date(&d).map(|v| v.format("%Y-%m-%d").to_string()))
        .transpose()?;
    let status = match get_optional_str(&req.params, "status")? {
        None => None,
        Some(s) if s.eq_ignore_ascii_case("active") => Some(SessionStatus::Active),
        Some(s) if s.eq_ignore_ascii_case("expired") => Some(SessionStatus::Expired),
        Some(s) => {
            return Err(HandlerErr::bad_params(format!(
                "status must be active or expired: {}",
                s
            )))
        }
    };

    let now = now_utc();
    expire_stale(conn, now)?;

    let mut stmt = conn
        .prepare(&format!(
            "{}
             WHERE (?1 IS NULL OR a.section_id = ?1)
               AND (?2 IS NULL OR a.date = ?2)
               AND (?3 IS NULL OR a.status = ?3)
             ORDER BY a.created_at DESC, a.id",
            SESSION_SELECT
        ))
        .map_err(HandlerErr::query)?;
    let sessions = stmt
        .query_map(
            (&section_id, &date, status.map(|s| s.as_str())),
            SessionRecord::from_row,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut count_stmt = conn
        .prepare("SELECT COUNT(*) FROM attendance_records WHERE session_id = ?")
        .map_err(HandlerErr::query)?;
    let mut out = Vec::with_capacity(sessions.len());
    for s in &sessions {
        let records: i64 = count_stmt
            .query_row([&s.id], |r| r.get(0))
            .map_err(HandlerErr::query)?;
        let mut v = s.to_json(now);
        v["recordCount"] = json!(records);
        out.push(v);
    }
    Ok(json!({ "sessions": out }))
}

fn sessions_close(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let session_id = get_required_str(&req.params, "sessionId")?;
    let session = load_session(conn, &session_id)?;
    let now = now_utc();
    let already_expired = session.status_at(now) == SessionStatus::Expired;
    if !already_expired {
        conn.execute(
            "UPDATE attendance_sessions SET status = 'expired', expires_at = ? WHERE id = ?",
            (format_ts(now), &session_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        tracing::info!(session_id = %session_id, "session closed");
    } else if session.status == SessionStatus::Active {
        mark_expired(conn, &session_id)?;
    }
    let session = load_session(conn, &session_id)?;
    Ok(json!({
        "ok": true,
        "alreadyExpired": already_expired,
        "session": session.to_json(now)
    }))
}

fn sessions_expire_stale(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let expired = expire_stale(conn, now_utc())?;
    Ok(json!({ "expired": expired }))
}

/// Every enrolled student with their mark for this session, if any.
fn sessions_roster(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let session_id = get_required_str(&req.params, "sessionId")?;
    let session = load_session(conn, &session_id)?;
    let now = now_utc();

    let mut stmt = conn
        .prepare(&format!(
            "SELECT st.id, st.name, st.year_level, ar.id, ar.status, ar.verification_method, ar.timestamp
             FROM students st
             LEFT JOIN attendance_records ar ON ar.student_id = st.id AND ar.session_id = ?3
             WHERE {}
             ORDER BY st.name COLLATE NOCASE, st.id",
            ENROLLED_SQL
        ))
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map(
            (&session.section_id, &session.course_id, &session.id),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut counts = [0usize; 4];
    let mut unmarked = 0usize;
    let mut students = Vec::with_capacity(rows.len());
    for (id, name, year_level, record_id, status, method, timestamp) in rows {
        match status.as_deref().map(AttendanceStatus::parse) {
            Some(Ok(s)) => {
                if let Some(i) = AttendanceStatus::ALL.iter().position(|x| *x == s) {
                    counts[i] += 1;
                }
            }
            Some(Err(_)) => {}
            None => unmarked += 1,
        }
        students.push(json!({
            "id": id,
            "name": name,
            "yearLevel": year_level,
            "recordId": record_id,
            "status": status,
            "verificationMethod": method,
            "timestamp": timestamp
        }));
    }
    let mut count_obj = serde_json::Map::new();
    for (status, n) in AttendanceStatus::ALL.iter().zip(counts) {
        count_obj.insert(status.as_str().to_string(), json!(n));
    }
    count_obj.insert("unmarked".to_string(), json!(unmarked));

    Ok(json!({
        "session": session.to_json(now),
        "students": students,
        "counts": count_obj
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "sessions.create" => sessions_create(state, req),
        "sessions.open" => sessions_open(state, req),
        "sessions.list" => sessions_list(state, req),
        "sessions.close" => sessions_close(state, req),
        "sessions.expireStale" => sessions_expire_stale(state),
        "sessions.roster" => sessions_roster(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
