use crate::ipc::error::{err, ok};
use crate::ipc::types::AppState;
use crate::roster::RosterError;
use crate::schedule::ScheduleError;
use crate::session::{self, SessionError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn db(code: &'static str, e: rusqlite::Error) -> Self {
        Self::new(code, e.to_string())
    }

    pub fn query(e: rusqlite::Error) -> Self {
        Self::db("db_query_failed", e)
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<SessionError> for HandlerErr {
    fn from(e: SessionError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<ScheduleError> for HandlerErr {
    fn from(e: ScheduleError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<RosterError> for HandlerErr {
    fn from(e: RosterError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

pub fn respond(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Missing, null and blank strings all read as `None`.
pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_optional_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_patch(params: &Value) -> Result<&Value, HandlerErr> {
    params
        .get("patch")
        .filter(|v| v.is_object())
        .ok_or_else(|| HandlerErr::bad_params("missing/invalid patch"))
}

/// Text inputs may be either an inline `text` value or a file at `inPath`.
pub fn read_text_input(params: &Value) -> Result<(String, Option<String>), HandlerErr> {
    if let Some(text) = params.get("text").and_then(|v| v.as_str()) {
        return Ok((text.to_string(), None));
    }
    let in_path = get_required_str(params, "inPath")
        .map_err(|_| HandlerErr::bad_params("missing inPath or text"))?;
    let text = std::fs::read_to_string(&in_path).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string())
            .with_details(serde_json::json!({ "path": in_path }))
    })?;
    Ok((text, Some(in_path)))
}

pub fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let p = std::path::Path::new(path);
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HandlerErr::new("io_failed", e.to_string())
                    .with_details(serde_json::json!({ "path": path }))
            })?;
        }
    }
    std::fs::write(p, contents).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(serde_json::json!({ "path": path }))
    })
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn now_ts() -> String {
    session::format_ts(now_utc())
}

/// `table` is always a compile-time constant at call sites.
pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?", table),
        [id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

pub fn count(conn: &Connection, sql: &str, id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get(0))
        .map_err(HandlerErr::query)
}
