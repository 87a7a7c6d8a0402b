use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::HandlerErr;
use crate::ipc::types::{AppState, Request};
use crate::roster::{RosterOptions, MAX_YEAR_LEVEL, MIN_YEAR_LEVEL};
use crate::session::{DEFAULT_LATE_AFTER_MINUTES, DEFAULT_SESSION_TTL_MINUTES};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Attendance,
    Import,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "import" => Some(Self::Import),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Attendance => "setup.attendance",
            Self::Import => "setup.import",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Attendance => json!({
            "lateAfterMinutes": DEFAULT_LATE_AFTER_MINUTES,
            "sessionTtlMinutes": DEFAULT_SESSION_TTL_MINUTES,
            "minSearchChars": 2,
            "checkInBaseUrl": "",
            "utcOffsetMinutes": 0
        }),
        SetupSection::Import => json!({
            "allowUnknownSection": false,
            "requireEmail": true,
            "defaultYearLevel": 1
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Attendance => match k.as_str() {
                "lateAfterMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 240)?));
                }
                "sessionTtlMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 1440)?));
                }
                "minSearchChars" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 10)?));
                }
                "checkInBaseUrl" => {
                    let url = parse_string_max(v, k, 200)?;
                    obj.insert(k.clone(), Value::String(url.trim_end_matches('/').to_string()));
                }
                "utcOffsetMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, -720, 840)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Import => match k.as_str() {
                "allowUnknownSection" | "requireEmail" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "defaultYearLevel" => {
                    obj.insert(
                        k.clone(),
                        Value::from(parse_i64_range(v, k, MIN_YEAR_LEVEL, MAX_YEAR_LEVEL)?),
                    );
                }
                _ => return Err(format!("unknown import field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

#[derive(Debug, Clone)]
pub struct AttendanceSettings {
    pub late_after_minutes: i64,
    pub session_ttl_minutes: i64,
    pub min_search_chars: usize,
    pub check_in_base_url: String,
    pub utc_offset_minutes: i64,
}

pub fn attendance_settings(conn: &rusqlite::Connection) -> Result<AttendanceSettings, HandlerErr> {
    let v = load_section(conn, SetupSection::Attendance)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let int = |key: &str, default: i64| v.get(key).and_then(|x| x.as_i64()).unwrap_or(default);
    Ok(AttendanceSettings {
        late_after_minutes: int("lateAfterMinutes", DEFAULT_LATE_AFTER_MINUTES),
        session_ttl_minutes: int("sessionTtlMinutes", DEFAULT_SESSION_TTL_MINUTES),
        min_search_chars: int("minSearchChars", 2).max(1) as usize,
        check_in_base_url: v
            .get("checkInBaseUrl")
            .and_then(|x| x.as_str())
            .unwrap_or("")
            .to_string(),
        utc_offset_minutes: int("utcOffsetMinutes", 0),
    })
}

pub fn import_options(conn: &rusqlite::Connection) -> Result<RosterOptions, HandlerErr> {
    let v = load_section(conn, SetupSection::Import)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let defaults = RosterOptions::default();
    Ok(RosterOptions {
        allow_unknown_section: v
            .get("allowUnknownSection")
            .and_then(|x| x.as_bool())
            .unwrap_or(defaults.allow_unknown_section),
        require_email: v
            .get("requireEmail")
            .and_then(|x| x.as_bool())
            .unwrap_or(defaults.require_email),
        default_year_level: v
            .get("defaultYearLevel")
            .and_then(|x| x.as_i64())
            .unwrap_or(defaults.default_year_level),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let attendance = match load_section(conn, SetupSection::Attendance) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let import = match load_section(conn, SetupSection::Import) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "attendance": attendance,
            "import": import
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section_raw, "setup updated");
    let mut result = json!({ "ok": true });
    result[section_raw] = current;
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
