use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::sessions;
use crate::ipc::helpers::{now_utc, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            tracing::info!(workspace = %path.display(), "workspace opened");
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => {
            tracing::warn!(workspace = %path.display(), "workspace open failed: {e:#}");
            err(&req.id, "db_open_failed", format!("{e:#}"), None)
        }
    }
}

fn dashboard_stats(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    sessions::expire_stale(conn, now_utc())?;

    // Correlated subqueries keep this a single round trip.
    conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM students),
           (SELECT COUNT(*) FROM courses),
           (SELECT COUNT(*) FROM rooms),
           (SELECT COUNT(*) FROM sections),
           (SELECT COUNT(*) FROM course_schedules),
           (SELECT COUNT(*) FROM attendance_sessions WHERE status = 'active')",
        [],
        |r| {
            Ok(json!({
                "students": r.get::<_, i64>(0)?,
                "courses": r.get::<_, i64>(1)?,
                "rooms": r.get::<_, i64>(2)?,
                "sections": r.get::<_, i64>(3)?,
                "schedules": r.get::<_, i64>(4)?,
                "activeSessions": r.get::<_, i64>(5)?
            }))
        },
    )
    .map_err(HandlerErr::query)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "dashboard.stats" => Some(respond(&req.id, dashboard_stats(state))),
        _ => None,
    }
}
