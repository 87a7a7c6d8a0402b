use crate::backup;
use crate::db;
use crate::ipc::helpers::{get_required_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;

fn target_workspace(state: &AppState, req: &Request) -> Result<PathBuf, HandlerErr> {
    req.params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn export_bundle(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let out_path = get_required_str(&req.params, "outPath")?;
    let workspace_path = target_workspace(state, req)?;

    // Rollback journal: committed rows are already in the database file.
    let export = backup::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path))
        .map_err(|e| {
            tracing::warn!(path = %out_path, "bundle export failed: {e:#}");
            HandlerErr::new("io_failed", format!("{e:#}")).with_details(json!({ "path": out_path }))
        })?;
    tracing::info!(path = %out_path, sha256 = %export.db_sha256, "workspace bundle exported");
    Ok(json!({
        "ok": true,
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "dbSha256": export.db_sha256
    }))
}

fn import_bundle(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let in_path = get_required_str(&req.params, "inPath")?;
    let workspace_path = target_workspace(state, req)?;
    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(HandlerErr::new("not_found", "bundle file not found")
            .with_details(json!({ "path": in_path })));
    }

    // The open handle must be dropped before the file is replaced.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %in_path, "bundle import failed: {e:#}");
            // Nothing was replaced; put the previous workspace back.
            if let Some(previous) = state.workspace.as_ref() {
                state.db = db::open_db(previous).ok();
            }
            return Err(HandlerErr::new("io_failed", format!("{e:#}"))
                .with_details(json!({ "path": in_path })));
        }
    };

    let conn = db::open_db(&workspace_path)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    state.workspace = Some(workspace_path.clone());
    state.db = Some(conn);
    tracing::info!(
        path = %in_path,
        format = %import.bundle_format_detected,
        "workspace restored"
    );
    Ok(json!({
        "ok": true,
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "dbSha256": import.db_sha256
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => export_bundle(state, req),
        "backup.importWorkspaceBundle" => import_bundle(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
