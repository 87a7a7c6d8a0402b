use crate::ipc::helpers::{
    count, get_optional_i64, get_optional_str, get_patch, get_required_str, now_ts, require_db,
    respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct RoomRecord {
    id: String,
    room_number: String,
    room_type: Option<String>,
    capacity: Option<i64>,
    created_at: String,
}

impl RoomRecord {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            room_number: r.get(1)?,
            room_type: r.get(2)?,
            capacity: r.get(3)?,
            created_at: r.get(4)?,
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "roomNumber": self.room_number,
            "roomType": self.room_type,
            "capacity": self.capacity,
            "createdAt": self.created_at
        })
    }
}

fn load_room(conn: &Connection, room_id: &str) -> Result<RoomRecord, HandlerErr> {
    conn.query_row(
        "SELECT id, room_number, room_type, capacity, created_at FROM rooms WHERE id = ?",
        [room_id],
        RoomRecord::from_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("room"))
}

fn apply_fields(fields: &Value, rec: &mut RoomRecord) -> Result<(), HandlerErr> {
    if fields.get("roomNumber").is_some() {
        rec.room_number = get_optional_str(fields, "roomNumber")?.unwrap_or_default();
    }
    if fields.get("roomType").is_some() {
        rec.room_type = get_optional_str(fields, "roomType")?;
    }
    if fields.get("capacity").is_some() {
        rec.capacity = match get_optional_i64(fields, "capacity")? {
            Some(n) if n <= 0 => {
                return Err(HandlerErr::bad_params("capacity must be a positive integer"))
            }
            other => other,
        };
    }
    if rec.room_number.is_empty() {
        return Err(HandlerErr::bad_params("roomNumber must not be empty"));
    }
    Ok(())
}

fn ensure_number_free(conn: &Connection, rec: &RoomRecord) -> Result<(), HandlerErr> {
    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM rooms WHERE room_number = ? COLLATE NOCASE AND id <> ?",
            (&rec.room_number, &rec.id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    match taken {
        Some(other) => Err(HandlerErr::new("duplicate", "room number already exists")
            .with_details(json!({ "field": "roomNumber", "roomId": other }))),
        None => Ok(()),
    }
}

fn rooms_list(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.room_number, r.room_type, r.capacity, r.created_at,
               (SELECT COUNT(*) FROM course_schedules cs WHERE cs.room_id = r.id)
             FROM rooms r
             ORDER BY r.room_number COLLATE NOCASE",
        )
        .map_err(HandlerErr::query)?;
    let rooms = stmt
        .query_map([], |r| {
            let mut v = RoomRecord::from_row(r)?.to_json();
            v["scheduleCount"] = json!(r.get::<_, i64>(5)?);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "rooms": rooms }))
}

fn rooms_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let room_id = get_required_str(&req.params, "roomId")?;
    Ok(json!({ "room": load_room(conn, &room_id)?.to_json() }))
}

fn rooms_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut rec = RoomRecord {
        id: Uuid::new_v4().to_string(),
        room_number: String::new(),
        room_type: None,
        capacity: None,
        created_at: now_ts(),
    };
    apply_fields(&req.params, &mut rec)?;
    ensure_number_free(conn, &rec)?;
    conn.execute(
        "INSERT INTO rooms(id, room_number, room_type, capacity, created_at) VALUES(?, ?, ?, ?, ?)",
        (
            &rec.id,
            &rec.room_number,
            &rec.room_type,
            rec.capacity,
            &rec.created_at,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "rooms" })))?;
    Ok(json!({ "roomId": rec.id, "room": rec.to_json() }))
}

fn rooms_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let room_id = get_required_str(&req.params, "roomId")?;
    let patch = get_patch(&req.params)?;
    let mut rec = load_room(conn, &room_id)?;
    apply_fields(patch, &mut rec)?;
    ensure_number_free(conn, &rec)?;
    conn.execute(
        "UPDATE rooms SET room_number = ?, room_type = ?, capacity = ? WHERE id = ?",
        (&rec.room_number, &rec.room_type, rec.capacity, &rec.id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true, "room": rec.to_json() }))
}

fn rooms_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let room_id = get_required_str(&req.params, "roomId")?;
    load_room(conn, &room_id)?;
    let schedules = count(
        conn,
        "SELECT COUNT(*) FROM course_schedules WHERE room_id = ?",
        &room_id,
    )?;
    if schedules > 0 {
        return Err(HandlerErr::new("in_use", "room is used by course schedules")
            .with_details(json!({ "schedules": schedules })));
    }
    conn.execute("DELETE FROM rooms WHERE id = ?", [&room_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "rooms.list" => rooms_list(state),
        "rooms.get" => rooms_get(state, req),
        "rooms.create" => rooms_create(state, req),
        "rooms.update" => rooms_update(state, req),
        "rooms.delete" => rooms_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
