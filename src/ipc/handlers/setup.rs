use crate::ipc::helpers::{admin_only, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::setup::{self, UpdateError};
use rusqlite::Connection;
use serde_json::{json, Value};

fn import_get(conn: &Connection, _caller: &str, _params: &Value) -> Result<Value, HandlerErr> {
    let settings = setup::load_import_settings(conn)?;
    Ok(json!({ "settings": settings }))
}

fn import_update(conn: &Connection, _caller: &str, params: &Value) -> Result<Value, HandlerErr> {
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    match setup::update_import_settings(conn, patch) {
        Ok(settings) => Ok(json!({ "settings": settings })),
        Err(UpdateError::Invalid(msg)) => Err(HandlerErr::bad_params(msg)),
        Err(UpdateError::Store(e)) => Err(HandlerErr::from(e)),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.import.get" => Some(admin_only(state, req, import_get)),
        "setup.import.update" => Some(admin_only(state, req, import_update)),
        _ => None,
    }
}
