use crate::auth::{AdminCheck, RoleTable};
use crate::error::PipelineError;
use crate::ipc::error::{err, ok, pipeline_details};
use crate::ipc::types::{AppState, Request};
use base64::{engine::general_purpose, Engine as _};
use rusqlite::Connection;
use tracing::warn;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr::new("bad_params", message)
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<PipelineError> for HandlerErr {
    fn from(e: PipelineError) -> Self {
        HandlerErr {
            code: e.code(),
            message: e.to_string(),
            details: pipeline_details(&e),
        }
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        HandlerErr::new("db_failed", format!("{e:#}"))
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

/// Decodes base64 payloads, with or without a `data:...;base64,` prefix.
pub fn decode_base64(raw: &str, key: &str) -> Result<Vec<u8>, HandlerErr> {
    let body = match raw.find(";base64,") {
        Some(pos) if raw.starts_with("data:") => &raw[pos + ";base64,".len()..],
        _ => raw,
    };
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| HandlerErr::bad_params(format!("{} is not valid base64: {}", key, e)))
}

/// Runs `f` for an admin caller against the open workspace.
///
/// The caller is checked before anything else so unauthenticated requests
/// never reach parameter decoding.
pub fn admin_only<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &str, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(caller) = req.caller.as_deref().map(str::trim).filter(|c| !c.is_empty()) else {
        return err(&req.id, "unauthorized", "missing caller", None);
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match RoleTable::new(conn).is_admin(caller) {
        Ok(true) => {}
        Ok(false) => {
            warn!(caller, method = %req.method, "non-admin caller refused");
            return err(&req.id, "forbidden", "admin role required", None);
        }
        Err(e) => return err(&req.id, "auth_failed", format!("{e:#}"), None),
    }
    match f(conn, caller, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}
