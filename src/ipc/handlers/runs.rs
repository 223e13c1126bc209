use crate::ipc::helpers::{admin_only, get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{Importer, SourceKind};
use crate::runlog;
use crate::setup;
use rusqlite::Connection;
use serde_json::{json, Value};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

fn runs_create(conn: &Connection, caller: &str, params: &Value) -> Result<Value, HandlerErr> {
    let file_name = get_required_str(params, "fileName")?;
    let kind_raw = get_optional_str(params, "sourceKind").unwrap_or_else(|| "csv".to_string());
    let Some(kind) = SourceKind::parse(&kind_raw) else {
        return Err(HandlerErr::bad_params(
            "sourceKind must be one of: csv, xlsx, zip",
        ));
    };
    let mut names = Vec::new();
    if let Some(v) = params.get("fileNames") {
        let Some(items) = v.as_array() else {
            return Err(HandlerErr::bad_params("fileNames must be an array"));
        };
        for item in items {
            let Some(s) = item.as_str() else {
                return Err(HandlerErr::bad_params("fileNames must contain strings"));
            };
            names.push(s.to_string());
        }
    }

    let settings = setup::load_import_settings(conn)?;
    let run = Importer::sqlite(conn, settings).create_run(caller, &file_name, kind, &names)?;
    Ok(json!({ "run": run }))
}

fn runs_finalize(conn: &Connection, _caller: &str, params: &Value) -> Result<Value, HandlerErr> {
    let run_id = get_required_str(params, "runId")?;
    let settings = setup::load_import_settings(conn)?;
    let run = Importer::sqlite(conn, settings).finalize_run(&run_id)?;
    Ok(json!({ "run": run }))
}

fn runs_list(conn: &Connection, _caller: &str, params: &Value) -> Result<Value, HandlerErr> {
    let limit = match params.get("limit") {
        None | Some(Value::Null) => DEFAULT_LIST_LIMIT,
        Some(v) => v
            .as_i64()
            .filter(|n| (1..=MAX_LIST_LIMIT).contains(n))
            .ok_or_else(|| {
                HandlerErr::bad_params(format!("limit must be in 1..={}", MAX_LIST_LIMIT))
            })?,
    };
    let runs = runlog::list_runs(conn, limit as usize)?;
    Ok(json!({ "runs": runs }))
}

fn runs_get(conn: &Connection, _caller: &str, params: &Value) -> Result<Value, HandlerErr> {
    let run_id = get_required_str(params, "runId")?;
    let settings = setup::load_import_settings(conn)?;
    let (run, files) = Importer::sqlite(conn, settings).run_with_outcomes(&run_id)?;
    Ok(json!({ "run": run, "files": files }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "runs.create" => Some(admin_only(state, req, runs_create)),
        "runs.finalize" => Some(admin_only(state, req, runs_finalize)),
        "runs.list" => Some(admin_only(state, req, runs_list)),
        "runs.get" => Some(admin_only(state, req, runs_get)),
        _ => None,
    }
}
