use crate::ipc::helpers::{
    admin_only, decode_base64, get_optional_bool, get_optional_str, get_required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{FileData, FileRequest, Importer};
use crate::setup;
use rusqlite::Connection;
use serde_json::{json, Value};

const DEFAULT_FILE_NAME: &str = "unknown.csv";
const DEFAULT_ARCHIVE_NAME: &str = "archive.zip";

#[derive(Clone, Copy)]
enum ImportAction {
    Import,
    ForceCancel,
    Rollback,
    ImportArchive,
}

impl ImportAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "import" => Some(Self::Import),
            "force_cancel" => Some(Self::ForceCancel),
            "rollback" => Some(Self::Rollback),
            "import_archive" => Some(Self::ImportArchive),
            _ => None,
        }
    }
}

fn importer(conn: &Connection) -> Result<Importer<'_, crate::store::SqliteRecordStore<'_>>, HandlerErr> {
    let settings = setup::load_import_settings(conn)?;
    Ok(Importer::sqlite(conn, settings))
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(v).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

/// Text wins when both `data` and `binaryData` are sent.
fn file_data(params: &Value) -> Result<Option<FileData>, HandlerErr> {
    if let Some(text) = params.get("data").and_then(|v| v.as_str()) {
        if !text.trim().is_empty() {
            return Ok(Some(FileData::Text(text.to_string())));
        }
    }
    match params.get("binaryData").and_then(|v| v.as_str()) {
        Some(b64) if !b64.trim().is_empty() => {
            Ok(Some(FileData::Workbook(decode_base64(b64, "binaryData")?)))
        }
        _ => Ok(None),
    }
}

fn import(conn: &Connection, caller: &str, params: &Value) -> Result<Value, HandlerErr> {
    let req = FileRequest {
        file_name: get_optional_str(params, "fileName").unwrap_or_else(|| DEFAULT_FILE_NAME.to_string()),
        data: file_data(params)?,
        run_id: get_optional_str(params, "runId"),
        use_filename_as_subject_id: get_optional_bool(params, "useFilenameAsSubjectId")?,
    };
    let report = importer(conn)?.import_file(caller, req)?;
    to_json(&report)
}

fn force_cancel(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let run_id = get_required_str(params, "runId")?;
    let run = importer(conn)?.force_cancel(&run_id)?;
    Ok(json!({
        "success": true,
        "runId": run.id,
        "status": run.status,
    }))
}

fn rollback(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let run_id = get_required_str(params, "runId")?;
    let report = importer(conn)?.rollback(&run_id)?;
    to_json(&report)
}

fn import_archive(conn: &Connection, caller: &str, params: &Value) -> Result<Value, HandlerErr> {
    let raw = get_required_str(params, "binaryData")?;
    let bytes = decode_base64(&raw, "binaryData")?;
    let file_name =
        get_optional_str(params, "fileName").unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string());
    let report = importer(conn)?.import_archive(caller, &file_name, &bytes)?;
    to_json(&report)
}

fn records_import(conn: &Connection, caller: &str, params: &Value) -> Result<Value, HandlerErr> {
    let action = match params.get("action").and_then(|v| v.as_str()) {
        None => ImportAction::Import,
        Some(s) => ImportAction::parse(s)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown action: {}", s)))?,
    };
    match action {
        ImportAction::Import => import(conn, caller, params),
        ImportAction::ForceCancel => force_cancel(conn, params),
        ImportAction::Rollback => rollback(conn, params),
        ImportAction::ImportArchive => import_archive(conn, caller, params),
    }
}

fn handle_records_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    admin_only(state, req, records_import)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "records.import" => Some(handle_records_import(state, req)),
        _ => None,
    }
}
