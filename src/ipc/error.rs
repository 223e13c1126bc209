use crate::error::PipelineError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Details attached to pipeline failures that name a file or a run.
pub fn pipeline_details(e: &PipelineError) -> Option<serde_json::Value> {
    match e {
        PipelineError::Decode { file_name, .. } => Some(json!({ "fileName": file_name })),
        PipelineError::RunCancelled { run_id } => Some(json!({ "runId": run_id })),
        _ => None,
    }
}
