mod test_support;

use serde_json::json;
use test_support::{error_code, open_workspace, record_count, request, request_ok, spawn_sidecar};

fn transcript(code_prefix: &str) -> String {
    format!(
        "course_code,course_name,academic_year,semester,letter_grade\n\
         {p}101,First,2022/2023,Spring,A\n\
         {p}102,Second,2022/2023,Spring,B\n",
        p = code_prefix
    )
}

#[test]
fn multi_file_run_finalizes_and_rolls_back_only_its_records() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_workspace(&mut stdin, &mut reader, "transcriptd-run-rollback");

    // A separate single-file run that must survive the rollback.
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "records.import",
        json!({ "data": transcript("BIO"), "fileName": "7777777.csv" }),
    );
    let other_run = other["runId"].as_str().expect("runId").to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "runs.create",
        json!({
            "fileName": "semester.zip",
            "sourceKind": "zip",
            "fileNames": ["1111111.csv", "2222222.csv"]
        }),
    );
    assert_eq!(created["run"]["status"], json!("processing"));
    assert_eq!(created["run"]["totalFiles"], json!(2));
    let run_id = created["run"]["id"].as_str().expect("run id").to_string();

    for (i, name) in ["1111111.csv", "2222222.csv"].iter().enumerate() {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            &format!("3-{}", i),
            "records.import",
            json!({ "data": transcript("CS"), "fileName": name, "runId": run_id }),
        );
        assert_eq!(res["runId"], json!(run_id));
        assert_eq!(res["insertedCount"], json!(2));
    }
    assert_eq!(record_count(&workspace), 6);

    let detail = request_ok(&mut stdin, &mut reader, "4", "runs.get", json!({ "runId": run_id }));
    assert_eq!(detail["run"]["status"], json!("processing"));
    let files = detail["files"].as_array().expect("files");
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f["status"] == json!("success")));

    let finalized = request_ok(&mut stdin, &mut reader, "5", "runs.finalize", json!({ "runId": run_id }));
    assert_eq!(finalized["run"]["status"], json!("completed"));
    assert_eq!(finalized["run"]["succeededFiles"], json!(2));
    assert_eq!(finalized["run"]["totalRecords"], json!(4));

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "records.import",
        json!({ "action": "rollback", "runId": run_id }),
    );
    assert_eq!(first["success"], json!(true));
    assert_eq!(first["deletedCount"], json!(4));
    assert_eq!(first["fileName"], json!("semester.zip"));
    assert_eq!(record_count(&workspace), 2);

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "records.import",
        json!({ "action": "rollback", "runId": run_id }),
    );
    assert_eq!(second["deletedCount"], json!(0));
    assert_eq!(record_count(&workspace), 2);

    let after = request_ok(&mut stdin, &mut reader, "8", "runs.get", json!({ "runId": run_id }));
    assert_eq!(after["run"]["status"], json!("rolled_back"));
    assert!(after["run"]["rolledBackAt"].is_string());
    assert!(after["files"]
        .as_array()
        .expect("files")
        .iter()
        .all(|f| f["status"] == json!("rolled_back")));

    let other_detail = request_ok(&mut stdin, &mut reader, "9", "runs.get", json!({ "runId": other_run }));
    assert_eq!(other_detail["run"]["status"], json!("completed"));

    let listed = request_ok(&mut stdin, &mut reader, "10", "runs.list", json!({ "limit": 10 }));
    let ids: Vec<&str> = listed["runs"]
        .as_array()
        .expect("runs")
        .iter()
        .filter_map(|r| r["id"].as_str())
        .collect();
    assert_eq!(ids, vec![run_id.as_str(), other_run.as_str()]);

    let bad_limit = request(&mut stdin, &mut reader, "11", "runs.list", json!({ "limit": 0 }));
    assert_eq!(error_code(&bad_limit), "bad_params");
}

#[test]
fn force_cancel_recovers_stuck_run_without_touching_records() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = open_workspace(&mut stdin, &mut reader, "transcriptd-run-cancel");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "runs.create",
        json!({ "fileName": "batch.zip", "sourceKind": "zip", "fileNames": ["1111111.csv", "2222222.csv"] }),
    );
    let run_id = created["run"]["id"].as_str().expect("run id").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "records.import",
        json!({ "data": transcript("CS"), "fileName": "1111111.csv", "runId": run_id }),
    );

    let cancelled = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "records.import",
        json!({ "action": "force_cancel", "runId": run_id }),
    );
    assert_eq!(cancelled, json!({ "success": true, "runId": run_id, "status": "cancelled" }));
    assert_eq!(record_count(&workspace), 2);

    let late = request(
        &mut stdin,
        &mut reader,
        "4",
        "records.import",
        json!({ "data": transcript("CS"), "fileName": "2222222.csv", "runId": run_id }),
    );
    assert_eq!(error_code(&late), "run_cancelled");
    assert_eq!(late.pointer("/error/details/runId"), Some(&json!(run_id)));
    assert_eq!(record_count(&workspace), 2);

    let detail = request_ok(&mut stdin, &mut reader, "5", "runs.get", json!({ "runId": run_id }));
    assert_eq!(detail["run"]["status"], json!("cancelled"));
    assert!(detail["run"]["completedAt"].is_string());
    let statuses: Vec<&str> = detail["files"]
        .as_array()
        .expect("files")
        .iter()
        .filter_map(|f| f["status"].as_str())
        .collect();
    assert_eq!(statuses, vec!["success", "cancelled"]);

    // Finalizing a cancelled run keeps it cancelled; cancelling again is safe.
    let finalized = request_ok(&mut stdin, &mut reader, "6", "runs.finalize", json!({ "runId": run_id }));
    assert_eq!(finalized["run"]["status"], json!("cancelled"));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "records.import",
        json!({ "action": "force_cancel", "runId": run_id }),
    );
    assert_eq!(again["status"], json!("cancelled"));

    // A cancelled run can still be rolled back; afterwards cancel is refused.
    let rolled = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "records.import",
        json!({ "action": "rollback", "runId": run_id }),
    );
    assert_eq!(rolled["deletedCount"], json!(2));
    let refused = request(
        &mut stdin,
        &mut reader,
        "9",
        "records.import",
        json!({ "action": "force_cancel", "runId": run_id }),
    );
    assert_eq!(error_code(&refused), "invalid_state");
}

#[test]
fn rollback_refuses_runs_still_processing() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _workspace = open_workspace(&mut stdin, &mut reader, "transcriptd-run-processing");
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "runs.create",
        json!({ "fileName": "a.csv", "sourceKind": "csv" }),
    );
    let run_id = created["run"]["id"].as_str().expect("run id").to_string();
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "records.import",
        json!({ "action": "rollback", "runId": run_id }),
    );
    assert_eq!(error_code(&resp), "invalid_state");

    let bad_kind = request(
        &mut stdin,
        &mut reader,
        "3",
        "runs.create",
        json!({ "fileName": "a.pdf", "sourceKind": "pdf" }),
    );
    assert_eq!(error_code(&bad_kind), "bad_params");
}
