//! Audit rows for import runs and their per-file outcomes.

use crate::lifecycle::{FileStatus, RunStatus, SourceKind};
use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRun {
    pub id: String,
    pub user_id: String,
    pub file_name: String,
    pub source_kind: SourceKind,
    pub total_files: i64,
    pub succeeded_files: i64,
    pub failed_files: i64,
    pub skipped_files: i64,
    pub total_records: i64,
    pub status: RunStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub rolled_back_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub id: String,
    pub run_id: String,
    pub file_name: String,
    pub subject_id: String,
    pub status: FileStatus,
    pub parsed_rows: i64,
    pub records_count: i64,
    pub duplicates_skipped: i64,
    pub error_message: Option<String>,
    pub content_sha256: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Aggregate file counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub total_files: i64,
    pub succeeded_files: i64,
    pub failed_files: i64,
    pub skipped_files: i64,
    pub total_records: i64,
}

const RUN_COLUMNS: &str = "id, user_id, file_name, source_kind, total_files, succeeded_files,
    failed_files, skipped_files, total_records, status, created_at, completed_at, rolled_back_at";

const OUTCOME_COLUMNS: &str = "id, run_id, file_name, subject_id, status, parsed_rows,
    records_count, duplicates_skipped, error_message, content_sha256, created_at, completed_at";

fn bad_enum(col: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        format!("unknown value: {value}").into(),
    )
}

fn run_from_row(r: &Row<'_>) -> rusqlite::Result<ImportRun> {
    let kind: String = r.get(3)?;
    let status: String = r.get(9)?;
    Ok(ImportRun {
        id: r.get(0)?,
        user_id: r.get(1)?,
        file_name: r.get(2)?,
        source_kind: SourceKind::parse(&kind).ok_or_else(|| bad_enum(3, &kind))?,
        total_files: r.get(4)?,
        succeeded_files: r.get(5)?,
        failed_files: r.get(6)?,
        skipped_files: r.get(7)?,
        total_records: r.get(8)?,
        status: RunStatus::parse(&status).ok_or_else(|| bad_enum(9, &status))?,
        created_at: r.get(10)?,
        completed_at: r.get(11)?,
        rolled_back_at: r.get(12)?,
    })
}

fn outcome_from_row(r: &Row<'_>) -> rusqlite::Result<FileOutcome> {
    let status: String = r.get(4)?;
    Ok(FileOutcome {
        id: r.get(0)?,
        run_id: r.get(1)?,
        file_name: r.get(2)?,
        subject_id: r.get(3)?,
        status: FileStatus::parse(&status).ok_or_else(|| bad_enum(4, &status))?,
        parsed_rows: r.get(5)?,
        records_count: r.get(6)?,
        duplicates_skipped: r.get(7)?,
        error_message: r.get(8)?,
        content_sha256: r.get(9)?,
        created_at: r.get(10)?,
        completed_at: r.get(11)?,
    })
}

pub fn insert_run(conn: &Connection, run: &ImportRun) -> anyhow::Result<()> {
    conn.execute(
        &format!("INSERT INTO import_runs({RUN_COLUMNS}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"),
        rusqlite::params![
            run.id,
            run.user_id,
            run.file_name,
            run.source_kind.as_str(),
            run.total_files,
            run.succeeded_files,
            run.failed_files,
            run.skipped_files,
            run.total_records,
            run.status.as_str(),
            run.created_at,
            run.completed_at,
            run.rolled_back_at,
        ],
    )
    .context("failed to insert import run")?;
    Ok(())
}

pub fn update_run(conn: &Connection, run: &ImportRun) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE import_runs SET
            total_files = ?, succeeded_files = ?, failed_files = ?, skipped_files = ?,
            total_records = ?, status = ?, completed_at = ?, rolled_back_at = ?
         WHERE id = ?",
        rusqlite::params![
            run.total_files,
            run.succeeded_files,
            run.failed_files,
            run.skipped_files,
            run.total_records,
            run.status.as_str(),
            run.completed_at,
            run.rolled_back_at,
            run.id,
        ],
    )
    .context("failed to update import run")?;
    Ok(())
}

pub fn get_run(conn: &Connection, run_id: &str) -> anyhow::Result<Option<ImportRun>> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM import_runs WHERE id = ?"),
            [run_id],
            run_from_row,
        )
        .optional()
        .context("failed to load import run")?;
    Ok(run)
}

/// Newest first.
pub fn list_runs(conn: &Connection, limit: usize) -> anyhow::Result<Vec<ImportRun>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM import_runs ORDER BY created_at DESC, rowid DESC LIMIT ?"
    ))?;
    let rows = stmt
        .query_map([limit as i64], run_from_row)?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to list import runs")?;
    Ok(rows)
}

pub fn insert_outcome(conn: &Connection, o: &FileOutcome) -> anyhow::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO import_file_outcomes({OUTCOME_COLUMNS}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        rusqlite::params![
            o.id,
            o.run_id,
            o.file_name,
            o.subject_id,
            o.status.as_str(),
            o.parsed_rows,
            o.records_count,
            o.duplicates_skipped,
            o.error_message,
            o.content_sha256,
            o.created_at,
            o.completed_at,
        ],
    )
    .context("failed to insert file outcome")?;
    Ok(())
}

pub fn update_outcome(conn: &Connection, o: &FileOutcome) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE import_file_outcomes SET
            subject_id = ?, status = ?, parsed_rows = ?, records_count = ?,
            duplicates_skipped = ?, error_message = ?, content_sha256 = ?, completed_at = ?
         WHERE id = ?",
        rusqlite::params![
            o.subject_id,
            o.status.as_str(),
            o.parsed_rows,
            o.records_count,
            o.duplicates_skipped,
            o.error_message,
            o.content_sha256,
            o.completed_at,
            o.id,
        ],
    )
    .context("failed to update file outcome")?;
    Ok(())
}

/// Oldest still-pending outcome registered for `file_name` in the run.
pub fn pending_outcome(
    conn: &Connection,
    run_id: &str,
    file_name: &str,
) -> anyhow::Result<Option<FileOutcome>> {
    let o = conn
        .query_row(
            &format!(
                "SELECT {OUTCOME_COLUMNS} FROM import_file_outcomes
                 WHERE run_id = ? AND file_name = ? AND status = ?
                 ORDER BY created_at, rowid LIMIT 1"
            ),
            (run_id, file_name, FileStatus::Pending.as_str()),
            outcome_from_row,
        )
        .optional()
        .context("failed to load pending file outcome")?;
    Ok(o)
}

pub fn outcome_exists(conn: &Connection, run_id: &str, file_name: &str) -> anyhow::Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM import_file_outcomes WHERE run_id = ? AND file_name = ? LIMIT 1",
            (run_id, file_name),
            |_| Ok(()),
        )
        .optional()
        .context("failed to look up file outcome")?;
    Ok(found.is_some())
}

pub fn list_outcomes(conn: &Connection, run_id: &str) -> anyhow::Result<Vec<FileOutcome>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OUTCOME_COLUMNS} FROM import_file_outcomes
         WHERE run_id = ? ORDER BY created_at, rowid"
    ))?;
    let rows = stmt
        .query_map([run_id], outcome_from_row)?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to list file outcomes")?;
    Ok(rows)
}

pub fn count_outcomes(outcomes: &[FileOutcome]) -> RunCounts {
    let mut c = RunCounts {
        total_files: outcomes.len() as i64,
        ..RunCounts::default()
    };
    for o in outcomes {
        match o.status {
            FileStatus::Success => c.succeeded_files += 1,
            FileStatus::Failed => c.failed_files += 1,
            FileStatus::Skipped => c.skipped_files += 1,
            _ => {}
        }
        c.total_records += o.records_count;
    }
    c
}

/// Distinct resolved subject ids recorded for the run.
pub fn subject_ids_for_run(conn: &Connection, run_id: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT subject_id FROM import_file_outcomes
         WHERE run_id = ? AND subject_id <> ? ORDER BY subject_id",
    )?;
    let ids = stmt
        .query_map((run_id, crate::pipeline::UNRESOLVED_SUBJECT), |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()
        .context("failed to list run subjects")?;
    Ok(ids)
}
