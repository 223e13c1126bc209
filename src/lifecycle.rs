//! Import runs: state machines, the per-file pipeline, finalize, force-cancel,
//! rollback and archive import.

use crate::archive::{read_import_archive, FilePayload};
use crate::error::{PipelineError, PipelineResult};
use crate::normalize::Provenance;
use crate::pipeline::{prepare, PrepareOptions, UNRESOLVED_SUBJECT};
use crate::runlog::{self, now_timestamp, FileOutcome, ImportRun};
use crate::setup::ImportSettings;
use crate::store::{persist_drafts, RecordStore, SqliteRecordStore};
use crate::xlsx;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Csv,
    Xlsx,
    Zip,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Csv => "csv",
            SourceKind::Xlsx => "xlsx",
            SourceKind::Zip => "zip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "text" => Some(SourceKind::Csv),
            "xlsx" | "xls" | "workbook" => Some(SourceKind::Xlsx),
            "zip" => Some(SourceKind::Zip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Cancelled,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Start,
    Finish { failed_files: i64 },
    ForceCancel,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply {event} to a {from} {subject}")]
pub struct InvalidTransition {
    pub subject: &'static str,
    pub from: &'static str,
    pub event: &'static str,
}

impl RunEvent {
    fn name(self) -> &'static str {
        match self {
            RunEvent::Start => "start",
            RunEvent::Finish { .. } => "finish",
            RunEvent::ForceCancel => "force_cancel",
            RunEvent::Rollback => "rollback",
        }
    }
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Cancelled => "cancelled",
            RunStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "processing" => Some(RunStatus::Processing),
            "completed" => Some(RunStatus::Completed),
            "completed_with_errors" => Some(RunStatus::CompletedWithErrors),
            "cancelled" => Some(RunStatus::Cancelled),
            "rolled_back" => Some(RunStatus::RolledBack),
            _ => None,
        }
    }

    pub fn apply(self, event: RunEvent) -> Result<RunStatus, InvalidTransition> {
        use RunStatus::*;
        let finished = |failed: i64| if failed > 0 { CompletedWithErrors } else { Completed };
        match (self, event) {
            (Pending, RunEvent::Start) => Ok(Processing),
            (Processing | Completed | CompletedWithErrors, RunEvent::Finish { failed_files }) => {
                Ok(finished(failed_files))
            }
            (Cancelled, RunEvent::Finish { .. }) => Ok(Cancelled),
            (RolledBack, RunEvent::ForceCancel) => Err(self.invalid(event)),
            (_, RunEvent::ForceCancel) => Ok(Cancelled),
            (Completed | CompletedWithErrors | Cancelled | RolledBack, RunEvent::Rollback) => {
                Ok(RolledBack)
            }
            _ => Err(self.invalid(event)),
        }
    }

    fn invalid(self, event: RunEvent) -> InvalidTransition {
        InvalidTransition {
            subject: "run",
            from: self.as_str(),
            event: event.name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Importing,
    Success,
    Failed,
    Skipped,
    Cancelled,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Begin,
    Succeed,
    Fail,
    Skip,
    Cancel,
    Rollback,
}

impl FileEvent {
    fn name(self) -> &'static str {
        match self {
            FileEvent::Begin => "begin",
            FileEvent::Succeed => "succeed",
            FileEvent::Fail => "fail",
            FileEvent::Skip => "skip",
            FileEvent::Cancel => "cancel",
            FileEvent::Rollback => "rollback",
        }
    }
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Importing => "importing",
            FileStatus::Success => "success",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
            FileStatus::Cancelled => "cancelled",
            FileStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "importing" => Some(FileStatus::Importing),
            "success" => Some(FileStatus::Success),
            "failed" => Some(FileStatus::Failed),
            "skipped" => Some(FileStatus::Skipped),
            "cancelled" => Some(FileStatus::Cancelled),
            "rolled_back" => Some(FileStatus::RolledBack),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, FileStatus::Pending | FileStatus::Importing)
    }

    pub fn apply(self, event: FileEvent) -> Result<FileStatus, InvalidTransition> {
        use FileStatus::*;
        match (self, event) {
            (Pending, FileEvent::Begin) => Ok(Importing),
            (Importing, FileEvent::Succeed) => Ok(Success),
            (Importing, FileEvent::Fail) => Ok(Failed),
            (Importing, FileEvent::Skip) => Ok(Skipped),
            (Pending | Importing, FileEvent::Cancel) => Ok(Cancelled),
            (s, FileEvent::Cancel) => Ok(s),
            (_, FileEvent::Rollback) => Ok(RolledBack),
            _ => Err(InvalidTransition {
                subject: "file",
                from: self.as_str(),
                event: event.name(),
            }),
        }
    }
}

impl From<InvalidTransition> for PipelineError {
    fn from(e: InvalidTransition) -> Self {
        PipelineError::InvalidState(e.to_string())
    }
}

/// Source content for one file.
#[derive(Debug, Clone)]
pub enum FileData {
    Text(String),
    Workbook(Vec<u8>),
}

impl FileData {
    fn kind(&self) -> SourceKind {
        match self {
            FileData::Text(_) => SourceKind::Csv,
            FileData::Workbook(_) => SourceKind::Xlsx,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            FileData::Text(t) => t.as_bytes(),
            FileData::Workbook(b) => b,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRequest {
    pub file_name: String,
    pub data: Option<FileData>,
    pub run_id: Option<String>,
    pub use_filename_as_subject_id: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub success: bool,
    pub run_id: String,
    pub file_name: String,
    pub subject_id: String,
    pub status: FileStatus,
    pub parsed_row_count: usize,
    pub total_record_count: usize,
    pub inserted_count: usize,
    pub created_count: usize,
    pub updated_count: usize,
    pub duplicates_skipped_count: usize,
    pub skipped_row_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileReport {
    fn empty(run_id: &str, file_name: &str, subject_id: &str, status: FileStatus) -> Self {
        FileReport {
            success: false,
            run_id: run_id.to_string(),
            file_name: file_name.to_string(),
            subject_id: subject_id.to_string(),
            status,
            parsed_row_count: 0,
            total_record_count: 0,
            inserted_count: 0,
            created_count: 0,
            updated_count: 0,
            duplicates_skipped_count: 0,
            skipped_row_count: 0,
            errors: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub success: bool,
    pub deleted_count: usize,
    pub run_id: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveReport {
    pub success: bool,
    pub run: ImportRun,
    pub files: Vec<FileReport>,
}

const MSG_DATA_REQUIRED: &str = "CSV or Excel data is required";
const MSG_NO_ROWS: &str = "No valid rows found";
const MSG_NO_SUBJECT: &str = "No records with valid subject identifier";
const MSG_RUN_CANCELLED: &str = "Run was cancelled";

/// Drives runs against one workspace connection and record store.
pub struct Importer<'c, S: RecordStore> {
    conn: &'c Connection,
    store: S,
    settings: ImportSettings,
}

impl<'c> Importer<'c, SqliteRecordStore<'c>> {
    pub fn sqlite(conn: &'c Connection, settings: ImportSettings) -> Self {
        Importer::with_store(conn, SqliteRecordStore::new(conn), settings)
    }
}

impl<'c, S: RecordStore> Importer<'c, S> {
    pub fn with_store(conn: &'c Connection, store: S, settings: ImportSettings) -> Self {
        Importer {
            conn,
            store,
            settings,
        }
    }

    fn load_run(&self, run_id: &str) -> PipelineResult<ImportRun> {
        runlog::get_run(self.conn, run_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("import run not found: {run_id}")))
    }

    pub fn create_run(
        &mut self,
        user_id: &str,
        file_name: &str,
        kind: SourceKind,
        pending_file_names: &[String],
    ) -> PipelineResult<ImportRun> {
        let now = now_timestamp();
        let run = ImportRun {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            file_name: file_name.to_string(),
            source_kind: kind,
            total_files: pending_file_names.len() as i64,
            succeeded_files: 0,
            failed_files: 0,
            skipped_files: 0,
            total_records: 0,
            status: RunStatus::Pending.apply(RunEvent::Start)?,
            created_at: now.clone(),
            completed_at: None,
            rolled_back_at: None,
        };
        runlog::insert_run(self.conn, &run)?;
        for name in pending_file_names {
            runlog::insert_outcome(self.conn, &self.new_outcome(&run.id, name, &now))?;
        }
        info!(run_id = %run.id, kind = kind.as_str(), files = pending_file_names.len(), "import run created");
        Ok(run)
    }

    fn new_outcome(&self, run_id: &str, file_name: &str, now: &str) -> FileOutcome {
        FileOutcome {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            file_name: file_name.to_string(),
            subject_id: UNRESOLVED_SUBJECT.to_string(),
            status: FileStatus::Pending,
            parsed_rows: 0,
            records_count: 0,
            duplicates_skipped: 0,
            error_message: None,
            content_sha256: None,
            created_at: now.to_string(),
            completed_at: None,
        }
    }

    /// The registered pending outcome for this file, or a fresh one.
    fn claim_outcome(&self, run_id: &str, file_name: &str) -> PipelineResult<FileOutcome> {
        if let Some(o) = runlog::pending_outcome(self.conn, run_id, file_name)? {
            return Ok(o);
        }
        let o = self.new_outcome(run_id, file_name, &now_timestamp());
        runlog::insert_outcome(self.conn, &o)?;
        Ok(o)
    }

    fn close_outcome(
        &self,
        outcome: &mut FileOutcome,
        event: FileEvent,
        message: Option<String>,
    ) -> PipelineResult<()> {
        outcome.status = outcome.status.apply(event)?;
        outcome.error_message = message;
        outcome.completed_at = Some(now_timestamp());
        runlog::update_outcome(self.conn, outcome)?;
        Ok(())
    }

    /// Runs one file through decode, parse, classify, dedup and persist.
    ///
    /// Without a run id the file gets its own run, finalized before return.
    /// Every terminal outcome is written before this returns, including on
    /// error.
    pub fn import_file(&mut self, user_id: &str, req: FileRequest) -> PipelineResult<FileReport> {
        if req.run_id.is_none() && req.data.is_none() {
            return Err(PipelineError::BadInput(MSG_DATA_REQUIRED.to_string()));
        }
        let (run, owns_run) = match req.run_id.as_deref() {
            Some(id) => (self.load_run(id)?, false),
            None => {
                let kind = req.data.as_ref().map(FileData::kind).unwrap_or(SourceKind::Csv);
                (self.create_run(user_id, &req.file_name, kind, &[])?, true)
            }
        };

        match run.status {
            RunStatus::Processing => {}
            RunStatus::Cancelled => {
                // Force-cancel already closed registered outcomes; only an
                // unregistered file needs a record of its own.
                if !runlog::outcome_exists(self.conn, &run.id, &req.file_name)? {
                    let mut outcome = self.claim_outcome(&run.id, &req.file_name)?;
                    self.close_outcome(&mut outcome, FileEvent::Cancel, Some(MSG_RUN_CANCELLED.to_string()))?;
                }
                info!(run_id = %run.id, file = %req.file_name, "file skipped: run cancelled");
                return Err(PipelineError::RunCancelled { run_id: run.id });
            }
            other => {
                return Err(PipelineError::InvalidState(format!(
                    "run {} is {}, not processing",
                    run.id,
                    other.as_str()
                )));
            }
        }

        let result = self.import_into_run(&run, &req);
        if owns_run {
            self.finalize_run(&run.id)?;
        }
        result
    }

    fn import_into_run(&mut self, run: &ImportRun, req: &FileRequest) -> PipelineResult<FileReport> {
        let file_name = req.file_name.as_str();
        let mut outcome = self.claim_outcome(&run.id, file_name)?;
        outcome.status = outcome.status.apply(FileEvent::Begin)?;
        runlog::update_outcome(self.conn, &outcome)?;

        let Some(data) = req.data.as_ref() else {
            self.close_outcome(&mut outcome, FileEvent::Fail, Some(MSG_DATA_REQUIRED.to_string()))?;
            return Err(PipelineError::BadInput(MSG_DATA_REQUIRED.to_string()));
        };
        outcome.content_sha256 = Some(format!("{:x}", Sha256::digest(data.bytes())));

        let text = match data {
            FileData::Text(t) => t.clone(),
            FileData::Workbook(bytes) => match xlsx::workbook_to_csv(bytes) {
                Ok(t) => t,
                Err(source) => {
                    warn!(run_id = %run.id, file = %file_name, error = %source, "workbook decode failed");
                    self.close_outcome(&mut outcome, FileEvent::Fail, Some(source.to_string()))?;
                    return Err(PipelineError::Decode {
                        file_name: file_name.to_string(),
                        source,
                    });
                }
            },
        };

        let now = now_timestamp();
        let provenance = Provenance {
            run_id: run.id.clone(),
            file_name: file_name.to_string(),
            imported_at: now.clone(),
        };
        let opts = PrepareOptions {
            use_filename_as_subject_id: req
                .use_filename_as_subject_id
                .unwrap_or(self.settings.use_filename_as_subject_id),
            default_course_credits: self.settings.default_course_credits,
        };
        let prepared = prepare(&text, file_name, opts, &provenance);
        let subject_id = prepared.subject_id();

        outcome.subject_id = subject_id.clone();
        outcome.parsed_rows = prepared.parsed_rows as i64;
        outcome.duplicates_skipped = prepared.duplicates_skipped as i64;

        let mut report = FileReport::empty(&run.id, file_name, &subject_id, FileStatus::Skipped);
        report.parsed_row_count = prepared.parsed_rows;
        report.skipped_row_count = prepared.skipped_rows;
        report.duplicates_skipped_count = prepared.duplicates_skipped;
        report.total_record_count = prepared.drafts.len();

        let skip_reason = if prepared.parsed_rows == 0 {
            Some(MSG_NO_ROWS)
        } else if prepared.drafts.is_empty() {
            Some(MSG_NO_SUBJECT)
        } else {
            None
        };
        if let Some(reason) = skip_reason {
            self.close_outcome(&mut outcome, FileEvent::Skip, Some(reason.to_string()))?;
            info!(run_id = %run.id, file = %file_name, reason, "file skipped");
            report.error = Some(reason.to_string());
            return Ok(report);
        }

        let batches = persist_drafts(&mut self.store, &prepared.drafts, self.settings.batch_size, &now);
        outcome.records_count = batches.upserted as i64;
        let message = if batches.errors.is_empty() {
            None
        } else {
            Some(batches.errors.join("; "))
        };
        let event = if batches.all_failed() {
            FileEvent::Fail
        } else {
            FileEvent::Succeed
        };
        self.close_outcome(&mut outcome, event, message)?;

        info!(
            run_id = %run.id,
            file = %file_name,
            subject_id = %subject_id,
            parsed = prepared.parsed_rows,
            records = prepared.drafts.len(),
            upserted = batches.upserted,
            created = batches.created,
            updated = batches.updated,
            duplicates = prepared.duplicates_skipped,
            failed_batches = batches.batches_failed,
            "file imported"
        );

        report.status = outcome.status;
        report.success = batches.errors.is_empty() || batches.upserted > 0;
        report.inserted_count = batches.upserted;
        report.created_count = batches.created;
        report.updated_count = batches.updated;
        report.errors = batches.errors;
        Ok(report)
    }

    /// Recomputes counts from the recorded outcomes and applies Finish.
    pub fn finalize_run(&mut self, run_id: &str) -> PipelineResult<ImportRun> {
        let mut run = self.load_run(run_id)?;
        let outcomes = runlog::list_outcomes(self.conn, run_id)?;
        let counts = runlog::count_outcomes(&outcomes);
        run.status = run.status.apply(RunEvent::Finish {
            failed_files: counts.failed_files,
        })?;
        run.total_files = counts.total_files;
        run.succeeded_files = counts.succeeded_files;
        run.failed_files = counts.failed_files;
        run.skipped_files = counts.skipped_files;
        run.total_records = counts.total_records;
        if run.completed_at.is_none() || run.status != RunStatus::Cancelled {
            run.completed_at = Some(now_timestamp());
        }
        runlog::update_run(self.conn, &run)?;
        info!(
            run_id = %run.id,
            status = run.status.as_str(),
            files = run.total_files,
            failed = run.failed_files,
            records = run.total_records,
            "import run finalized"
        );
        Ok(run)
    }

    /// Moves the run to cancelled. Outcomes still pending or importing are
    /// cancelled too; persisted records are not touched.
    pub fn force_cancel(&mut self, run_id: &str) -> PipelineResult<ImportRun> {
        let mut run = self.load_run(run_id)?;
        run.status = run.status.apply(RunEvent::ForceCancel)?;
        let now = now_timestamp();
        run.completed_at = Some(now.clone());
        runlog::update_run(self.conn, &run)?;

        let mut cancelled = 0usize;
        for mut o in runlog::list_outcomes(self.conn, run_id)? {
            if o.status.is_terminal() {
                continue;
            }
            o.status = o.status.apply(FileEvent::Cancel)?;
            o.completed_at = Some(now.clone());
            runlog::update_outcome(self.conn, &o)?;
            cancelled += 1;
        }
        info!(run_id = %run.id, cancelled_files = cancelled, "import run force-cancelled");
        Ok(run)
    }

    /// Deletes the run's records and marks it rolled back. Safe to repeat.
    pub fn rollback(&mut self, run_id: &str) -> PipelineResult<RollbackReport> {
        let mut run = self.load_run(run_id)?;
        let next = run.status.apply(RunEvent::Rollback)?;

        let deleted = match self.store.delete_by_run(run_id) {
            Ok(n) => n,
            Err(e) if self.settings.fallback_rollback => {
                let subjects = runlog::subject_ids_for_run(self.conn, run_id)?;
                let to = run.completed_at.clone().unwrap_or_else(now_timestamp);
                warn!(
                    run_id,
                    error = %format!("{e:#}"),
                    subjects = subjects.len(),
                    "provenance delete failed; deleting by subject and time window"
                );
                self.store
                    .delete_by_window(&subjects, &run.created_at, &to)?
            }
            Err(e) => return Err(PipelineError::Store(e)),
        };

        let now = now_timestamp();
        run.status = next;
        if run.rolled_back_at.is_none() {
            run.rolled_back_at = Some(now.clone());
        }
        runlog::update_run(self.conn, &run)?;
        for mut o in runlog::list_outcomes(self.conn, run_id)? {
            if o.status == FileStatus::RolledBack {
                continue;
            }
            o.status = o.status.apply(FileEvent::Rollback)?;
            runlog::update_outcome(self.conn, &o)?;
        }
        info!(run_id, deleted, "import run rolled back");
        Ok(RollbackReport {
            success: true,
            deleted_count: deleted,
            run_id: run.id,
            file_name: run.file_name,
        })
    }

    /// Imports every source file of a zip in order under one run.
    pub fn import_archive(
        &mut self,
        user_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> PipelineResult<ArchiveReport> {
        let entries = read_import_archive(bytes).map_err(|source| PipelineError::Decode {
            file_name: file_name.to_string(),
            source,
        })?;
        let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        let run = self.create_run(user_id, file_name, SourceKind::Zip, &names)?;

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let data = match entry.payload {
                FilePayload::Text(t) => FileData::Text(t),
                FilePayload::Workbook(b) => FileData::Workbook(b),
            };
            let req = FileRequest {
                file_name: entry.name.clone(),
                data: Some(data),
                run_id: Some(run.id.clone()),
                use_filename_as_subject_id: None,
            };
            match self.import_file(user_id, req) {
                Ok(report) => files.push(report),
                Err(PipelineError::RunCancelled { .. }) => {
                    info!(run_id = %run.id, "archive import stopped: run cancelled");
                    break;
                }
                Err(e @ (PipelineError::Store(_) | PipelineError::NotFound(_))) => return Err(e),
                Err(e) => {
                    let mut report = FileReport::empty(&run.id, &entry.name, UNRESOLVED_SUBJECT, FileStatus::Failed);
                    report.error = Some(e.to_string());
                    files.push(report);
                }
            }
        }

        let run = self.finalize_run(&run.id)?;
        Ok(ArchiveReport {
            success: run.status == RunStatus::Completed,
            run,
            files,
        })
    }

    pub fn run_with_outcomes(&self, run_id: &str) -> PipelineResult<(ImportRun, Vec<FileOutcome>)> {
        let run = self.load_run(run_id)?;
        let outcomes = runlog::list_outcomes(self.conn, run_id)?;
        Ok((run, outcomes))
    }
}
