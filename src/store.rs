use crate::normalize::{RecordDraft, RAW_RUN_ID_KEY};
use anyhow::Context;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub created: usize,
    pub updated: usize,
}

/// Academic-record store seam. One `upsert_batch` call is atomic: it either
/// applies every draft or none.
pub trait RecordStore {
    fn upsert_batch(&mut self, batch: &[RecordDraft], now: &str) -> anyhow::Result<UpsertCounts>;

    /// Deletes records whose provenance names `run_id`.
    fn delete_by_run(&mut self, run_id: &str) -> anyhow::Result<usize>;

    /// Deletes records of `subject_ids` created inside `[from, to]`.
    fn delete_by_window(&mut self, subject_ids: &[String], from: &str, to: &str)
        -> anyhow::Result<usize>;
}

pub struct SqliteRecordStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteRecordStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        SqliteRecordStore { conn }
    }
}

const UPSERT_SQL: &str = "INSERT INTO academic_records(
        id, student_id, college, major, academic_year, semester,
        last_registration_semester, study_mode, permanent_status, semester_status,
        registered_hours_semester, completed_hours_semester, academic_warning,
        previous_academic_warning, cumulative_gpa_percent, cumulative_gpa_points,
        total_completed_hours, baccalaureate_type, baccalaureate_country,
        certificate_score, certificate_average, has_ministry_scholarship,
        course_code, course_name, course_credits, final_grade, letter_grade,
        grade_points, raw_data, created_at, updated_at
    ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(student_id, academic_year, semester, course_code) DO UPDATE SET
        college = excluded.college,
        major = excluded.major,
        last_registration_semester = excluded.last_registration_semester,
        study_mode = excluded.study_mode,
        permanent_status = excluded.permanent_status,
        semester_status = excluded.semester_status,
        registered_hours_semester = excluded.registered_hours_semester,
        completed_hours_semester = excluded.completed_hours_semester,
        academic_warning = excluded.academic_warning,
        previous_academic_warning = excluded.previous_academic_warning,
        cumulative_gpa_percent = excluded.cumulative_gpa_percent,
        cumulative_gpa_points = excluded.cumulative_gpa_points,
        total_completed_hours = excluded.total_completed_hours,
        baccalaureate_type = excluded.baccalaureate_type,
        baccalaureate_country = excluded.baccalaureate_country,
        certificate_score = excluded.certificate_score,
        certificate_average = excluded.certificate_average,
        has_ministry_scholarship = excluded.has_ministry_scholarship,
        course_name = excluded.course_name,
        course_credits = excluded.course_credits,
        final_grade = excluded.final_grade,
        letter_grade = excluded.letter_grade,
        grade_points = excluded.grade_points,
        raw_data = excluded.raw_data,
        updated_at = excluded.updated_at";

impl RecordStore for SqliteRecordStore<'_> {
    fn upsert_batch(&mut self, batch: &[RecordDraft], now: &str) -> anyhow::Result<UpsertCounts> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to open batch transaction")?;
        let mut counts = UpsertCounts::default();
        {
            let mut exists = tx.prepare_cached(
                "SELECT 1 FROM academic_records
                 WHERE student_id = ? AND academic_year = ? AND semester = ? AND course_code = ?",
            )?;
            let mut upsert = tx.prepare_cached(UPSERT_SQL)?;
            for d in batch {
                let found = exists
                    .query_row(
                        (&d.student_id, &d.academic_year, &d.semester, &d.course_code),
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                let raw_data = serde_json::to_string(&d.raw)?;
                upsert
                    .execute(params![
                        Uuid::new_v4().to_string(),
                        d.student_id,
                        d.college,
                        d.major,
                        d.academic_year,
                        d.semester,
                        d.last_registration_semester,
                        d.study_mode,
                        d.permanent_status,
                        d.semester_status,
                        d.registered_hours_semester,
                        d.completed_hours_semester,
                        d.academic_warning,
                        d.previous_academic_warning,
                        d.cumulative_gpa_percent,
                        d.cumulative_gpa_points,
                        d.total_completed_hours,
                        d.baccalaureate_type,
                        d.baccalaureate_country,
                        d.certificate_score,
                        d.certificate_average,
                        d.has_ministry_scholarship,
                        d.course_code,
                        d.course_name,
                        d.course_credits,
                        d.final_grade,
                        d.letter_grade,
                        d.grade_points,
                        raw_data,
                        now,
                        now,
                    ])
                    .with_context(|| {
                        format!(
                            "upsert failed for {} {} {} {}",
                            d.student_id, d.academic_year, d.semester, d.course_code
                        )
                    })?;
                if found {
                    counts.updated += 1;
                } else {
                    counts.created += 1;
                }
            }
        }
        tx.commit().context("failed to commit batch")?;
        Ok(counts)
    }

    fn delete_by_run(&mut self, run_id: &str) -> anyhow::Result<usize> {
        let sql = format!(
            "DELETE FROM academic_records WHERE json_extract(raw_data, '$.{}') = ?",
            RAW_RUN_ID_KEY
        );
        let n = self
            .conn
            .execute(&sql, [run_id])
            .context("provenance delete failed")?;
        Ok(n)
    }

    fn delete_by_window(
        &mut self,
        subject_ids: &[String],
        from: &str,
        to: &str,
    ) -> anyhow::Result<usize> {
        if subject_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; subject_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM academic_records
             WHERE student_id IN ({})
               AND created_at >= ?
               AND created_at <= ?",
            placeholders
        );
        let mut bind: Vec<&str> = subject_ids.iter().map(|s| s.as_str()).collect();
        bind.push(from);
        bind.push(to);
        let n = self
            .conn
            .execute(&sql, params_from_iter(bind))
            .context("window delete failed")?;
        Ok(n)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub upserted: usize,
    pub created: usize,
    pub updated: usize,
    pub batches_total: usize,
    pub batches_failed: usize,
    pub errors: Vec<String>,
}

impl BatchReport {
    pub fn all_failed(&self) -> bool {
        self.batches_total > 0 && self.batches_failed == self.batches_total
    }
}

/// Writes drafts in fixed-size batches. A failed batch is recorded and the
/// next batch still runs.
pub fn persist_drafts<S: RecordStore + ?Sized>(
    store: &mut S,
    drafts: &[RecordDraft],
    batch_size: usize,
    now: &str,
) -> BatchReport {
    let mut report = BatchReport::default();
    for (i, batch) in drafts.chunks(batch_size.max(1)).enumerate() {
        report.batches_total += 1;
        match store.upsert_batch(batch, now) {
            Ok(counts) => {
                report.created += counts.created;
                report.updated += counts.updated;
                report.upserted += counts.created + counts.updated;
            }
            Err(e) => {
                warn!(batch = i, rows = batch.len(), error = %format!("{e:#}"), "batch failed");
                report.batches_failed += 1;
                report.errors.push(format!("batch {}: {:#}", i + 1, e));
            }
        }
    }
    report
}
