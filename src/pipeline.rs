//! Text → deduplicated record drafts for one file.

use crate::columns::{ColumnMap, Field};
use crate::dedup::Deduplicator;
use crate::delimited::parse_table;
use crate::normalize::{classify_row, subject_id_from_file_name, Classified, Provenance, RecordDraft, RowContext};
use tracing::debug;

/// Subject id recorded on a file outcome when neither the file name nor the
/// data provides one.
pub const UNRESOLVED_SUBJECT: &str = "unknown";

#[derive(Debug, Clone, Copy)]
pub struct PrepareOptions {
    pub use_filename_as_subject_id: bool,
    pub default_course_credits: f64,
}

#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub headers: Vec<String>,
    pub parsed_rows: usize,
    pub drafts: Vec<RecordDraft>,
    pub duplicates_skipped: usize,
    pub skipped_rows: usize,
    pub filename_subject_id: Option<String>,
}

impl PreparedFile {
    /// File-level subject: the file name's id, else the first surviving
    /// draft's student id.
    pub fn subject_id(&self) -> String {
        self.filename_subject_id
            .clone()
            .or_else(|| self.drafts.first().map(|d| d.student_id.clone()))
            .unwrap_or_else(|| UNRESOLVED_SUBJECT.to_string())
    }
}

pub fn prepare(text: &str, file_name: &str, opts: PrepareOptions, provenance: &Provenance) -> PreparedFile {
    let table = parse_table(text);
    let filename_subject_id = if opts.use_filename_as_subject_id {
        subject_id_from_file_name(file_name)
    } else {
        None
    };

    let columns = ColumnMap::resolve(&table.headers);
    debug!(
        file = %file_name,
        delimiter = table.delimiter.as_str(),
        resolved = columns.resolved_count(),
        student_id_col = ?columns.get(Field::StudentId),
        course_code_col = ?columns.get(Field::CourseCode),
        "columns resolved"
    );

    let ctx = RowContext {
        headers: &table.headers,
        columns: &columns,
        filename_subject_id: filename_subject_id.as_deref(),
        default_course_credits: opts.default_course_credits,
        provenance,
    };

    let mut dedup = Deduplicator::new();
    let mut skipped_rows = 0usize;
    for row in &table.rows {
        match classify_row(row, &ctx) {
            Classified::Skipped(_) => skipped_rows += 1,
            other => {
                if let Some(draft) = other.into_draft() {
                    dedup.push(draft);
                }
            }
        }
    }
    let (drafts, duplicates_skipped) = dedup.finish();

    PreparedFile {
        parsed_rows: table.rows.len(),
        headers: table.headers,
        drafts,
        duplicates_skipped,
        skipped_rows,
        filename_subject_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::SUMMARY_SENTINEL;

    fn prov() -> Provenance {
        Provenance {
            run_id: "run-1".to_string(),
            file_name: "4220212.csv".to_string(),
            imported_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    fn opts(use_filename: bool) -> PrepareOptions {
        PrepareOptions {
            use_filename_as_subject_id: use_filename,
            default_course_credits: 3.0,
        }
    }

    const TEXT: &str = "student_id;semester;course_code;course_name;letter_grade;total_completed_hours\n\
        999;Fall 2023/2024;CS101;Intro;A;\n\
        999;Fall 2023/2024;CS101;Intro;;\n\
        999;Fall 2023/2024;;;;45\n\
        ;;;;;\n\
        999;Fall 2023/2024;;;;\n";

    #[test]
    fn filename_subject_overrides_column_and_duplicates_collapse() {
        let p = prepare(TEXT, "uploads/4220212.csv", opts(true), &prov());
        assert_eq!(p.parsed_rows, 4);
        assert_eq!(p.skipped_rows, 1);
        assert_eq!(p.duplicates_skipped, 1);
        assert_eq!(p.drafts.len(), 2);
        assert_eq!(p.subject_id(), "4220212");
        assert!(p.drafts.iter().all(|d| d.student_id == "4220212"));

        let detail = &p.drafts[0];
        assert_eq!(detail.letter_grade.as_deref(), Some("A"));
        assert_eq!(detail.academic_year, "2023/2024");
        assert_eq!(detail.semester, "Fall");

        let summary = &p.drafts[1];
        assert_eq!(summary.course_code, SUMMARY_SENTINEL);
        assert_eq!(summary.total_completed_hours, Some(45.0));
    }

    #[test]
    fn column_subject_used_when_filename_mode_is_off() {
        let p = prepare(TEXT, "4220212.csv", opts(false), &prov());
        assert_eq!(p.subject_id(), "999");
        assert!(p.filename_subject_id.is_none());
    }

    #[test]
    fn unresolvable_subject_reports_unknown() {
        let p = prepare("course_code\nCS101", "transcript.csv", opts(true), &prov());
        assert!(p.drafts.is_empty());
        assert_eq!(p.skipped_rows, 1);
        assert_eq!(p.subject_id(), UNRESOLVED_SUBJECT);
    }
}
