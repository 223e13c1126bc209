use crate::columns::{ColumnMap, Field};
use std::collections::BTreeMap;

pub const UNKNOWN: &str = "Unknown";
pub const SUMMARY_SENTINEL: &str = "__SUMMARY__";

pub const RAW_RUN_ID_KEY: &str = "_import_run_id";
pub const RAW_FILE_NAME_KEY: &str = "_import_file_name";
pub const RAW_IMPORTED_AT_KEY: &str = "_imported_at";

const TRUTHY: [&str; 6] = ["true", "1", "yes", "y", "نعم", "صحيح"];

const SUMMARY_SIGNALS: [Field; 5] = [
    Field::RegisteredHoursSemester,
    Field::CompletedHoursSemester,
    Field::CumulativeGpaPercent,
    Field::CumulativeGpaPoints,
    Field::TotalCompletedHours,
];

/// Where a draft came from; copied into every draft's raw payload.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub run_id: String,
    pub file_name: String,
    pub imported_at: String,
}

/// Per-file inputs shared by every row of that file.
#[derive(Debug, Clone)]
pub struct RowContext<'a> {
    pub headers: &'a [String],
    pub columns: &'a ColumnMap,
    pub filename_subject_id: Option<&'a str>,
    pub default_course_credits: f64,
    pub provenance: &'a Provenance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    pub student_id: String,
    pub college: Option<String>,
    pub major: Option<String>,
    pub academic_year: String,
    pub semester: String,
    pub last_registration_semester: Option<String>,
    pub study_mode: Option<String>,
    pub permanent_status: Option<String>,
    pub semester_status: Option<String>,
    pub registered_hours_semester: Option<f64>,
    pub completed_hours_semester: Option<f64>,
    pub academic_warning: Option<String>,
    pub previous_academic_warning: Option<String>,
    pub cumulative_gpa_percent: Option<f64>,
    pub cumulative_gpa_points: Option<f64>,
    pub total_completed_hours: Option<f64>,
    pub baccalaureate_type: Option<String>,
    pub baccalaureate_country: Option<String>,
    pub certificate_score: Option<f64>,
    pub certificate_average: Option<f64>,
    pub has_ministry_scholarship: bool,
    pub course_code: String,
    pub course_name: String,
    pub course_credits: Option<f64>,
    pub final_grade: Option<f64>,
    pub letter_grade: Option<String>,
    pub grade_points: Option<f64>,
    pub raw: BTreeMap<String, String>,
}

impl RecordDraft {
    pub fn is_summary(&self) -> bool {
        self.course_code == SUMMARY_SENTINEL
    }

    /// The natural key the store enforces uniqueness on.
    pub fn natural_key(&self) -> (String, String, String, String) {
        (
            self.student_id.clone(),
            self.academic_year.clone(),
            self.semester.clone(),
            self.course_code.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoSubjectId,
    NoCourseOrSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Detail(RecordDraft),
    Summary(RecordDraft),
    Skipped(SkipReason),
}

impl Classified {
    pub fn into_draft(self) -> Option<RecordDraft> {
        match self {
            Classified::Detail(d) | Classified::Summary(d) => Some(d),
            Classified::Skipped(_) => None,
        }
    }
}

pub fn classify_row(row: &[String], ctx: &RowContext<'_>) -> Classified {
    let cols = ctx.columns;
    let text = |f: Field| non_empty(cols.cell(row, f));
    let number = |f: Field| clean_numeric(cols.cell(row, f));

    let student_id = match ctx.filename_subject_id {
        Some(id) => id.trim().to_string(),
        None => cols.cell(row, Field::StudentId).to_string(),
    };
    if student_id.is_empty() {
        return Classified::Skipped(SkipReason::NoSubjectId);
    }

    let code_raw = cols.cell(row, Field::CourseCode);
    let name_raw = cols.cell(row, Field::CourseName);
    let (semester, academic_year) = parse_semester_year(
        cols.cell(row, Field::Semester),
        cols.cell(row, Field::AcademicYear),
    );

    let registered_hours_semester = number(Field::RegisteredHoursSemester);
    let completed_hours_semester = number(Field::CompletedHoursSemester);
    let cumulative_gpa_percent = number(Field::CumulativeGpaPercent);
    let cumulative_gpa_points = number(Field::CumulativeGpaPoints);
    let total_completed_hours = number(Field::TotalCompletedHours);

    let has_course = !code_raw.is_empty() || !name_raw.is_empty();
    let has_summary_signal = SUMMARY_SIGNALS.iter().any(|f| number(*f).is_some());
    if !has_course && !has_summary_signal {
        return Classified::Skipped(SkipReason::NoCourseOrSummary);
    }
    let is_summary = !has_course;

    let (course_code, course_name) = if is_summary {
        (SUMMARY_SENTINEL.to_string(), SUMMARY_SENTINEL.to_string())
    } else {
        (
            non_empty(code_raw).unwrap_or_else(|| UNKNOWN.to_string()),
            non_empty(name_raw).unwrap_or_else(|| UNKNOWN.to_string()),
        )
    };
    let course_credits = if is_summary {
        Some(0.0)
    } else {
        Some(number(Field::CourseCredits).unwrap_or(ctx.default_course_credits))
    };
    let (final_grade, letter_grade, grade_points) = if is_summary {
        (None, None, None)
    } else {
        (
            number(Field::FinalGrade),
            text(Field::LetterGrade),
            number(Field::GradePoints),
        )
    };

    let draft = RecordDraft {
        student_id,
        college: text(Field::College),
        major: text(Field::Major),
        academic_year,
        semester,
        last_registration_semester: text(Field::LastRegistrationSemester),
        study_mode: text(Field::StudyMode),
        permanent_status: text(Field::PermanentStatus),
        semester_status: text(Field::SemesterStatus),
        registered_hours_semester,
        completed_hours_semester,
        academic_warning: text(Field::AcademicWarning),
        previous_academic_warning: text(Field::PreviousAcademicWarning),
        cumulative_gpa_percent,
        cumulative_gpa_points,
        total_completed_hours,
        baccalaureate_type: text(Field::BaccalaureateType),
        baccalaureate_country: text(Field::BaccalaureateCountry),
        certificate_score: number(Field::CertificateScore),
        certificate_average: number(Field::CertificateAverage),
        has_ministry_scholarship: clean_boolean(cols.cell(row, Field::HasMinistryScholarship)),
        course_code,
        course_name,
        course_credits,
        final_grade,
        letter_grade,
        grade_points,
        raw: raw_payload(row, ctx.headers, ctx.provenance),
    };

    if is_summary {
        Classified::Summary(draft)
    } else {
        Classified::Detail(draft)
    }
}

fn raw_payload(row: &[String], headers: &[String], prov: &Provenance) -> BTreeMap<String, String> {
    let mut raw = BTreeMap::new();
    for (i, h) in headers.iter().enumerate() {
        raw.insert(h.clone(), row.get(i).cloned().unwrap_or_default());
    }
    raw.insert(RAW_RUN_ID_KEY.to_string(), prov.run_id.clone());
    raw.insert(RAW_FILE_NAME_KEY.to_string(), prov.file_name.clone());
    raw.insert(RAW_IMPORTED_AT_KEY.to_string(), prov.imported_at.clone());
    raw
}

/// Leading run of 5–10 digits in the base name, e.g. "4220212.csv" or
/// "archive/4220212_transcript.xlsx".
pub fn subject_id_from_file_name(file_name: &str) -> Option<String> {
    let base = file_name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("");
    let digits: String = base.chars().take_while(|c| c.is_ascii_digit()).collect();
    if (5..=10).contains(&digits.len()) {
        Some(digits)
    } else if digits.len() > 10 {
        // A longer run still starts with a valid 10-digit prefix.
        Some(digits[..10].to_string())
    } else {
        None
    }
}

/// Splits free semester text and academic-year text into (semester label,
/// academic-year label). The semester column is searched for a `YYYY/YYYY`
/// token first, then the academic-year column.
pub fn parse_semester_year(raw_semester: &str, raw_academic_year: &str) -> (String, String) {
    let semester_text = collapse_whitespace(raw_semester);
    let year_text = collapse_whitespace(raw_academic_year);

    let (academic_year, semester) = match find_year_token(&semester_text) {
        Some((start, end)) => {
            let token = strip_spaces(&semester_text[start..end]);
            let rest = format!("{} {}", &semester_text[..start], &semester_text[end..]);
            (token, collapse_whitespace(&rest))
        }
        None => match find_year_token(&year_text) {
            Some((start, end)) => (strip_spaces(&year_text[start..end]), semester_text),
            None => (String::new(), semester_text),
        },
    };

    let semester = if semester.is_empty() {
        UNKNOWN.to_string()
    } else {
        semester
    };
    let academic_year = if academic_year.is_empty() {
        UNKNOWN.to_string()
    } else {
        academic_year
    };
    (semester, academic_year)
}

/// Byte range of the first `\d{4}\s*/\s*\d{4}` match.
fn find_year_token(s: &str) -> Option<(usize, usize)> {
    let bytes = s.as_bytes();
    let digits_at = |i: usize| i + 4 <= bytes.len() && bytes[i..i + 4].iter().all(u8::is_ascii_digit);
    let mut start = 0usize;
    while start + 4 <= bytes.len() {
        if digits_at(start) {
            let mut j = start + 4;
            while j < bytes.len() && bytes[j] == b' ' {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'/' {
                j += 1;
                while j < bytes.len() && bytes[j] == b' ' {
                    j += 1;
                }
                if digits_at(j) {
                    return Some((start, j + 4));
                }
            }
        }
        start += 1;
    }
    None
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_spaces(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Parses a numeric cell written with ASCII or Arabic digits and separators.
/// Empty, "-" and unparsable values are `None`, never zero.
pub fn clean_numeric(value: &str) -> Option<f64> {
    let t = value.trim();
    if t.is_empty() || t == "-" {
        return None;
    }
    let mut cleaned = String::with_capacity(t.len());
    for ch in t.chars() {
        match ch {
            ',' | '\u{066c}' => {}
            c if c.is_whitespace() => {}
            '\u{066b}' => cleaned.push('.'),
            '\u{0660}'..='\u{0669}' => {
                let d = ch as u32 - 0x0660;
                cleaned.push(char::from_digit(d, 10).unwrap_or('0'));
            }
            c => cleaned.push(c),
        }
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn clean_boolean(value: &str) -> bool {
    let lower = value.trim().to_lowercase();
    TRUTHY.contains(&lower.as_str())
}
