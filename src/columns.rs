//! Maps free-form (English or Arabic) spreadsheet headers onto the fixed set
//! of academic-record fields.

const FIELD_COUNT: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    StudentId,
    College,
    Major,
    AcademicYear,
    Semester,
    LastRegistrationSemester,
    StudyMode,
    PermanentStatus,
    SemesterStatus,
    RegisteredHoursSemester,
    CompletedHoursSemester,
    AcademicWarning,
    CumulativeGpaPercent,
    CumulativeGpaPoints,
    TotalCompletedHours,
    BaccalaureateType,
    BaccalaureateCountry,
    CertificateScore,
    CertificateAverage,
    PreviousAcademicWarning,
    RowNumber,
    CourseName,
    CourseCode,
    CourseCredits,
    FinalGrade,
    LetterGrade,
    GradePoints,
    HasMinistryScholarship,
}

impl Field {
    pub const ALL: [Field; FIELD_COUNT] = [
        Field::StudentId,
        Field::College,
        Field::Major,
        Field::AcademicYear,
        Field::Semester,
        Field::LastRegistrationSemester,
        Field::StudyMode,
        Field::PermanentStatus,
        Field::SemesterStatus,
        Field::RegisteredHoursSemester,
        Field::CompletedHoursSemester,
        Field::AcademicWarning,
        Field::CumulativeGpaPercent,
        Field::CumulativeGpaPoints,
        Field::TotalCompletedHours,
        Field::BaccalaureateType,
        Field::BaccalaureateCountry,
        Field::CertificateScore,
        Field::CertificateAverage,
        Field::PreviousAcademicWarning,
        Field::RowNumber,
        Field::CourseName,
        Field::CourseCode,
        Field::CourseCredits,
        Field::FinalGrade,
        Field::LetterGrade,
        Field::GradePoints,
        Field::HasMinistryScholarship,
    ];

    pub fn key(self) -> &'static str {
        self.synonyms()[0]
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Accepted header labels. The first entry is the canonical field key.
    pub fn synonyms(self) -> &'static [&'static str] {
        match self {
            Field::StudentId => &[
                "student_id",
                "رقم الطالب",
                "الرقم الجامعي",
                "رقم_الطالب",
                "id",
                "studentid",
            ],
            Field::College => &["college", "الكلية", "كلية", "الكليه"],
            Field::Major => &["major", "الاختصاص", "التخصص", "الفرع", "القسم"],
            Field::AcademicYear => &[
                "academic_year",
                "العام الدراسي",
                "السنة الدراسية",
                "year",
                "العام",
            ],
            Field::Semester => &[
                "semester",
                "الفصل الدراسي",
                "الفصل",
                "term",
                "الفصل الدراسى",
            ],
            Field::LastRegistrationSemester => &[
                "last_registration_semester",
                "آخر فصل تسجيل",
                "اخر فصل تسجيل",
                "آخر فصل",
            ],
            Field::StudyMode => &["study_mode", "نمط الدراسة", "نوع الدراسة", "نمط الدراسه"],
            Field::PermanentStatus => &[
                "permanent_status",
                "الحالة الدائمة",
                "حالة الطالب",
                "الحاله الدائمه",
            ],
            Field::SemesterStatus => &["semester_status", "حالة الفصل", "حاله الفصل"],
            Field::RegisteredHoursSemester => &[
                "registered_hours_semester",
                "الساعات المسجلة-فصل",
                "الساعات المسجلة",
                "الساعات المسجله فصل",
                "الساعات المسجله-فصل",
            ],
            Field::CompletedHoursSemester => &[
                "completed_hours_semester",
                "الساعات المنجزة-الفصل",
                "الساعات المنجزة",
                "الساعات المنجزه-الفصل",
                "الساعات المنجزه الفصل",
            ],
            Field::AcademicWarning => &[
                "academic_warning",
                "الإنذار الأكاديمي",
                "الانذار الاكاديمي",
                "انذار",
                "الإنذار",
                "الانذار",
            ],
            Field::CumulativeGpaPercent => &[
                "cumulative_gpa_percent",
                "المعدل التراكمي المئوي-نهاية",
                "المعدل التراكمي المئوي نهاية",
                "المعدل المئوي",
                "gpa_percent",
                "المعدل التراكمى المئوى-نهاية",
                "المعدل التراكمي المئوى نهايه",
            ],
            Field::CumulativeGpaPoints => &[
                "cumulative_gpa_points",
                "المعدل التراكمي النقطي-نهاية",
                "المعدل التراكمي النقطي نهاية",
                "المعدل النقطي",
                "gpa",
                "cumulative_gpa",
                "المعدل التراكمى النقطى-نهاية",
            ],
            Field::TotalCompletedHours => &[
                "total_completed_hours",
                "الساعات المنجزة-نهاية",
                "الساعات المنجزة نهاية",
                "اجمالي الساعات",
                "total_hours",
                "completed_hours",
                "الساعات المنجزه-نهاية",
                "الساعات المنجزه نهايه",
            ],
            Field::BaccalaureateType => &[
                "baccalaureate_type",
                "نوع البكالوريا",
                "نوع الشهادة",
                "نوع البكلوريا",
            ],
            Field::BaccalaureateCountry => &[
                "baccalaureate_country",
                "بلد البكالوريا",
                "بلد الشهادة",
                "بلد البكلوريا",
            ],
            Field::CertificateScore => &[
                "certificate_score",
                "علامة الشهادة",
                "درجة الشهادة",
                "علامه الشهاده",
            ],
            Field::CertificateAverage => &["certificate_average", "معدل الشهادة", "معدل الشهاده"],
            Field::PreviousAcademicWarning => &[
                "previous_academic_warning",
                "الإنذار الاكاديمي السابق",
                "الانذار الاكاديمي السابق",
                "الإنذار السابق",
            ],
            Field::RowNumber => &["row_number", "#", "رقم", "row"],
            Field::CourseName => &[
                "course_name",
                "اسم المقرر",
                "اسم المادة",
                "المقرر",
                "course",
                "coursename",
            ],
            Field::CourseCode => &[
                "course_code",
                "رمز المقرر",
                "كود المقرر",
                "رقم المقرر",
                "code",
                "رمز",
            ],
            Field::CourseCredits => &[
                "course_credits",
                "عدد الساعات",
                "الساعات",
                "credits",
                "hours",
                "عدد ساعات",
            ],
            Field::FinalGrade => &[
                "final_grade",
                "العلامة النهائية",
                "الدرجة النهائية",
                "العلامة",
                "grade",
                "mark",
                "العلامه النهائيه",
            ],
            Field::LetterGrade => &[
                "letter_grade",
                "الدرجة",
                "الدرجة الحرفية",
                "التقدير",
                "grade_letter",
                "الدرجه",
            ],
            Field::GradePoints => &["grade_points", "النقاط", "نقاط المقرر", "points", "النقط"],
            Field::HasMinistryScholarship => &[
                "has_ministry_scholarship",
                "لديه منحة وزارة",
                "منحة",
                "منحة وزارة",
                "لديه منحه وزاره",
            ],
        }
    }
}

/// Field → column index, built once per file and passed by reference to the
/// row stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    indices: [Option<usize>; FIELD_COUNT],
}

impl ColumnMap {
    pub fn resolve(headers: &[String]) -> Self {
        let normalized: Vec<String> = headers.iter().map(|h| normalize_label(h)).collect();
        let mut indices = [None; FIELD_COUNT];
        for field in Field::ALL {
            indices[field.index()] = find_column(&normalized, field);
        }
        ColumnMap { indices }
    }

    pub fn get(&self, field: Field) -> Option<usize> {
        self.indices[field.index()]
    }

    /// Trimmed cell for `field`, or "" when the column is absent or the row
    /// is short.
    pub fn cell<'r>(&self, row: &'r [String], field: Field) -> &'r str {
        self.get(field)
            .and_then(|i| row.get(i))
            .map(|s| s.trim())
            .unwrap_or("")
    }

    pub fn resolved_count(&self) -> usize {
        self.indices.iter().filter(|i| i.is_some()).count()
    }
}

fn normalize_label(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .collect()
}

// Exact matches are tried across every column before substring matches, so
// "course_code" next to "course_name" cannot capture the name field through
// the short "course" synonym.
fn find_column(normalized_headers: &[String], field: Field) -> Option<usize> {
    let names: Vec<String> = field.synonyms().iter().map(|s| normalize_label(s)).collect();
    let exact = normalized_headers
        .iter()
        .position(|h| !h.is_empty() && names.iter().any(|n| h == n));
    if exact.is_some() {
        return exact;
    }
    normalized_headers.iter().position(|h| {
        !h.is_empty()
            && names
                .iter()
                .any(|n| h.contains(n.as_str()) || n.contains(h.as_str()))
    })
}
