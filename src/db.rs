use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "transcripts.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    ensure_schema(&conn)?;
    Ok(conn)
}

pub fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_roles(
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            PRIMARY KEY(user_id, role)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_runs(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            total_files INTEGER NOT NULL DEFAULT 0,
            succeeded_files INTEGER NOT NULL DEFAULT 0,
            failed_files INTEGER NOT NULL DEFAULT 0,
            skipped_files INTEGER NOT NULL DEFAULT 0,
            total_records INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT
        )",
        [],
    )?;
    ensure_import_runs_rolled_back_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_runs_created ON import_runs(created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_file_outcomes(
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            status TEXT NOT NULL,
            parsed_rows INTEGER NOT NULL DEFAULT 0,
            records_count INTEGER NOT NULL DEFAULT 0,
            duplicates_skipped INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            content_sha256 TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            FOREIGN KEY(run_id) REFERENCES import_runs(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_file_outcomes_run ON import_file_outcomes(run_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            college TEXT,
            major TEXT,
            academic_year TEXT NOT NULL,
            semester TEXT NOT NULL,
            last_registration_semester TEXT,
            study_mode TEXT,
            permanent_status TEXT,
            semester_status TEXT,
            registered_hours_semester REAL,
            completed_hours_semester REAL,
            academic_warning TEXT,
            previous_academic_warning TEXT,
            cumulative_gpa_percent REAL,
            cumulative_gpa_points REAL,
            total_completed_hours REAL,
            baccalaureate_type TEXT,
            baccalaureate_country TEXT,
            certificate_score REAL,
            certificate_average REAL,
            has_ministry_scholarship INTEGER NOT NULL DEFAULT 0,
            course_code TEXT NOT NULL,
            course_name TEXT NOT NULL,
            course_credits REAL,
            final_grade REAL,
            letter_grade TEXT,
            grade_points REAL,
            raw_data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(student_id, academic_year, semester, course_code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_academic_records_student ON academic_records(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_academic_records_created ON academic_records(created_at)",
        [],
    )?;

    Ok(())
}

// Workspaces created before rollback bookkeeping only had completed_at.
fn ensure_import_runs_rolled_back_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "import_runs", "rolled_back_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE import_runs ADD COLUMN rolled_back_at TEXT", [])?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent_and_settings_roundtrip() {
        let conn = Connection::open_in_memory().expect("open");
        ensure_schema(&conn).expect("schema");
        ensure_schema(&conn).expect("schema again");
        assert!(table_has_column(&conn, "import_runs", "rolled_back_at").expect("pragma"));

        assert!(settings_get_json(&conn, "setup.import").expect("get").is_none());
        settings_set_json(&conn, "setup.import", &serde_json::json!({ "batchSize": 7 }))
            .expect("set");
        settings_set_json(&conn, "setup.import", &serde_json::json!({ "batchSize": 9 }))
            .expect("overwrite");
        let v = settings_get_json(&conn, "setup.import")
            .expect("get")
            .expect("present");
        assert_eq!(v["batchSize"], 9);
    }
}
