use crate::db;
use crate::store::DEFAULT_BATCH_SIZE;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

pub const IMPORT_SECTION_KEY: &str = "setup.import";

const MAX_BATCH_SIZE: i64 = 1000;
const DEFAULT_COURSE_CREDITS: f64 = 3.0;

/// Import tunables stored under `setup.import`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSettings {
    pub batch_size: usize,
    pub default_course_credits: f64,
    pub use_filename_as_subject_id: bool,
    pub fallback_rollback: bool,
}

impl Default for ImportSettings {
    fn default() -> Self {
        ImportSettings {
            batch_size: DEFAULT_BATCH_SIZE,
            default_course_credits: DEFAULT_COURSE_CREDITS,
            use_filename_as_subject_id: true,
            fallback_rollback: true,
        }
    }
}

impl ImportSettings {
    fn from_value(v: &Value) -> Self {
        let d = ImportSettings::default();
        ImportSettings {
            batch_size: v
                .get("batchSize")
                .and_then(|x| x.as_i64())
                .map(|n| n.clamp(1, MAX_BATCH_SIZE) as usize)
                .unwrap_or(d.batch_size),
            default_course_credits: v
                .get("defaultCourseCredits")
                .and_then(|x| x.as_f64())
                .unwrap_or(d.default_course_credits),
            use_filename_as_subject_id: v
                .get("useFilenameAsSubjectId")
                .and_then(|x| x.as_bool())
                .unwrap_or(d.use_filename_as_subject_id),
            fallback_rollback: v
                .get("fallbackRollback")
                .and_then(|x| x.as_bool())
                .unwrap_or(d.fallback_rollback),
        }
    }
}

fn default_section() -> Value {
    json!({
        "batchSize": DEFAULT_BATCH_SIZE,
        "defaultCourseCredits": DEFAULT_COURSE_CREDITS,
        "useFilenameAsSubjectId": true,
        "fallbackRollback": true
    })
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_credits(v: &Value, key: &str) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !n.is_finite() || !(0.0..=100.0).contains(&n) {
        return Err(format!("{} must be in 0..=100", key));
    }
    Ok(n)
}

fn apply_field(obj: &mut Map<String, Value>, k: &str, v: &Value) -> Result<(), String> {
    match k {
        "batchSize" => {
            obj.insert(k.to_string(), Value::from(parse_i64_range(v, k, 1, MAX_BATCH_SIZE)?));
        }
        "defaultCourseCredits" => {
            obj.insert(k.to_string(), Value::from(parse_credits(v, k)?));
        }
        "useFilenameAsSubjectId" | "fallbackRollback" => {
            obj.insert(k.to_string(), Value::Bool(parse_bool(v, k)?));
        }
        _ => return Err(format!("unknown import field: {}", k)),
    }
    Ok(())
}

fn merge_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        apply_field(obj, k, v)?;
    }
    Ok(())
}

fn load_section(conn: &Connection) -> anyhow::Result<Value> {
    let mut current = default_section();
    let saved = db::settings_get_json(conn, IMPORT_SECTION_KEY)?;
    if let (Some(saved_obj), Some(obj)) = (
        saved.as_ref().and_then(|v| v.as_object()),
        current.as_object_mut(),
    ) {
        // Each saved key stands alone; a bad one keeps its default.
        for (k, v) in saved_obj {
            if let Err(e) = apply_field(obj, k, v) {
                warn!(key = %k, error = %e, "saved import setting ignored");
            }
        }
    }
    Ok(current)
}

pub fn load_import_settings(conn: &Connection) -> anyhow::Result<ImportSettings> {
    Ok(ImportSettings::from_value(&load_section(conn)?))
}

#[derive(Debug)]
pub enum UpdateError {
    Invalid(String),
    Store(anyhow::Error),
}

pub fn update_import_settings(
    conn: &Connection,
    patch: &Map<String, Value>,
) -> Result<ImportSettings, UpdateError> {
    let mut current = load_section(conn).map_err(UpdateError::Store)?;
    merge_patch(&mut current, patch).map_err(UpdateError::Invalid)?;
    db::settings_set_json(conn, IMPORT_SECTION_KEY, &current).map_err(UpdateError::Store)?;
    Ok(ImportSettings::from_value(&current))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::ensure_schema(&conn).expect("schema");
        conn
    }

    fn patch(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object")
    }

    #[test]
    fn defaults_apply_without_saved_section() {
        let conn = conn();
        let s = load_import_settings(&conn).expect("load");
        assert_eq!(s, ImportSettings::default());
        assert_eq!(s.batch_size, 100);
        assert_eq!(s.default_course_credits, 3.0);
    }

    #[test]
    fn update_merges_and_persists() {
        let conn = conn();
        let s = update_import_settings(&conn, &patch(json!({ "batchSize": 25, "fallbackRollback": false })))
            .expect("update");
        assert_eq!(s.batch_size, 25);
        assert!(!s.fallback_rollback);
        assert!(s.use_filename_as_subject_id);

        let reloaded = load_import_settings(&conn).expect("load");
        assert_eq!(reloaded, s);
    }

    #[test]
    fn update_rejects_unknown_keys_and_out_of_range_values() {
        let conn = conn();
        assert!(matches!(
            update_import_settings(&conn, &patch(json!({ "colour": "red" }))),
            Err(UpdateError::Invalid(m)) if m.contains("unknown import field")
        ));
        assert!(matches!(
            update_import_settings(&conn, &patch(json!({ "batchSize": 0 }))),
            Err(UpdateError::Invalid(_))
        ));
        assert!(matches!(
            update_import_settings(&conn, &patch(json!({ "useFilenameAsSubjectId": "yes" }))),
            Err(UpdateError::Invalid(_))
        ));
        assert_eq!(load_import_settings(&conn).expect("load"), ImportSettings::default());
    }

    #[test]
    fn saved_batch_size_is_clamped_on_load() {
        let conn = conn();
        db::settings_set_json(&conn, IMPORT_SECTION_KEY, &json!({ "batchSize": 5000 }))
            .expect("save");
        // Out-of-range saved value is ignored by the merge; default remains.
        assert_eq!(load_import_settings(&conn).expect("load").batch_size, 100);
        assert_eq!(
            ImportSettings::from_value(&json!({ "batchSize": 5000 })).batch_size,
            1000
        );
    }

    #[test]
    fn bad_saved_key_does_not_discard_the_others() {
        let conn = conn();
        db::settings_set_json(
            &conn,
            IMPORT_SECTION_KEY,
            &json!({
                "batchSize": 5000,
                "colour": "red",
                "defaultCourseCredits": 4.0,
                "fallbackRollback": false
            }),
        )
        .expect("save");
        let s = load_import_settings(&conn).expect("load");
        assert_eq!(s.batch_size, 100);
        assert_eq!(s.default_course_credits, 4.0);
        assert!(!s.fallback_rollback);
        assert!(s.use_filename_as_subject_id);
    }
}
