#![allow(dead_code)]

use base64::{engine::general_purpose, Engine as _};
use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const ADMIN: &str = "admin-1";
pub const DB_FILE_NAME: &str = "transcripts.sqlite3";

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_transcriptd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn transcriptd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn send(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    caller: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(c) = caller {
        payload["caller"] = json!(c);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

/// Sends as the admin caller.
pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    send(stdin, reader, id, method, Some(ADMIN), params)
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

pub fn error_code(value: &serde_json::Value) -> String {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false), "{}", value);
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("missing")
        .to_string()
}

pub fn grant_role(workspace: &Path, user: &str, role: &str) {
    let conn = Connection::open(workspace.join(DB_FILE_NAME)).expect("open workspace db");
    conn.execute(
        "INSERT OR IGNORE INTO user_roles(user_id, role) VALUES(?, ?)",
        (user, role),
    )
    .expect("grant role");
}

/// Selects a fresh workspace and makes `ADMIN` an administrator in it.
pub fn open_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> PathBuf {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    grant_role(&workspace, ADMIN, "admin");
    workspace
}

pub fn record_count(workspace: &Path) -> i64 {
    let conn = Connection::open(workspace.join(DB_FILE_NAME)).expect("open workspace db");
    conn.query_row("SELECT COUNT(*) FROM academic_records", [], |r| r.get(0))
        .expect("count records")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn column_letter(i: usize) -> String {
    let mut n = i + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    out.iter().rev().collect()
}

/// Minimal workbook: every cell is a shared string; empty cells are omitted.
pub fn build_workbook(rows: &[Vec<&str>], method: CompressionMethod) -> Vec<u8> {
    let mut shared: Vec<String> = Vec::new();
    let mut sheet_rows = String::new();
    for (r, row) in rows.iter().enumerate() {
        sheet_rows.push_str(&format!("<row r=\"{}\">", r + 1));
        for (c, cell) in row.iter().enumerate() {
            if cell.is_empty() {
                continue;
            }
            let idx = match shared.iter().position(|s| s == cell) {
                Some(i) => i,
                None => {
                    shared.push(cell.to_string());
                    shared.len() - 1
                }
            };
            sheet_rows.push_str(&format!(
                "<c r=\"{}{}\" t=\"s\"><v>{}</v></c>",
                column_letter(c),
                r + 1,
                idx
            ));
        }
        sheet_rows.push_str("</row>");
    }
    let sst: String = shared
        .iter()
        .map(|s| format!("<si><t>{}</t></si>", xml_escape(s)))
        .collect();
    let shared_xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><sst xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">{}</sst>",
        sst
    );
    let sheet_xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData>{}</sheetData></worksheet>",
        sheet_rows
    );

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = FileOptions::default().compression_method(method);
    zip.start_file("[Content_Types].xml", opts).expect("entry");
    zip.write_all(b"<Types/>").expect("write");
    zip.start_file("xl/sharedStrings.xml", opts).expect("entry");
    zip.write_all(shared_xml.as_bytes()).expect("write");
    zip.start_file("xl/worksheets/sheet1.xml", opts).expect("entry");
    zip.write_all(sheet_xml.as_bytes()).expect("write");
    zip.finish().expect("finish workbook").into_inner()
}

pub fn build_archive(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, body) in entries {
        zip.start_file(*name, opts).expect("entry");
        zip.write_all(body).expect("write");
    }
    zip.finish().expect("finish archive").into_inner()
}

pub fn to_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}
