//! Reads a zip of source files uploaded as one import.

use crate::xlsx::DecodeError;
use std::io::{Cursor, Read};
use tracing::warn;
use zip::ZipArchive;

const MACOS_METADATA_DIR: &str = "__MACOSX/";

#[derive(Debug, Clone, PartialEq)]
pub enum FilePayload {
    Text(String),
    Workbook(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveFile {
    pub name: String,
    pub payload: FilePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Delimited,
    Spreadsheet,
}

fn entry_kind(name: &str) -> Option<EntryKind> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".csv") || lower.ends_with(".tsv") || lower.ends_with(".txt") {
        Some(EntryKind::Delimited)
    } else if lower.ends_with(".xlsx") {
        Some(EntryKind::Spreadsheet)
    } else {
        None
    }
}

/// Source files in archive order. Directories, macOS resource forks and
/// unsupported extensions are left out. Legacy binary `.xls` workbooks count
/// as unsupported.
pub fn read_import_archive(bytes: &[u8]) -> Result<Vec<ArchiveFile>, DecodeError> {
    if !crate::xlsx::looks_like_zip(bytes) {
        return Err(DecodeError::NotAnArchive);
    }
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| DecodeError::Archive(e.to_string()))?;

    let mut out = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| DecodeError::Archive(e.to_string()))?;
        let name = entry.name().to_string();
        if entry.is_dir() || name.starts_with(MACOS_METADATA_DIR) {
            continue;
        }
        let Some(kind) = entry_kind(&name) else {
            warn!(entry = %name, "archive entry skipped: unsupported type");
            continue;
        };

        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|_| DecodeError::Truncated {
                entry: name.clone(),
            })?;
        let payload = match kind {
            EntryKind::Delimited => FilePayload::Text(String::from_utf8_lossy(&buf).to_string()),
            EntryKind::Spreadsheet => FilePayload::Workbook(buf),
        };
        out.push(ArchiveFile { name, payload });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    fn build(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, body) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, opts).expect("add dir");
                continue;
            }
            zip.start_file(*name, opts).expect("start entry");
            zip.write_all(body.as_bytes()).expect("write entry");
        }
        zip.finish().expect("finish zip").into_inner()
    }

    #[test]
    fn keeps_supported_entries_in_order() {
        let bytes = build(&[
            ("grades/", ""),
            ("grades/4220212.csv", "course_code\nCS101"),
            ("__MACOSX/grades/._4220212.csv", "junk"),
            ("readme.md", "notes"),
            ("grades/legacy.xls", "\u{d0}\u{cf}"),
            ("grades/4220213.XLSX", "PK\x03\x04"),
        ]);
        let files = read_import_archive(&bytes).expect("read archive");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "grades/4220212.csv");
        assert_eq!(
            files[0].payload,
            FilePayload::Text("course_code\nCS101".to_string())
        );
        assert_eq!(files[1].name, "grades/4220213.XLSX");
        assert!(matches!(files[1].payload, FilePayload::Workbook(_)));
    }

    #[test]
    fn rejects_non_zip_bytes() {
        assert!(matches!(
            read_import_archive(b"student_id\n1"),
            Err(DecodeError::NotAnArchive)
        ));
    }
}
