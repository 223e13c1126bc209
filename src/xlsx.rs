//! Reads the first worksheet of an `.xlsx` workbook and renders it as
//! comma-delimited text.
//!
//! The archive is walked through its local file headers, the same way the
//! bytes are laid out on disk. Only the shared-string table and the worksheet
//! parts are kept. Entries whose sizes live in a trailing data descriptor (or
//! in zip64 extras) cannot be walked that way; for those the two parts are
//! read through the central directory instead.

use csv::WriterBuilder;
use flate2::read::DeflateDecoder;
use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::{debug, warn};
use zip::ZipArchive;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const LOCAL_HEADER_LEN: usize = 30;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;
const ZIP64_MARKER: u32 = 0xFFFF_FFFF;
const MAX_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

pub const SHARED_STRINGS_ENTRY: &str = "xl/sharedStrings.xml";
pub const FIRST_SHEET_ENTRY: &str = "xl/worksheets/sheet1.xml";
const SHEET_PREFIX: &str = "xl/worksheets/sheet";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a zip archive")]
    NotAnArchive,
    #[error("archive entry {entry} is truncated")]
    Truncated { entry: String },
    #[error("workbook has no worksheet")]
    MissingWorksheet,
    #[error("invalid xml in {entry}: {message}")]
    Xml { entry: String, message: String },
    #[error("archive error: {0}")]
    Archive(String),
    #[error("could not render worksheet: {0}")]
    Render(String),
}

/// The two workbook parts the decoder needs, as text.
#[derive(Debug, Default)]
struct WorkbookParts {
    shared_strings: Option<String>,
    sheets: Vec<(String, String)>,
}

impl WorkbookParts {
    fn first_sheet(&self) -> Option<&(String, String)> {
        self.sheets
            .iter()
            .find(|(name, _)| name == FIRST_SHEET_ENTRY)
            .or_else(|| self.sheets.iter().min_by_key(|(name, _)| sheet_number(name)))
    }
}

pub fn looks_like_zip(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == [0x50, 0x4B, 0x03, 0x04]
}

pub fn workbook_to_csv(bytes: &[u8]) -> Result<String, DecodeError> {
    let rows = workbook_rows(bytes)?;
    rows_to_csv(&rows).map_err(|e| DecodeError::Render(format!("{e:#}")))
}

pub fn workbook_rows(bytes: &[u8]) -> Result<Vec<Vec<String>>, DecodeError> {
    let parts = match walk_local_entries(bytes)? {
        Walk::Complete(parts) => parts,
        Walk::NeedsCentralDirectory => {
            debug!("local headers lack sizes; reading central directory");
            read_central_directory(bytes)?
        }
    };

    let shared = match parts.shared_strings.as_deref() {
        Some(xml) => parse_shared_strings(xml)?,
        None => Vec::new(),
    };
    let (sheet_name, sheet_xml) = parts.first_sheet().ok_or(DecodeError::MissingWorksheet)?;
    parse_sheet_rows(sheet_name, sheet_xml, &shared)
}

enum Walk {
    Complete(WorkbookParts),
    NeedsCentralDirectory,
}

fn is_wanted(name: &str) -> bool {
    name == SHARED_STRINGS_ENTRY || (name.starts_with(SHEET_PREFIX) && name.ends_with(".xml"))
}

fn sheet_number(name: &str) -> u32 {
    name.strip_prefix(SHEET_PREFIX)
        .and_then(|s| s.strip_suffix(".xml"))
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(u32::MAX)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn walk_local_entries(bytes: &[u8]) -> Result<Walk, DecodeError> {
    if !looks_like_zip(bytes) {
        return Err(DecodeError::NotAnArchive);
    }
    let mut parts = WorkbookParts::default();
    let mut offset = 0usize;

    while offset + LOCAL_HEADER_LEN <= bytes.len() {
        if read_u32(bytes, offset) != LOCAL_HEADER_SIG {
            // Central directory or trailing data.
            break;
        }
        let flags = read_u16(bytes, offset + 6);
        let method = read_u16(bytes, offset + 8);
        let compressed_size = read_u32(bytes, offset + 18);
        let uncompressed_size = read_u32(bytes, offset + 22);
        let name_len = read_u16(bytes, offset + 26) as usize;
        let extra_len = read_u16(bytes, offset + 28) as usize;

        let name_start = offset + LOCAL_HEADER_LEN;
        let name_end = name_start + name_len;
        if name_end > bytes.len() {
            return Err(DecodeError::Truncated {
                entry: format!("@{offset}"),
            });
        }
        let name = String::from_utf8_lossy(&bytes[name_start..name_end]).to_string();

        if (flags & FLAG_DATA_DESCRIPTOR != 0 && compressed_size == 0)
            || compressed_size == ZIP64_MARKER
            || uncompressed_size == ZIP64_MARKER
        {
            return Ok(Walk::NeedsCentralDirectory);
        }

        let data_start = name_end + extra_len;
        let data_end = data_start + compressed_size as usize;
        if data_end > bytes.len() {
            return Err(DecodeError::Truncated { entry: name });
        }

        if is_wanted(&name) {
            let payload = &bytes[data_start..data_end];
            match decode_payload(&name, method, payload, uncompressed_size as u64) {
                Some(text) => {
                    if name == SHARED_STRINGS_ENTRY {
                        parts.shared_strings = Some(text);
                    } else {
                        parts.sheets.push((name, text));
                    }
                }
                None => warn!(entry = %name, method, "workbook entry skipped"),
            }
        }

        offset = data_end;
        if flags & FLAG_DATA_DESCRIPTOR != 0 {
            offset = skip_data_descriptor(bytes, offset);
        }
    }

    Ok(Walk::Complete(parts))
}

// The descriptor is 12 bytes, or 16 when it carries its optional signature.
fn skip_data_descriptor(bytes: &[u8], offset: usize) -> usize {
    if offset + 4 <= bytes.len() && read_u32(bytes, offset) == 0x0807_4b50 {
        offset + 16
    } else {
        offset + 12
    }
}

/// Stored entries are copied; deflated entries are inflated. Anything else,
/// or a payload that fails to inflate, is reported as missing.
fn decode_payload(name: &str, method: u16, payload: &[u8], uncompressed_size: u64) -> Option<String> {
    match method {
        METHOD_STORED => Some(String::from_utf8_lossy(payload).to_string()),
        METHOD_DEFLATE => {
            let limit = if uncompressed_size > 0 {
                uncompressed_size.min(MAX_ENTRY_BYTES)
            } else {
                MAX_ENTRY_BYTES
            };
            let mut out = Vec::new();
            match DeflateDecoder::new(payload).take(limit).read_to_end(&mut out) {
                Ok(_) => Some(String::from_utf8_lossy(&out).to_string()),
                Err(e) => {
                    warn!(entry = %name, error = %e, "inflate failed");
                    None
                }
            }
        }
        _ => None,
    }
}

fn read_central_directory(bytes: &[u8]) -> Result<WorkbookParts, DecodeError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| DecodeError::Archive(e.to_string()))?;
    let names: Vec<String> = archive
        .file_names()
        .filter(|n| is_wanted(n))
        .map(|n| n.to_string())
        .collect();

    let mut parts = WorkbookParts::default();
    for name in names {
        let mut entry = match archive.by_name(&name) {
            Ok(e) => e,
            Err(e) => {
                warn!(entry = %name, error = %e, "workbook entry skipped");
                continue;
            }
        };
        let mut buf = Vec::new();
        if let Err(e) = (&mut entry).take(MAX_ENTRY_BYTES).read_to_end(&mut buf) {
            warn!(entry = %name, error = %e, "workbook entry skipped");
            continue;
        }
        let text = String::from_utf8_lossy(&buf).to_string();
        if name == SHARED_STRINGS_ENTRY {
            parts.shared_strings = Some(text);
        } else {
            parts.sheets.push((name, text));
        }
    }
    Ok(parts)
}

fn parse_xml<'a>(entry: &str, xml: &'a str) -> Result<roxmltree::Document<'a>, DecodeError> {
    roxmltree::Document::parse(xml).map_err(|e| DecodeError::Xml {
        entry: entry.to_string(),
        message: e.to_string(),
    })
}

/// One string per `<si>`, joining its `<t>` runs. Phonetic runs are ignored.
fn parse_shared_strings(xml: &str) -> Result<Vec<String>, DecodeError> {
    let doc = parse_xml(SHARED_STRINGS_ENTRY, xml)?;
    let strings = doc
        .descendants()
        .filter(|n| n.has_tag_name("si"))
        .map(|si| {
            si.descendants()
                .filter(|n| n.has_tag_name("t"))
                .filter(|t| !t.ancestors().any(|a| a.has_tag_name("rPh")))
                .filter_map(|t| t.text())
                .collect::<String>()
        })
        .collect();
    Ok(strings)
}

fn parse_sheet_rows(
    entry: &str,
    xml: &str,
    shared: &[String],
) -> Result<Vec<Vec<String>>, DecodeError> {
    let doc = parse_xml(entry, xml)?;
    let mut rows = Vec::new();
    for row in doc.descendants().filter(|n| n.has_tag_name("row")) {
        let mut cells: Vec<String> = Vec::new();
        for cell in row.children().filter(|n| n.has_tag_name("c")) {
            let col = cell
                .attribute("r")
                .and_then(column_index)
                .unwrap_or(cells.len());
            if col < cells.len() {
                // Out-of-order reference; keep the later value.
                cells[col] = cell_value(&cell, shared);
                continue;
            }
            cells.resize(col, String::new());
            cells.push(cell_value(&cell, shared));
        }
        if !cells.is_empty() {
            rows.push(cells);
        }
    }
    Ok(rows)
}

fn cell_value(cell: &roxmltree::Node<'_, '_>, shared: &[String]) -> String {
    let v = cell
        .children()
        .find(|n| n.has_tag_name("v"))
        .and_then(|n| n.text())
        .unwrap_or("");
    match cell.attribute("t") {
        Some("s") => v
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared.get(i).cloned())
            .unwrap_or_default(),
        Some("inlineStr") => cell
            .children()
            .filter(|n| n.has_tag_name("is"))
            .flat_map(|is| is.descendants().filter(|n| n.has_tag_name("t")))
            .filter_map(|t| t.text())
            .collect(),
        _ => v.to_string(),
    }
}

/// Zero-based column of an A1-style reference ("C7" → 2).
fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut n = 0usize;
    for b in letters {
        n = n * 26 + (b.to_ascii_uppercase() - b'A' + 1) as usize;
    }
    Some(n - 1)
}

/// Renders rows as comma-delimited text, one record per line. Rows may have
/// different lengths.
pub fn rows_to_csv(rows: &[Vec<String>]) -> anyhow::Result<String> {
    let mut writer = WriterBuilder::new().flexible(true).from_writer(Vec::new());
    for row in rows {
        writer.write_record(row)?;
    }
    let bytes = writer.into_inner().map_err(|e| anyhow::anyhow!("{}", e.error()))?;
    Ok(String::from_utf8(bytes)?)
}
