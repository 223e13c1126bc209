use csv::{ReaderBuilder, Trim};
use tracing::warn;

const BOM: char = '\u{feff}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Comma,
    Semicolon,
    Tab,
}

impl Delimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            Delimiter::Comma => b',',
            Delimiter::Semicolon => b';',
            Delimiter::Tab => b'\t',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Delimiter::Comma => "comma",
            Delimiter::Semicolon => "semicolon",
            Delimiter::Tab => "tab",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedTable {
    pub delimiter: Delimiter,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Parses delimited text into a header row and data rows.
///
/// Cells are trimmed. Blank lines and rows whose cells are all empty are
/// dropped; the first remaining row is the header. The byte-order mark is
/// removed from the first header cell only.
pub fn parse_table(text: &str) -> ParsedTable {
    let delimiter = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(detect_delimiter)
        .unwrap_or(Delimiter::Comma);

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter.as_byte())
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    for (i, result) in reader.records().enumerate() {
        match result {
            Ok(record) => {
                let cells: Vec<String> = record.iter().map(str::to_string).collect();
                if cells.iter().any(|c| !c.is_empty()) {
                    records.push(cells);
                }
            }
            Err(e) => warn!(record = i, error = %e, "unreadable delimited record skipped"),
        }
    }

    let mut rows = records.into_iter();
    let mut headers = rows.next().unwrap_or_default();
    if let Some(h) = headers.first_mut() {
        if let Some(stripped) = h.strip_prefix(BOM) {
            *h = stripped.trim().to_string();
        }
    }

    ParsedTable {
        delimiter,
        headers,
        rows: rows.collect(),
    }
}

pub fn detect_delimiter(first_line: &str) -> Delimiter {
    let tabs = first_line.matches('\t').count();
    let semis = first_line.matches(';').count();
    let commas = first_line.matches(',').count();
    if tabs > commas && tabs > semis {
        Delimiter::Tab
    } else if semis > commas {
        Delimiter::Semicolon
    } else {
        Delimiter::Comma
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_semicolon_comma_and_default() {
        assert_eq!(parse_table("a;b;c\n1;2;3").delimiter, Delimiter::Semicolon);
        assert_eq!(parse_table("a,b,c\n1,2,3").delimiter, Delimiter::Comma);
        assert_eq!(parse_table("abc\n123").delimiter, Delimiter::Comma);
        assert_eq!(detect_delimiter("a\tb\tc"), Delimiter::Tab);
        // Tab must strictly exceed both others.
        assert_eq!(detect_delimiter("a\tb,c"), Delimiter::Comma);
        assert_eq!(detect_delimiter("a;b,c"), Delimiter::Comma);
    }

    #[test]
    fn semicolon_table_splits_cells() {
        let t = parse_table("a;b;c\n1;2;3");
        assert_eq!(t.headers, vec!["a", "b", "c"]);
        assert_eq!(t.rows, vec![vec!["1", "2", "3"]]);
    }

    #[test]
    fn quoted_newline_and_doubled_quotes_stay_in_cell() {
        let t = parse_table("name,note\r\n\"Smith, J\",\"line one\nline \"\"two\"\"\"\r\n");
        assert_eq!(t.rows.len(), 1);
        assert_eq!(t.rows[0][0], "Smith, J");
        assert_eq!(t.rows[0][1], "line one\nline \"two\"");
    }

    #[test]
    fn strips_bom_from_first_header_only() {
        let t = parse_table("\u{feff}student_id,\u{feff}x\n1,2");
        assert_eq!(t.headers[0], "student_id");
        assert_eq!(t.headers[1], "\u{feff}x");
    }

    #[test]
    fn drops_blank_lines_and_empty_rows() {
        let t = parse_table("a,b\n\n   \n , \n1,2\n,\n");
        assert_eq!(t.rows, vec![vec!["1", "2"]]);
    }

    #[test]
    fn empty_text_yields_empty_table() {
        let t = parse_table("\n\n");
        assert!(t.headers.is_empty());
        assert!(t.rows.is_empty());
    }

    #[test]
    fn leading_blank_lines_do_not_hide_the_header() {
        let t = parse_table("\n  \nstudent_id;course_code\n1;CS1\n");
        assert_eq!(t.delimiter, Delimiter::Semicolon);
        assert_eq!(t.headers, vec!["student_id", "course_code"]);
        assert_eq!(t.rows, vec![vec!["1", "CS1"]]);
    }

    #[test]
    fn short_and_long_rows_are_kept() {
        let t = parse_table("a,b,c\n1\n1,2,3,4\n");
        assert_eq!(t.rows, vec![vec!["1"], vec!["1", "2", "3", "4"]]);
    }
}
