use anyhow::{Context, Result};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader as XmlReader;
use std::io::Cursor;
use std::path::Path;

use crate::provisioning::NewUser;

/// Number of leading columns read from the sheet:
/// first name, last name, matricule, assignment
const USER_COLUMNS: usize = 4;

/// Largest magnitude below which every whole f64 is an exact integer
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Cells of one sheet row at their real position
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawRow {
    /// 1-based row number in the sheet
    line: usize,
    /// Cells from column A onwards, gaps filled with empty strings
    cells: Vec<String>,
}

/// A user parsed from one spreadsheet row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    /// 1-based row number in the sheet, header included
    pub line: usize,
    pub user: NewUser,
}

/// Parse a user spreadsheet from disk
pub fn parse_user_file(path: &Path) -> Result<Vec<SheetRow>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;
    parse_user_sheet(&bytes)
}

/// Parse an uploaded user spreadsheet.
///
/// Only the first sheet is read, only its first four columns, and the first
/// row is treated as a header. Supports SpreadsheetML XML as well as
/// xlsx/xls/ods.
pub fn parse_user_sheet(bytes: &[u8]) -> Result<Vec<SheetRow>> {
    let rows = if is_spreadsheet_ml(bytes) {
        let content = std::str::from_utf8(bytes).context("Spreadsheet XML is not valid UTF-8")?;
        parse_spreadsheet_rows(content)?
    } else {
        read_first_sheet(bytes)?
    };

    if rows.is_empty() {
        anyhow::bail!("No data rows found in file");
    }

    Ok(rows_to_users(&rows))
}

fn is_spreadsheet_ml(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(512)];
    let head = String::from_utf8_lossy(head);
    let head = head.trim_start_matches('\u{feff}').trim_start();
    head.starts_with("<?xml") || head.contains("<Workbook")
}

/// Read the first sheet of a binary workbook with calamine
fn read_first_sheet(bytes: &[u8]) -> Result<Vec<RawRow>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .context("Unrecognised spreadsheet format")?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = sheet_names
        .first()
        .context("Workbook has no sheets")?
        .clone();

    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read worksheet")?;

    // The range starts at the first used cell, not at A1
    let (first_row, first_col) = range.start().unwrap_or((0, 0));
    Ok(anchor_rows(
        range.rows().map(|row| row.iter().map(cell_to_string).collect()),
        first_row as usize,
        first_col as usize,
    ))
}

/// Place rows read from a range starting at (`first_row`, `first_col`),
/// both 0-based, back at their sheet position
fn anchor_rows(
    rows: impl Iterator<Item = Vec<String>>,
    first_row: usize,
    first_col: usize,
) -> Vec<RawRow> {
    rows.enumerate()
        .map(|(idx, row)| {
            let mut cells = vec![String::new(); first_col];
            cells.extend(row);
            RawRow {
                line: first_row + idx + 1,
                cells,
            }
        })
        .collect()
}

/// Turn raw rows into users: the first row read is the header, keep the
/// first four columns, ignore rows where all four are blank
fn rows_to_users(rows: &[RawRow]) -> Vec<SheetRow> {
    rows.iter()
        .skip(1)
        .filter_map(|row| {
            let cell = |i: usize| -> String {
                if i < USER_COLUMNS {
                    row.cells.get(i).map(|s| s.trim().to_string()).unwrap_or_default()
                } else {
                    String::new()
                }
            };

            let user = NewUser {
                first_name: cell(0),
                last_name: cell(1),
                matricule: cell(2),
                assignment: cell(3),
            };

            if user.is_blank() {
                None
            } else {
                Some(SheetRow {
                    line: row.line,
                    user,
                })
            }
        })
        .collect()
}

/// Parse SpreadsheetML XML into rows of cell values.
///
/// Excel skips empty rows and cells and marks the next one with a 1-based
/// `ss:Index`; gaps are filled back in so columns and line numbers hold.
fn parse_spreadsheet_rows(xml: &str) -> Result<Vec<RawRow>> {
    let mut reader = XmlReader::from_str(xml);
    // Don't trim text - we'll trim at cell level to preserve spaces around entities
    reader.config_mut().trim_text(false);

    let mut rows: Vec<RawRow> = Vec::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut line = 0;
    let mut in_row = false;
    let mut in_cell = false;
    let mut in_data = false;
    let mut cell_has_data = false;
    let mut current_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Row" => {
                    in_row = true;
                    line = ss_index(&e).unwrap_or(line + 1);
                    current_row = Vec::new();
                }
                b"Cell" => {
                    if in_row {
                        pad_to_index(&mut current_row, ss_index(&e));
                        in_cell = true;
                        cell_has_data = false;
                    }
                }
                b"Data" => {
                    if in_cell {
                        in_data = true;
                        cell_has_data = true;
                        current_text.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                // <Row/> is a blank row that still takes a line
                b"Row" => line = ss_index(&e).unwrap_or(line + 1),
                // <Cell/> with no data
                b"Cell" if in_row => {
                    pad_to_index(&mut current_row, ss_index(&e));
                    current_row.push(String::new());
                }
                b"Data" if in_cell => {
                    cell_has_data = true;
                    current_row.push(String::new());
                }
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"Row" => {
                    if in_row && !current_row.is_empty() {
                        rows.push(RawRow {
                            line,
                            cells: std::mem::take(&mut current_row),
                        });
                    }
                    in_row = false;
                }
                b"Cell" => {
                    if in_cell && !cell_has_data {
                        current_row.push(String::new());
                    }
                    in_cell = false;
                }
                // Only the first sheet is imported
                b"Worksheet" => break,
                b"Data" => {
                    if in_data {
                        current_row.push(current_text.trim().to_string());
                        current_text.clear();
                    }
                    in_data = false;
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_data {
                    if let Ok(decoded) = e.decode() {
                        if let Ok(text) = unescape(&decoded) {
                            current_text.push_str(&text);
                        }
                    }
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_data {
                    match e.resolve_char_ref() {
                        Ok(Some(ch)) => current_text.push(ch),
                        Ok(None) => {
                            let name = e.decode().context("Invalid entity name")?;
                            let resolved = resolve_predefined_entity(&name)
                                .with_context(|| format!("Unknown entity &{};", name))?;
                            current_text.push_str(resolved);
                        }
                        Err(err) => anyhow::bail!("Invalid character reference: {}", err),
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => anyhow::bail!("XML parse error: {}", e),
            _ => {}
        }
    }

    Ok(rows)
}

/// 1-based `ss:Index` of a Row or Cell, if set
fn ss_index(e: &BytesStart<'_>) -> Option<usize> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"Index")
        .and_then(|attr| std::str::from_utf8(attr.value.as_ref()).ok()?.trim().parse::<usize>().ok())
        .filter(|&index| index > 0)
}

/// Fill skipped cells so the next one lands in column `index`
fn pad_to_index(row: &mut Vec<String>, index: Option<usize>) {
    if let Some(index) = index {
        if row.len() < index - 1 {
            row.resize(index - 1, String::new());
        }
    }
}

/// Convert a calamine cell to a String
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Matricules typed as numbers come back as floats
            if f.fract() == 0.0 && f.abs() <= MAX_EXACT_INTEGER {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => {
            if let Some(datetime) = dt.as_datetime() {
                datetime.format("%Y-%m-%d").to_string()
            } else {
                dt.as_f64().to_string()
            }
        }
        Data::DateTimeIso(s) => s.split('T').next().unwrap_or(s).to_string(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#{:?}", e),
    }
}
