//! Semicolon-delimited CSV used by the detection export
//!
//! Every field is wrapped in double quotes with embedded quotes doubled, so
//! separators and line breaks inside values survive a round trip.

pub const DELIMITER: char = ';';

/// Quote a single field
pub fn escape_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Join fields into one record, terminated by a newline
pub fn write_record<S: AsRef<str>>(out: &mut String, fields: &[S]) {
    let line: Vec<String> = fields.iter().map(|f| escape_field(f.as_ref())).collect();
    out.push_str(&line.join(&DELIMITER.to_string()));
    out.push('\n');
}

/// Parse a whole document back into records.
///
/// Accepts quoted and bare fields. A quoted field may span lines.
#[cfg(test)]
pub fn parse(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut touched = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' => {
                in_quotes = true;
                touched = true;
            }
            c if c == DELIMITER && !in_quotes => {
                record.push(std::mem::take(&mut current));
                touched = true;
            }
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                if touched || !current.is_empty() {
                    record.push(std::mem::take(&mut current));
                    records.push(std::mem::take(&mut record));
                }
                touched = false;
            }
            _ => {
                current.push(c);
                touched = true;
            }
        }
    }

    if touched || !current.is_empty() {
        record.push(current);
        records.push(record);
    }
    records
}
