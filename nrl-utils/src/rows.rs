use anyhow::{anyhow, Result};
use std::{fmt::Write as _, fs, path::Path};

/// Formats `values` as comma-delimited rows of `row_len` entries.
///
/// Floats use the shortest representation that parses back to the same bits.
pub fn format_rows(values: &[f32], row_len: usize) -> String {
    let row_len = row_len.max(1);
    let mut out = String::with_capacity(values.len() * 12);
    for row in values.chunks(row_len) {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}", value);
        }
        out.push('\n');
    }
    out
}

/// Parses rows delimited by commas and/or whitespace. Blank lines are skipped.
pub fn parse_rows(text: &str) -> Result<Vec<Vec<f32>>> {
    let mut rows = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<f32>()
                    .map_err(|e| anyhow!("row {}: cannot parse '{}': {}", line_no + 1, token, e))
            })
            .collect::<Result<Vec<f32>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn write_rows<P: AsRef<Path>>(path: P, values: &[f32], row_len: usize) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, format_rows(values, row_len))
        .map_err(|e| anyhow!("Failed to write '{}': {}", path.display(), e))
}

pub fn write_table<P: AsRef<Path>>(path: P, rows: &[Vec<f32>]) -> Result<()> {
    let path = path.as_ref();
    let mut out = String::new();
    for row in rows {
        out.push_str(&format_rows(row, row.len()));
    }
    fs::write(path, out).map_err(|e| anyhow!("Failed to write '{}': {}", path.display(), e))
}

pub fn read_rows<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<f32>>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
    parse_rows(&text).map_err(|e| anyhow!("'{}': {}", path.display(), e))
}
