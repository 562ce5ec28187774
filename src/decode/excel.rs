#![cfg(feature = "excel")]

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Days, NaiveDate};

use crate::error::{DecodeError, DecodeResult};
use crate::types::{DataType, RowSet, Value};

use super::infer::{build_row_set, classify_text, convert_text, normalize_headers, parse_date, CellKind, TypeInference};

/// Inference over spreadsheet cells, which already carry a native type.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetInference;

impl TypeInference for SpreadsheetInference {
    type Cell = Data;

    fn classify(&self, cell: &Data) -> CellKind {
        match cell {
            Data::Empty | Data::Error(_) => CellKind::Empty,
            Data::Int(_) => CellKind::Int,
            Data::Float(f) if f.fract() == 0.0 => CellKind::Int,
            Data::Float(_) => CellKind::Float,
            Data::DateTime(_) => CellKind::Date,
            Data::DateTimeIso(s) if parse_date(s).is_some() => CellKind::Date,
            Data::String(s) => classify_text(s),
            _ => CellKind::Text,
        }
    }

    fn convert(&self, cell: &Data, data_type: DataType) -> Option<Value> {
        match (data_type, cell) {
            (DataType::Utf8, Data::String(s)) => Some(Value::Utf8(s.clone())),
            (DataType::Utf8, other) => Some(Value::Utf8(other.to_string())),
            (DataType::Int64, Data::Int(i)) => Some(Value::Int64(*i)),
            (DataType::Int64, Data::Float(f)) if f.fract() == 0.0 => Some(Value::Int64(*f as i64)),
            (DataType::Float64, Data::Float(f)) => Some(Value::Float64(*f)),
            (DataType::Float64, Data::Int(i)) => Some(Value::Float64(*i as f64)),
            (DataType::Date, Data::DateTime(dt)) => excel_serial_to_date(dt.as_f64()).map(Value::Date),
            (DataType::Date, Data::DateTimeIso(s)) => parse_date(s).map(Value::Date),
            (data_type, Data::String(s)) => convert_text(s, data_type),
            _ => None,
        }
    }
}

/// Convert a 1900-system serial date (days since 1899-12-30) to a calendar date.
fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(serial.floor() as u64))
}

/// Decode the first sheet of a workbook into a typed [`RowSet`].
///
/// Behavior:
/// - The first non-empty row is the header; trailing blank header cells are ignored
/// - Rows after the header are read up to the header width
/// - Trailing rows with no non-empty cell are dropped
/// - Column types come from [`SpreadsheetInference`]
pub fn decode_spreadsheet(bytes: &[u8]) -> DecodeResult<RowSet> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyFile);
    }
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e| DecodeError::Unreadable {
        message: e.to_string(),
    })?;

    let first = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(DecodeError::EmptyFile)?;
    let range = workbook.worksheet_range(&first)?;

    let mut rows = range
        .rows()
        .skip_while(|row| row.iter().all(is_blank));
    let header_row = rows.next().ok_or(DecodeError::EmptyFile)?;

    let width = header_row
        .iter()
        .rposition(|c| !is_blank(c))
        .map(|idx| idx + 1)
        .ok_or(DecodeError::NoColumns)?;
    let headers = normalize_headers(header_row[..width].iter().map(cell_to_header_string).collect());

    let mut data: Vec<Vec<Data>> = rows
        .map(|row| {
            let mut out: Vec<Data> = row.iter().take(width).cloned().collect();
            out.resize(width, Data::Empty);
            out
        })
        .collect();
    while data.last().is_some_and(|row| row.iter().all(is_blank)) {
        data.pop();
    }
    if data.is_empty() {
        return Err(DecodeError::NoRows);
    }

    Ok(build_row_set(&SpreadsheetInference, headers, data))
}

fn is_blank(c: &Data) -> bool {
    match c {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn cell_to_header_string(c: &Data) -> String {
    match c {
        Data::String(s) => s.clone(),
        Data::Float(f) if f.fract() == 0.0 => (*f as i64).to_string(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}
