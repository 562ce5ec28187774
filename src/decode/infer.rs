//! Per-column type inference.
//!
//! Each decoder hands raw cells to a [`TypeInference`] implementation. A column's type is decided
//! by majority vote over its non-empty cells; if any non-empty cell then fails to convert to the
//! winning type, the whole column falls back to [`DataType::Utf8`]. Columns are therefore either
//! uniformly typed or text, never mixed.

use chrono::{NaiveDate, NaiveDateTime};
use rayon::prelude::*;

use crate::types::{DataType, Field, RowSet, Schema, Value};

const DATE_PATTERNS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%d.%m.%Y", "%m/%d/%Y", "%Y年%m月%d日"];
const DATETIME_PATTERNS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S"];

/// Coarse classification of one raw cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Empty,
    Int,
    Float,
    Date,
    Text,
}

/// Format-specific cell inspection used by [`build_row_set`].
pub trait TypeInference: Sync {
    /// Raw cell representation produced by the decoder.
    type Cell: Send + Sync;

    fn classify(&self, cell: &Self::Cell) -> CellKind;

    /// Convert a non-empty cell to `data_type`; `None` if it does not conform.
    fn convert(&self, cell: &Self::Cell, data_type: DataType) -> Option<Value>;
}

/// Inference over delimited-text cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvInference;

impl TypeInference for CsvInference {
    type Cell = String;

    fn classify(&self, cell: &String) -> CellKind {
        classify_text(cell)
    }

    fn convert(&self, cell: &String, data_type: DataType) -> Option<Value> {
        convert_text(cell, data_type)
    }
}

/// Parse a date written in any of the recognized layouts.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    DATE_PATTERNS
        .iter()
        .find_map(|p| NaiveDate::parse_from_str(s, p).ok())
        .or_else(|| {
            DATETIME_PATTERNS
                .iter()
                .find_map(|p| NaiveDateTime::parse_from_str(s, p).ok())
                .map(|dt| dt.date())
        })
}

pub(crate) fn classify_text(raw: &str) -> CellKind {
    let s = raw.trim();
    if s.is_empty() {
        return CellKind::Empty;
    }
    if !s.bytes().any(|b| b.is_ascii_digit()) {
        return CellKind::Text;
    }
    if is_zero_padded(s) {
        // Identifiers such as `007` must keep their leading zeros.
        return CellKind::Text;
    }
    if s.parse::<i64>().is_ok() {
        CellKind::Int
    } else if s.parse::<f64>().is_ok() {
        CellKind::Float
    } else if parse_date(s).is_some() {
        CellKind::Date
    } else {
        CellKind::Text
    }
}

fn is_zero_padded(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    digits.len() > 1 && digits.starts_with('0') && digits.bytes().all(|b| b.is_ascii_digit())
}

pub(crate) fn convert_text(raw: &str, data_type: DataType) -> Option<Value> {
    let s = raw.trim();
    match data_type {
        DataType::Utf8 => Some(Value::Utf8(raw.to_owned())),
        DataType::Int64 => s.parse::<i64>().ok().map(Value::Int64),
        DataType::Float64 => s.parse::<f64>().ok().map(Value::Float64),
        DataType::Date => parse_date(s).map(Value::Date),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    int: usize,
    float: usize,
    date: usize,
    text: usize,
}

impl Tally {
    fn add(&mut self, kind: CellKind) {
        match kind {
            CellKind::Empty => {}
            CellKind::Int => self.int += 1,
            CellKind::Float => self.float += 1,
            CellKind::Date => self.date += 1,
            CellKind::Text => self.text += 1,
        }
    }

    fn winner(&self) -> DataType {
        let numeric = self.int + self.float;
        if numeric > self.date && numeric > self.text {
            if self.float > 0 { DataType::Float64 } else { DataType::Int64 }
        } else if self.date > numeric && self.date > self.text {
            DataType::Date
        } else {
            // Text majority, ties, and all-empty columns.
            DataType::Utf8
        }
    }
}

/// Vote on the type of column `col`.
pub fn infer_column_type<I: TypeInference>(inference: &I, rows: &[Vec<I::Cell>], col: usize) -> DataType {
    let mut tally = Tally::default();
    for row in rows {
        if let Some(cell) = row.get(col) {
            tally.add(inference.classify(cell));
        }
    }
    let winner = tally.winner();
    if winner == DataType::Utf8 {
        return winner;
    }
    let conforms = rows.iter().filter_map(|row| row.get(col)).all(|cell| {
        inference.classify(cell) == CellKind::Empty || inference.convert(cell, winner).is_some()
    });
    if conforms { winner } else { DataType::Utf8 }
}

/// Build a typed [`RowSet`] from a header and rectangular raw rows.
///
/// Column votes and row conversion both run on the rayon pool; output row order matches input.
pub fn build_row_set<I: TypeInference>(inference: &I, headers: Vec<String>, rows: Vec<Vec<I::Cell>>) -> RowSet {
    let types: Vec<DataType> = (0..headers.len())
        .into_par_iter()
        .map(|col| infer_column_type(inference, &rows, col))
        .collect();

    let typed_rows: Vec<Vec<Value>> = rows
        .par_iter()
        .map(|row| {
            types
                .iter()
                .enumerate()
                .map(|(col, data_type)| match row.get(col) {
                    Some(cell) if inference.classify(cell) != CellKind::Empty => {
                        inference.convert(cell, *data_type).unwrap_or(Value::Null)
                    }
                    _ => Value::Null,
                })
                .collect()
        })
        .collect();

    let fields = headers
        .into_iter()
        .zip(types)
        .map(|(name, data_type)| Field::new(name, data_type))
        .collect();
    RowSet::new(Schema::new(fields), typed_rows)
}

/// Make header names non-empty and unique (`column_3`, `name_2`).
pub fn normalize_headers(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for (idx, name) in raw.into_iter().enumerate() {
        let trimmed = name.trim();
        let base = if trimmed.is_empty() {
            format!("column_{}", idx + 1)
        } else {
            trimmed.to_owned()
        };
        let mut candidate = base.clone();
        let mut n = 2;
        while out.contains(&candidate) {
            candidate = format!("{base}_{n}");
            n += 1;
        }
        out.push(candidate);
    }
    out
}
