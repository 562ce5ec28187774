//! Core data model types shared by the decoder, the stages and the run controller.
//!
//! Decoding produces an in-memory [`RowSet`] whose shape is described by a [`Schema`] (a list of
//! typed [`Field`]s). Stages never mutate a [`RowSet`] in place; every stage builds a new one.

use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

/// Canonical date representation used when a column carries no explicit format.
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Logical data type for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataType {
    /// 64-bit signed integer.
    Int64,
    /// 64-bit floating point number.
    Float64,
    /// Calendar date (no time component).
    Date,
    /// UTF-8 string.
    Utf8,
}

impl DataType {
    /// Whether values of this type can take part in arithmetic (mean fill, numeric compare).
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }
}

/// A single named, typed column in a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Column data type.
    pub data_type: DataType,
    /// Display format for [`DataType::Date`] columns (strftime syntax).
    ///
    /// `None` renders with [`DEFAULT_DATE_FORMAT`].
    pub format: Option<String>,
}

impl Field {
    /// Create a new field without a display format.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            format: None,
        }
    }

    /// Return a copy of this field carrying a display format.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// Ordered list of columns describing a [`RowSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Ordered list of fields.
    pub fields: Vec<Field>,
}

impl Schema {
    /// Create a new schema from fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Iterate column names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Returns the index of a column by name, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing/empty value.
    Null,
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// Calendar date.
    Date(NaiveDate),
    /// UTF-8 string.
    Utf8(String),
}

impl Value {
    /// Whether the cell is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the cell, if it holds a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            _ => None,
        }
    }

    /// Compare two cells of compatible types.
    ///
    /// Integers and floats compare numerically with each other; dates compare chronologically;
    /// strings compare lexicographically. Mixed or null comparisons return `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::Utf8(a), Self::Utf8(b)) => Some(a.cmp(b)),
            (Self::Int64(a), Self::Int64(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Hashable identity of this cell, used for key matching (dedupe, join, grouping).
    pub fn key_part(&self) -> KeyPart {
        match self {
            Self::Null => KeyPart::Null,
            Self::Int64(v) => KeyPart::Int(*v),
            // Whole floats match integers so `1` and `1.0` land on the same key.
            Self::Float64(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => KeyPart::Int(*v as i64),
            Self::Float64(v) => KeyPart::Float(v.to_bits()),
            Self::Date(d) => KeyPart::Date(*d),
            Self::Utf8(s) => KeyPart::Text(s.clone()),
        }
    }

    /// Render the cell as text, formatting dates with `date_format`.
    pub fn render(&self, date_format: Option<&str>) -> String {
        match self {
            Self::Date(d) => d.format(date_format.unwrap_or(DEFAULT_DATE_FORMAT)).to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Date(d) => write!(f, "{}", d.format(DEFAULT_DATE_FORMAT)),
            Self::Utf8(s) => f.write_str(s),
        }
    }
}

/// Hashable projection of a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Null,
    Int(i64),
    Float(u64),
    Date(NaiveDate),
    Text(String),
}

impl KeyPart {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// In-memory table: ordered columns plus rows of typed cells.
///
/// Rows are stored as `Vec<Vec<Value>>` in the same order as the [`Schema`] fields. Every row
/// has exactly `schema.len()` cells; [`RowSet::check_shape`] verifies it.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    /// Schema describing row shape.
    pub schema: Schema,
    /// Row-major value storage.
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    /// Create a row-set from schema and rows.
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        Self { schema, rows }
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Column names in order.
    pub fn columns(&self) -> Vec<String> {
        self.schema.field_names().map(str::to_owned).collect()
    }

    /// Returns the first row whose arity differs from the schema, as `(row_index, arity)`.
    pub fn check_shape(&self) -> Option<(usize, usize)> {
        let expected = self.schema.len();
        self.rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != expected)
            .map(|(idx, row)| (idx, row.len()))
    }

    /// Cell at `(row, column name)`, if both exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.schema.index_of(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Create a new row-set containing only rows that match `predicate`.
    ///
    /// The returned row-set preserves the original schema.
    pub fn filter_rows<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&[Value]) -> bool,
    {
        let rows = self
            .rows
            .iter()
            .filter(|row| predicate(row.as_slice()))
            .cloned()
            .collect();
        Self {
            schema: self.schema.clone(),
            rows,
        }
    }

    /// Create a new row-set by applying `mapper` to every row.
    ///
    /// # Panics
    ///
    /// Panics if `mapper` returns a row with a different length than the schema field count.
    pub fn map_rows<F>(&self, mut mapper: F) -> Self
    where
        F: FnMut(&[Value]) -> Vec<Value>,
    {
        let expected_len = self.schema.len();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let out = mapper(row.as_slice());
                assert!(
                    out.len() == expected_len,
                    "mapped row length {} does not match schema length {}",
                    out.len(),
                    expected_len
                );
                out
            })
            .collect();

        Self {
            schema: self.schema.clone(),
            rows,
        }
    }

    /// Reduce (fold) all rows into an accumulator value.
    pub fn reduce_rows<A, F>(&self, init: A, mut reducer: F) -> A
    where
        F: FnMut(A, &[Value]) -> A,
    {
        self.rows
            .iter()
            .fold(init, |acc, row| reducer(acc, row.as_slice()))
    }

    /// Render into a plain string table for presentation layers.
    pub fn to_table(&self) -> Table {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&self.schema.fields)
                    .map(|(value, field)| value.render(field.format.as_deref()))
                    .collect()
            })
            .collect();
        Table {
            columns: self.columns(),
            rows,
        }
    }
}

/// `{ columns, rows }` projection of a [`RowSet`] handed to renderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> Value {
        Value::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    #[test]
    fn check_shape_reports_first_ragged_row() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Utf8),
            Field::new("n", DataType::Int64),
        ]);
        let rs = RowSet::new(
            schema,
            vec![
                vec![Value::Utf8("a".into()), Value::Int64(1)],
                vec![Value::Utf8("b".into())],
            ],
        );
        assert_eq!(rs.check_shape(), Some((1, 1)));
    }

    #[test]
    fn compare_mixes_ints_and_floats_but_not_strings() {
        assert_eq!(Value::Int64(2).compare(&Value::Float64(2.5)), Some(Ordering::Less));
        assert_eq!(date("2024-04-15").compare(&date("2024-04-01")), Some(Ordering::Greater));
        assert_eq!(Value::Utf8("1".into()).compare(&Value::Int64(1)), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn whole_floats_share_integer_keys() {
        assert_eq!(Value::Float64(3.0).key_part(), Value::Int64(3).key_part());
        assert_ne!(Value::Float64(3.5).key_part(), Value::Int64(3).key_part());
    }

    #[test]
    fn to_table_uses_field_date_format() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Utf8),
            Field::new("d", DataType::Date).with_format("%Y/%m/%d"),
        ]);
        let rs = RowSet::new(
            schema,
            vec![vec![Value::Utf8("S001".into()), date("2024-04-15")]],
        );
        let table = rs.to_table();
        assert_eq!(table.columns, vec!["id", "d"]);
        assert_eq!(table.rows, vec![vec!["S001".to_string(), "2024/04/15".to_string()]]);
    }
}
