//! Column reductions over a [`crate::types::RowSet`].

use crate::types::{DataType, RowSet, Value};

/// Built-in reduction operations over a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Count all rows (including nulls).
    Count,
    /// Count non-null cells.
    CountNonNull,
    /// Sum numeric values, ignoring nulls.
    Sum,
    /// Arithmetic mean of numeric values, ignoring nulls. Always [`Value::Float64`].
    Mean,
    /// Minimum value, ignoring nulls (numbers, dates and strings).
    Min,
    /// Maximum value, ignoring nulls (numbers, dates and strings).
    Max,
}

/// Reduce a column using a built-in [`ReduceOp`].
///
/// - Returns `None` if `column` does not exist in the schema.
/// - For `Sum`/`Mean`, returns `Some(Value::Null)` if the column is not numeric or has no
///   non-null values; `Min`/`Max` likewise return `Null` for all-null columns.
pub fn reduce(rows: &RowSet, column: &str, op: ReduceOp) -> Option<Value> {
    let idx = rows.schema.index_of(column)?;
    let data_type = rows.schema.fields[idx].data_type;
    let cells = rows.rows.iter().filter_map(|row| row.get(idx)).filter(|v| !v.is_null());

    Some(match op {
        ReduceOp::Count => Value::Int64(rows.row_count() as i64),
        ReduceOp::CountNonNull => Value::Int64(cells.count() as i64),
        ReduceOp::Sum | ReduceOp::Mean if !data_type.is_numeric() => Value::Null,
        ReduceOp::Sum if data_type == DataType::Int64 => {
            let mut acc: Option<i64> = None;
            for v in cells {
                if let Value::Int64(x) = v {
                    acc = Some(acc.unwrap_or(0).saturating_add(*x));
                }
            }
            acc.map(Value::Int64).unwrap_or(Value::Null)
        }
        ReduceOp::Sum => {
            let values: Vec<f64> = cells.filter_map(Value::as_f64).collect();
            if values.is_empty() {
                Value::Null
            } else {
                Value::Float64(values.iter().sum())
            }
        }
        ReduceOp::Mean => {
            let (sum, n) = cells
                .filter_map(Value::as_f64)
                .fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
            if n == 0 { Value::Null } else { Value::Float64(sum / n as f64) }
        }
        ReduceOp::Min | ReduceOp::Max => {
            let mut best: Option<&Value> = None;
            for v in cells {
                best = match best {
                    None => Some(v),
                    Some(cur) => {
                        let ord = v.compare(cur);
                        let better = match op {
                            ReduceOp::Min => ord.is_some_and(|o| o.is_lt()),
                            _ => ord.is_some_and(|o| o.is_gt()),
                        };
                        Some(if better { v } else { cur })
                    }
                };
            }
            best.cloned().unwrap_or(Value::Null)
        }
    })
}
