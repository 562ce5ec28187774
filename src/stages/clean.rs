//! Clean stage: whitespace trimming, missing-value handling and key-based dedupe.
//!
//! Options apply in a fixed order: `trimWhitespace`, then `missingValuePolicy`, then `dedupeBy`.
//! Dedupe is the only place where entity-key collisions are resolved.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigResult, StageOutcome};
use crate::processing::group::{display_key, key_has_null, resolve_columns, row_key, RowKey};
use crate::processing::{reduce, ReduceOp};
use crate::types::{DataType, RowSet, Value};

use super::registry::invalid;
use super::{rows_phrase, ChangeRecord, StageContext, StageDiagnostics, StageKind, StageOutput};

/// One key column, or several forming a composite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyColumns {
    One(String),
    Many(Vec<String>),
}

impl KeyColumns {
    pub fn columns(&self) -> Vec<String> {
        match self {
            Self::One(c) => vec![c.clone()],
            Self::Many(cs) => cs.clone(),
        }
    }
}

/// Which occurrence of a repeated key survives dedupe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepPolicy {
    First,
    #[default]
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingValuePolicy {
    /// Remove every row holding a null cell.
    Drop,
    /// Fill nulls of numeric columns with the column mean (rounded for integer columns).
    MeanFill,
    /// Fill nulls with the previous row's value in the same column.
    ForwardFill,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CleanConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_by: Option<KeyColumns>,
    pub keep_policy: KeepPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_value_policy: Option<MissingValuePolicy>,
    pub trim_whitespace: bool,
}

impl CleanConfig {
    /// Dedupe on `column`, keeping the last occurrence.
    pub fn dedupe_by(column: impl Into<String>) -> Self {
        Self {
            dedupe_by: Some(KeyColumns::One(column.into())),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> ConfigResult<()> {
        match &self.dedupe_by {
            Some(KeyColumns::One(c)) if c.trim().is_empty() => {
                Err(invalid(StageKind::Clean, "dedupeBy", "column name is empty"))
            }
            Some(KeyColumns::Many(cs)) if cs.is_empty() || cs.iter().any(|c| c.trim().is_empty()) => {
                Err(invalid(StageKind::Clean, "dedupeBy", "expected one or more non-empty column names"))
            }
            _ => Ok(()),
        }
    }
}

pub fn apply(config: &CleanConfig, input: &RowSet, ctx: &StageContext) -> StageOutcome<StageOutput> {
    // Resolve before touching rows so a bad key column fails the stage up front.
    let dedupe_cols = match &config.dedupe_by {
        Some(key) => Some(resolve_columns(&input.schema, &key.columns())?),
        None => None,
    };

    let mut diagnostics = StageDiagnostics::new(input.row_count());
    let mut rows = input.clone();

    if config.trim_whitespace {
        let trimmed = ctx.executor.map_parallel(&rows, |row| row.iter().map(trim_cell).collect());
        let changed = count_changed_cells(&rows, &trimmed);
        if changed > 0 {
            diagnostics.record(ChangeRecord::new(
                "trimWhitespace",
                format!("trimmed whitespace in {changed} cell(s)"),
            ));
        }
        rows = trimmed;
    }

    match config.missing_value_policy {
        Some(MissingValuePolicy::Drop) => {
            let before = rows.row_count();
            let sample = rows
                .rows
                .iter()
                .find(|row| row.iter().any(Value::is_null))
                .zip(dedupe_cols.as_deref())
                .map(|(row, cols)| display_key(row, cols));
            rows = ctx.executor.filter_parallel(&rows, |row| !row.iter().any(Value::is_null));
            let removed = before - rows.row_count();
            if removed > 0 {
                let mut change = ChangeRecord::new(
                    "missingValuePolicy",
                    format!("{} removed with missing values", rows_phrase(removed)),
                );
                if let Some(key) = sample {
                    change = change.with_sample_key(key);
                }
                diagnostics.record(change);
            }
        }
        Some(MissingValuePolicy::MeanFill) => rows = mean_fill(rows, ctx, &mut diagnostics),
        Some(MissingValuePolicy::ForwardFill) => rows = forward_fill(rows, &mut diagnostics),
        None => {}
    }

    if let Some(cols) = dedupe_cols {
        rows = dedupe(rows, &cols, config.keep_policy, &mut diagnostics);
    }

    diagnostics.rows_out = rows.row_count();
    Ok(StageOutput { rows, diagnostics })
}

fn trim_cell(value: &Value) -> Value {
    match value {
        Value::Utf8(s) => {
            let t = s.trim();
            if t.is_empty() {
                Value::Null
            } else {
                Value::Utf8(t.to_string())
            }
        }
        other => other.clone(),
    }
}

fn count_changed_cells(before: &RowSet, after: &RowSet) -> usize {
    before
        .rows
        .iter()
        .zip(&after.rows)
        .map(|(a, b)| a.iter().zip(b).filter(|(x, y)| x != y).count())
        .sum()
}

fn mean_fill(rows: RowSet, ctx: &StageContext, diagnostics: &mut StageDiagnostics) -> RowSet {
    let fills: Vec<(usize, Value)> = rows
        .schema
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.data_type.is_numeric())
        .filter_map(|(idx, f)| match reduce(&rows, &f.name, ReduceOp::Mean)? {
            Value::Float64(mean) if f.data_type == DataType::Int64 => Some((idx, Value::Int64(mean.round() as i64))),
            Value::Float64(mean) => Some((idx, Value::Float64(mean))),
            _ => None,
        })
        .collect();
    if fills.is_empty() {
        return rows;
    }

    let filled = ctx.executor.map_parallel(&rows, |row| {
        let mut out = row.to_vec();
        for (idx, fill) in &fills {
            if out[*idx].is_null() {
                out[*idx] = fill.clone();
            }
        }
        out
    });
    for (idx, fill) in &fills {
        let n = rows.rows.iter().filter(|row| row[*idx].is_null()).count();
        if n > 0 {
            diagnostics.record(ChangeRecord::new(
                "missingValuePolicy",
                format!(
                    "filled {n} missing value(s) in '{}' with mean {fill}",
                    rows.schema.fields[*idx].name
                ),
            ));
        }
    }
    filled
}

fn forward_fill(mut rows: RowSet, diagnostics: &mut StageDiagnostics) -> RowSet {
    let width = rows.schema.len();
    let mut last: Vec<Option<Value>> = vec![None; width];
    let mut filled = vec![0usize; width];

    for row in &mut rows.rows {
        for (idx, cell) in row.iter_mut().enumerate() {
            if cell.is_null() {
                if let Some(prev) = &last[idx] {
                    *cell = prev.clone();
                    filled[idx] += 1;
                }
            } else {
                last[idx] = Some(cell.clone());
            }
        }
    }

    for (idx, n) in filled.into_iter().enumerate() {
        if n > 0 {
            diagnostics.record(ChangeRecord::new(
                "missingValuePolicy",
                format!("forward-filled {n} missing value(s) in '{}'", rows.schema.fields[idx].name),
            ));
        }
    }
    rows
}

/// Keep one row per key. Rows whose key contains a null are never treated as duplicates.
///
/// The survivor stays at its own position, so keep-last output follows last-occurrence order.
fn dedupe(rows: RowSet, cols: &[usize], keep: KeepPolicy, diagnostics: &mut StageDiagnostics) -> RowSet {
    let keys: Vec<RowKey> = rows.rows.iter().map(|row| row_key(row, cols)).collect();
    let mut winner: HashMap<&RowKey, usize> = HashMap::with_capacity(keys.len());
    for (idx, key) in keys.iter().enumerate() {
        if key_has_null(key) {
            continue;
        }
        match keep {
            KeepPolicy::First => {
                winner.entry(key).or_insert(idx);
            }
            KeepPolicy::Last => {
                winner.insert(key, idx);
            }
        }
    }

    let mut removed_keys: Vec<String> = Vec::new();
    let mut removed = 0usize;
    let mut kept = Vec::with_capacity(winner.len());
    for (idx, row) in rows.rows.into_iter().enumerate() {
        let key = &keys[idx];
        if key_has_null(key) || winner.get(key) == Some(&idx) {
            kept.push(row);
        } else {
            removed += 1;
            let shown = display_key(&row, cols);
            if !removed_keys.contains(&shown) {
                removed_keys.push(shown);
            }
        }
    }

    if removed > 0 {
        let listed = removed_keys.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
        let more = if removed_keys.len() > 3 { ", ..." } else { "" };
        let noun = if removed_keys.len() == 1 { "key" } else { "keys" };
        diagnostics.record(
            ChangeRecord::new("dedupeBy", format!("{} removed, {noun} {listed}{more}", rows_phrase(removed)))
                .with_sample_key(removed_keys[0].clone()),
        );
    }
    RowSet::new(rows.schema, kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::execution::{ExecutionOptions, RowExecutor};
    use crate::types::{Field, Schema};
    use std::sync::Arc;

    fn ctx() -> StageContext {
        StageContext::new(Arc::new(RowExecutor::new(ExecutionOptions {
            num_threads: Some(2),
            chunk_size: 2,
            max_in_flight_chunks: 2,
        })))
    }

    fn text(s: &str) -> Value {
        Value::Utf8(s.to_string())
    }

    fn students(rows: &[(&str, i64)]) -> RowSet {
        let schema = Schema::new(vec![Field::new("id", DataType::Utf8), Field::new("n", DataType::Int64)]);
        RowSet::new(schema, rows.iter().map(|(id, n)| vec![text(id), Value::Int64(*n)]).collect())
    }

    #[test]
    fn keep_last_keeps_the_last_occurrence() {
        let input = students(&[("S001", 1), ("S004", 2), ("S002", 3), ("S004", 4)]);
        let out = apply(&CleanConfig::dedupe_by("id"), &input, &ctx()).unwrap();
        assert_eq!(out.rows.rows, students(&[("S001", 1), ("S002", 3), ("S004", 4)]).rows);
        assert_eq!(out.diagnostics.rows_in, 4);
        assert_eq!(out.diagnostics.rows_out, 3);
        assert_eq!(out.diagnostics.messages().collect::<Vec<_>>(), vec!["1 row removed, key S004"]);
        assert_eq!(out.diagnostics.changes[0].sample_key.as_deref(), Some("S004"));
    }

    #[test]
    fn keep_first_keeps_the_first_occurrence() {
        let input = students(&[("a", 1), ("b", 2), ("a", 3), ("b", 4), ("c", 5)]);
        let config = CleanConfig {
            keep_policy: KeepPolicy::First,
            ..CleanConfig::dedupe_by("id")
        };
        let out = apply(&config, &input, &ctx()).unwrap();
        assert_eq!(out.rows.rows, students(&[("a", 1), ("b", 2), ("c", 5)]).rows);
        assert_eq!(out.diagnostics.messages().next(), Some("2 rows removed, keys a, b"));
    }

    #[test]
    fn composite_keys_and_null_keys() {
        let schema = Schema::new(vec![Field::new("id", DataType::Utf8), Field::new("n", DataType::Int64)]);
        let input = RowSet::new(
            schema,
            vec![
                vec![text("a"), Value::Int64(1)],
                vec![text("a"), Value::Int64(2)],
                vec![Value::Null, Value::Int64(1)],
                vec![Value::Null, Value::Int64(1)],
                vec![text("a"), Value::Int64(1)],
            ],
        );
        let config = CleanConfig {
            dedupe_by: Some(KeyColumns::Many(vec!["id".into(), "n".into()])),
            ..CleanConfig::default()
        };
        let out = apply(&config, &input, &ctx()).unwrap();
        assert_eq!(out.rows.row_count(), 4);
        assert_eq!(out.diagnostics.messages().next(), Some("1 row removed, key a|1"));
    }

    #[test]
    fn trims_then_drops_blank_cells() {
        let input = students(&[(" S001 ", 1), ("   ", 2)]);
        let config = CleanConfig {
            trim_whitespace: true,
            missing_value_policy: Some(MissingValuePolicy::Drop),
            ..CleanConfig::default()
        };
        let out = apply(&config, &input, &ctx()).unwrap();
        assert_eq!(out.rows.rows, vec![vec![text("S001"), Value::Int64(1)]]);
        let messages: Vec<_> = out.diagnostics.messages().collect();
        assert_eq!(messages, vec!["trimmed whitespace in 2 cell(s)", "1 row removed with missing values"]);
    }

    #[test]
    fn mean_fill_only_touches_numeric_columns() {
        let schema = Schema::new(vec![
            Field::new("name", DataType::Utf8),
            Field::new("score", DataType::Float64),
            Field::new("n", DataType::Int64),
        ]);
        let input = RowSet::new(
            schema,
            vec![
                vec![text("a"), Value::Float64(1.0), Value::Int64(1)],
                vec![Value::Null, Value::Null, Value::Null],
                vec![text("c"), Value::Float64(4.0), Value::Int64(2)],
            ],
        );
        let config = CleanConfig {
            missing_value_policy: Some(MissingValuePolicy::MeanFill),
            ..CleanConfig::default()
        };
        let out = apply(&config, &input, &ctx()).unwrap();
        assert_eq!(out.rows.rows[1], vec![Value::Null, Value::Float64(2.5), Value::Int64(2)]);
        assert_eq!(out.diagnostics.changes.len(), 2);
    }

    #[test]
    fn forward_fill_copies_previous_value() {
        let schema = Schema::new(vec![Field::new("school", DataType::Utf8)]);
        let input = RowSet::new(
            schema,
            vec![vec![Value::Null], vec![text("North")], vec![Value::Null], vec![Value::Null]],
        );
        let config = CleanConfig {
            missing_value_policy: Some(MissingValuePolicy::ForwardFill),
            ..CleanConfig::default()
        };
        let out = apply(&config, &input, &ctx()).unwrap();
        assert_eq!(
            out.rows.rows,
            vec![vec![Value::Null], vec![text("North")], vec![text("North")], vec![text("North")]]
        );
        assert_eq!(
            out.diagnostics.messages().collect::<Vec<_>>(),
            vec!["forward-filled 2 missing value(s) in 'school'"]
        );
    }

    #[test]
    fn unknown_dedupe_column_fails() {
        let err = apply(&CleanConfig::dedupe_by("student"), &students(&[("a", 1)]), &ctx()).unwrap_err();
        assert!(matches!(err, StageError::MissingColumn { column, .. } if column == "student"));
    }

    #[test]
    fn blank_dedupe_column_is_invalid_config() {
        assert!(CleanConfig::dedupe_by(" ").validate().is_err());
        assert!(
            CleanConfig {
                dedupe_by: Some(KeyColumns::Many(vec![])),
                ..CleanConfig::default()
            }
            .validate()
            .is_err()
        );
    }
}
