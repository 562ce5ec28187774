//! Join stage: joins a named table onto the stage input on a shared key column.
//!
//! The right table's key must be unique; a repeated key fails the stage with
//! [`StageError::DuplicateKey`] rather than fanning rows out. Right-side columns whose names clash
//! with the input get a `_right` suffix. In a full join the key column is coalesced and unmatched
//! right rows follow the input rows, in right-table order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigResult, StageError, StageOutcome};
use crate::processing::group::{first_duplicate, key_has_null, resolve_column, row_key, RowKey};
use crate::types::{Field, RowSet, Schema, Value};

use super::registry::invalid;
use super::{rows_phrase, ChangeRecord, StageContext, StageDiagnostics, StageKind, StageOutput};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Full,
}

impl JoinType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Inner => "inner",
            Self::Left => "left",
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct JoinConfig {
    pub join_type: JoinType,
    /// Name of the dataset table joined onto the stage input.
    pub right: String,
    /// Key column present in both tables.
    pub on: String,
    pub consistency_check: bool,
}

impl JoinConfig {
    pub fn new(join_type: JoinType, right: impl Into<String>, on: impl Into<String>) -> Self {
        Self {
            join_type,
            right: right.into(),
            on: on.into(),
            consistency_check: false,
        }
    }

    pub(crate) fn validate(&self) -> ConfigResult<()> {
        if self.right.trim().is_empty() {
            return Err(invalid(StageKind::Join, "right", "table name is empty"));
        }
        if self.on.trim().is_empty() {
            return Err(invalid(StageKind::Join, "on", "key column is empty"));
        }
        Ok(())
    }
}

pub fn apply(config: &JoinConfig, input: &RowSet, ctx: &StageContext) -> StageOutcome<StageOutput> {
    let right = ctx.table(&config.right)?;
    let left_key = resolve_column(&input.schema, &config.on)?;
    let right_key = resolve_column(&right.schema, &config.on)?;

    if let Some(key) = first_duplicate(&right.rows, &[right_key]) {
        return Err(StageError::DuplicateKey {
            column: format!("{}.{}", config.right, config.on),
            key,
        });
    }

    let right_cols: Vec<usize> = (0..right.schema.len()).filter(|&i| i != right_key).collect();
    let schema = joined_schema(&input.schema, &right.schema, &right_cols);

    let index: HashMap<RowKey, usize> = right
        .rows
        .iter()
        .enumerate()
        .filter_map(|(idx, row)| {
            let key = row_key(row, &[right_key]);
            (!key_has_null(&key)).then_some((key, idx))
        })
        .collect();

    let mut matched_right = vec![false; right.row_count()];
    let mut unmatched_left = 0usize;
    let mut rows = Vec::with_capacity(input.row_count());

    for row in &input.rows {
        let key = row_key(row, &[left_key]);
        let hit = if key_has_null(&key) { None } else { index.get(&key).copied() };
        match hit {
            Some(r) => {
                matched_right[r] = true;
                let mut out = row.clone();
                out.extend(right_cols.iter().map(|&c| right.rows[r][c].clone()));
                rows.push(out);
            }
            None => {
                unmatched_left += 1;
                if config.join_type != JoinType::Inner {
                    let mut out = row.clone();
                    out.extend(right_cols.iter().map(|_| Value::Null));
                    rows.push(out);
                }
            }
        }
    }

    let mut unmatched_right = 0usize;
    if config.join_type == JoinType::Full {
        for (r, right_row) in right.rows.iter().enumerate() {
            if matched_right[r] {
                continue;
            }
            unmatched_right += 1;
            let mut out = vec![Value::Null; input.schema.len()];
            out[left_key] = right_row[right_key].clone();
            out.extend(right_cols.iter().map(|&c| right_row[c].clone()));
            rows.push(out);
        }
    }

    if config.consistency_check {
        let mut nulls = rows.iter().enumerate().filter(|(_, row)| row[left_key].is_null());
        if let Some((sample_row, _)) = nulls.next() {
            return Err(StageError::NullJoinKeys {
                column: config.on.clone(),
                count: 1 + nulls.count(),
                sample_row,
            });
        }
    }

    let mut diagnostics = StageDiagnostics::new(input.row_count());
    let label = format!("{} join with '{}' on '{}'", config.join_type.as_str(), config.right, config.on);
    if unmatched_left > 0 {
        let effect = match config.join_type {
            JoinType::Inner => "dropped",
            _ => "kept with empty right columns",
        };
        diagnostics.record(ChangeRecord::new(
            "joinType",
            format!("{label}: {} without a match {effect}", rows_phrase(unmatched_left)),
        ));
    }
    if unmatched_right > 0 {
        diagnostics.record(ChangeRecord::new(
            "joinType",
            format!("{label}: {} only in '{}' appended", rows_phrase(unmatched_right), config.right),
        ));
    }

    let rows = RowSet::new(schema, rows);
    diagnostics.rows_out = rows.row_count();
    Ok(StageOutput { rows, diagnostics })
}

fn joined_schema(left: &Schema, right: &Schema, right_cols: &[usize]) -> Schema {
    let mut fields = left.fields.clone();
    for &c in right_cols {
        let source = &right.fields[c];
        let mut name = source.name.clone();
        while fields.iter().any(|f| f.name == name) {
            name.push_str("_right");
        }
        fields.push(Field {
            name,
            ..source.clone()
        });
    }
    Schema::new(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::RowExecutor;
    use crate::types::DataType;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn text(s: &str) -> Value {
        Value::Utf8(s.to_string())
    }

    fn students() -> RowSet {
        let schema = Schema::new(vec![Field::new("id", DataType::Utf8), Field::new("name", DataType::Utf8)]);
        let rows = ["S001", "S002", "S003", "S004", "S005"]
            .iter()
            .map(|id| vec![text(id), text(&format!("student {id}"))])
            .collect();
        RowSet::new(schema, rows)
    }

    fn enrollments(ids: &[&str]) -> RowSet {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Utf8),
            Field::new("name", DataType::Utf8),
            Field::new("credits", DataType::Int64),
        ]);
        let rows = ids
            .iter()
            .enumerate()
            .map(|(i, id)| vec![text(id), text("enrolled"), Value::Int64(i as i64)])
            .collect();
        RowSet::new(schema, rows)
    }

    fn ctx(right: RowSet) -> StageContext {
        let tables = BTreeMap::from([("enrollments".to_string(), Arc::new(right))]);
        StageContext::new(Arc::new(RowExecutor::default())).with_tables(Arc::new(tables))
    }

    #[test]
    fn inner_join_keeps_matching_rows_only() {
        let ctx = ctx(enrollments(&["S002", "S004", "S005", "S009"]));
        let out = apply(&JoinConfig::new(JoinType::Inner, "enrollments", "id"), &students(), &ctx).unwrap();
        assert_eq!(out.rows.row_count(), 3);
        assert_eq!(out.rows.columns(), vec!["id", "name", "name_right", "credits"]);
        assert_eq!(
            out.diagnostics.messages().collect::<Vec<_>>(),
            vec!["inner join with 'enrollments' on 'id': 2 rows without a match dropped"]
        );
    }

    #[test]
    fn left_join_pads_unmatched_rows_with_nulls() {
        let ctx = ctx(enrollments(&["S002", "S004", "S005"]));
        let out = apply(&JoinConfig::new(JoinType::Left, "enrollments", "id"), &students(), &ctx).unwrap();
        assert_eq!(out.rows.row_count(), 5);
        assert_eq!(out.rows.value(0, "credits"), Some(&Value::Null));
        assert_eq!(out.rows.value(1, "credits"), Some(&Value::Int64(0)));
    }

    #[test]
    fn full_join_appends_right_only_rows_with_coalesced_key() {
        let ctx = ctx(enrollments(&["S002", "S009"]));
        let out = apply(&JoinConfig::new(JoinType::Full, "enrollments", "id"), &students(), &ctx).unwrap();
        assert_eq!(out.rows.row_count(), 6);
        assert_eq!(out.rows.value(5, "id"), Some(&text("S009")));
        assert_eq!(out.rows.value(5, "name"), Some(&Value::Null));
        assert_eq!(out.diagnostics.changes.len(), 2);
    }

    #[test]
    fn duplicate_right_keys_fail_loudly() {
        let ctx = ctx(enrollments(&["S002", "S002"]));
        let err = apply(&JoinConfig::new(JoinType::Inner, "enrollments", "id"), &students(), &ctx).unwrap_err();
        assert_eq!(
            err,
            StageError::DuplicateKey {
                column: "enrollments.id".into(),
                key: "S002".into()
            }
        );
    }

    #[test]
    fn consistency_check_rejects_null_keys() {
        let mut input = students();
        input.rows[3][0] = Value::Null;
        let ctx = ctx(enrollments(&["S001"]));
        let config = JoinConfig {
            consistency_check: true,
            ..JoinConfig::new(JoinType::Left, "enrollments", "id")
        };
        let err = apply(&config, &input, &ctx).unwrap_err();
        assert_eq!(
            err,
            StageError::NullJoinKeys {
                column: "id".into(),
                count: 1,
                sample_row: 3
            }
        );
    }

    #[test]
    fn missing_table_fails() {
        let ctx = StageContext::new(Arc::new(RowExecutor::default()));
        let err = apply(&JoinConfig::new(JoinType::Inner, "enrollments", "id"), &students(), &ctx).unwrap_err();
        assert_eq!(err, StageError::MissingTable { name: "enrollments".into() });
    }
}
